//! Progress and lifecycle event streams.
//!
//! Two bounded channels. Progress is high-volume and lossy: when the consumer
//! lags, events are dropped (a later one supersedes them). Lifecycle events
//! are rare and must never be lost, so senders wait for capacity.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::resume::Direction;

/// Default depth for both streams.
pub const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    InProgress,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub transfer_id: u32,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub status: TransferStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Connected {
        peer: String,
    },
    Started {
        transfer_id: u32,
        direction: Direction,
        file_name: String,
        total_bytes: u64,
    },
    Resumed {
        transfer_id: u32,
        direction: Direction,
        remaining_chunks: u64,
    },
    Paused {
        transfer_id: u32,
    },
    Cancelled {
        transfer_id: u32,
    },
    Completed {
        transfer_id: u32,
        direction: Direction,
    },
    ChunkError {
        transfer_id: u32,
        offset: u64,
        reason: String,
    },
    Failed {
        transfer_id: u32,
        reason: String,
    },
    ConnectionLost {
        reason: String,
        permanent: bool,
    },
}

impl LifecycleEvent {
    /// Transfer the event concerns, if any.
    pub fn transfer_id(&self) -> Option<u32> {
        match self {
            LifecycleEvent::Started { transfer_id, .. }
            | LifecycleEvent::Resumed { transfer_id, .. }
            | LifecycleEvent::Paused { transfer_id }
            | LifecycleEvent::Cancelled { transfer_id }
            | LifecycleEvent::Completed { transfer_id, .. }
            | LifecycleEvent::ChunkError { transfer_id, .. }
            | LifecycleEvent::Failed { transfer_id, .. } => Some(*transfer_id),
            LifecycleEvent::Connected { .. } | LifecycleEvent::ConnectionLost { .. } => None,
        }
    }
}

/// Producer side, shared by everything that reports.
#[derive(Clone)]
pub struct EventSink {
    progress: mpsc::Sender<ProgressEvent>,
    lifecycle: mpsc::Sender<LifecycleEvent>,
}

/// Consumer side.
pub struct EventStreams {
    pub progress: mpsc::Receiver<ProgressEvent>,
    pub lifecycle: mpsc::Receiver<LifecycleEvent>,
}

pub fn event_channel(depth: usize) -> (EventSink, EventStreams) {
    let (progress_tx, progress_rx) = mpsc::channel(depth);
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(depth);
    (
        EventSink {
            progress: progress_tx,
            lifecycle: lifecycle_tx,
        },
        EventStreams {
            progress: progress_rx,
            lifecycle: lifecycle_rx,
        },
    )
}

impl EventSink {
    /// Report progress without waiting. Dropped if the consumer lags.
    pub fn progress(&self, event: ProgressEvent) {
        if let Err(e) = self.progress.try_send(event) {
            tracing::debug!(error = %e, "progress event dropped");
        }
    }

    /// Report a lifecycle event, waiting for queue space.
    pub async fn lifecycle(&self, event: LifecycleEvent) {
        tracing::debug!(?event, "lifecycle");
        if self.lifecycle.send(event).await.is_err() {
            tracing::debug!("lifecycle stream closed");
        }
    }
}
