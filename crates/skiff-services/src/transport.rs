//! Transport seams — how a connection is (re)established.
//!
//! The protocol runs over any ordered byte stream. A `Connector` re-dials the
//! last known peer address; `ReconnectPolicy` spaces the attempts with
//! exponential backoff and gives up after a fixed number of tries.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use skiff_core::SkiffConfig;

/// Opens a fresh connection to a fixed peer.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// For logs.
    fn describe(&self) -> String;
}

/// Dials a TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        self.addr.to_string()
    }
}

/// Backoff schedule: `base`, `2 * base`, `4 * base`, ... for at most
/// `max_attempts` tries.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 5)
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &SkiffConfig) -> Self {
        Self::new(
            config.connection.reconnect_base(),
            config.connection.max_reconnect_attempts,
        )
    }

    pub fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.base.saturating_mul(1u32 << self.attempt.min(16));
        self.attempt += 1;
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Re-dial with backoff until a connection succeeds or attempts run out.
pub async fn reconnect<C: Connector>(
    connector: &C,
    policy: &mut ReconnectPolicy,
) -> Result<C::Stream, ConnectError> {
    let mut last_error = None;
    while policy.should_retry() {
        let delay = policy.next_delay();
        tracing::info!(
            peer = %connector.describe(),
            attempt = policy.attempt(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        tokio::time::sleep(delay).await;

        match connector.connect().await {
            Ok(stream) => {
                policy.reset();
                return Ok(stream);
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = policy.attempt(), "reconnect attempt failed");
                last_error = Some(e.to_string());
            }
        }
    }
    Err(ConnectError::Exhausted {
        attempts: policy.max_attempts(),
        last_error: last_error.unwrap_or_else(|| "no attempts allowed".to_string()),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("gave up after {attempts} reconnect attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("connect failed: {0}")]
    Io(#[from] io::Error),
}
