//! Local control surface: one closed set of commands, one match.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::orchestrator::TransferOrchestrator;
use crate::registry::TransferSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    SendFile { path: PathBuf },
    ResumeTransfer { transfer_id: u32 },
    CancelTransfer { transfer_id: u32 },
    Status { transfer_id: u32 },
    ListTransfers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "response", content = "body", rename_all = "snake_case")]
pub enum CommandResponse {
    Started { transfer_id: u32 },
    Resumed { transfer_id: u32 },
    Cancelled { transfer_id: u32 },
    Status(Option<TransferSnapshot>),
    Transfers(Vec<TransferSnapshot>),
    Error(String),
}

/// Run a command against the orchestrator. Failures come back as
/// `CommandResponse::Error`.
pub async fn dispatch(orchestrator: &TransferOrchestrator, command: Command) -> CommandResponse {
    tracing::debug!(?command, "dispatching command");
    let result = match command {
        Command::SendFile { path } => orchestrator
            .send_file(&path)
            .await
            .map(|transfer_id| CommandResponse::Started { transfer_id }),
        Command::ResumeTransfer { transfer_id } => orchestrator
            .resume_transfer(transfer_id)
            .await
            .map(|()| CommandResponse::Resumed { transfer_id }),
        Command::CancelTransfer { transfer_id } => orchestrator
            .cancel_transfer(transfer_id)
            .await
            .map(|()| CommandResponse::Cancelled { transfer_id }),
        Command::Status { transfer_id } => Ok(CommandResponse::Status(orchestrator.status(transfer_id))),
        Command::ListTransfers => Ok(CommandResponse::Transfers(orchestrator.list())),
    };
    result.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "command failed");
        CommandResponse::Error(e.to_string())
    })
}
