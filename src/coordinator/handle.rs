//! Cloneable handle for driving a running coordinator from other tasks.

use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::job::JobPayload;
use crate::timer::Timing;

/// Commands accepted by the coordinator loop.
#[derive(Debug)]
pub enum Command {
    AddJob {
        id: String,
        payload: JobPayload,
        timing: Timing,
    },
    RemoveJob {
        id: String,
    },
    StopJob {
        id: String,
    },
    /// Begin shutdown. A reason is surfaced as the run error.
    Shutdown {
        reason: Option<String>,
    },
}

/// Sends [`Command`]s to a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    pub fn add_job(
        &self,
        id: impl Into<String>,
        payload: JobPayload,
        timing: Timing,
    ) -> Result<(), ChannelError> {
        self.send(Command::AddJob {
            id: id.into(),
            payload,
            timing,
        })
    }

    pub fn remove_job(&self, id: impl Into<String>) -> Result<(), ChannelError> {
        self.send(Command::RemoveJob { id: id.into() })
    }

    pub fn stop_job(&self, id: impl Into<String>) -> Result<(), ChannelError> {
        self.send(Command::StopJob { id: id.into() })
    }

    pub fn shutdown(&self, reason: Option<String>) -> Result<(), ChannelError> {
        self.send(Command::Shutdown { reason })
    }

    fn send(&self, command: Command) -> Result<(), ChannelError> {
        self.tx.send(command).map_err(|_| ChannelError::Closed {
            peer: "coordinator".to_string(),
        })
    }
}
