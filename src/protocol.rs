//! Control messages exchanged between the coordinator and agents.
//!
//! | Kind             | Tag | Direction             | Payload            |
//! |------------------|-----|-----------------------|--------------------|
//! | `JobAssignment`  | 0   | coordinator -> agent  | [`JobAssignment`]  |
//! | `JobFinished`    | 2   | agent -> coordinator  | empty              |
//! | `StopSending`    | 3   | agent -> coordinator  | empty              |
//! | `LastMessage`    | 4   | coordinator -> agent  | empty              |
//! | `KillMe`         | 5   | agent -> coordinator  | empty              |
//! | `StopExecution`  | 6   | coordinator -> agent  | [`StopExecution`]  |

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::job::JobPayload;

/// Protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JobAssignment,
    JobFinished,
    StopSending,
    LastMessage,
    KillMe,
    StopExecution,
}

impl MessageKind {
    pub fn tag(self) -> u16 {
        match self {
            MessageKind::JobAssignment => 0,
            MessageKind::JobFinished => 2,
            MessageKind::StopSending => 3,
            MessageKind::LastMessage => 4,
            MessageKind::KillMe => 5,
            MessageKind::StopExecution => 6,
        }
    }

    pub fn from_tag(tag: u16) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(MessageKind::JobAssignment),
            2 => Ok(MessageKind::JobFinished),
            3 => Ok(MessageKind::StopSending),
            4 => Ok(MessageKind::LastMessage),
            5 => Ok(MessageKind::KillMe),
            6 => Ok(MessageKind::StopExecution),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::JobAssignment => "job-assignment",
            MessageKind::JobFinished => "job-finished",
            MessageKind::StopSending => "stop-sending",
            MessageKind::LastMessage => "last-message",
            MessageKind::KillMe => "kill-me",
            MessageKind::StopExecution => "stop-execution",
        };
        f.write_str(name)
    }
}

/// A typed message: a tag plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u16,
    pub payload: Vec<u8>,
}

/// Payload of a job-assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: String,
    pub job: JobPayload,
}

/// Payload of a stop-execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopExecution {
    pub job_id: String,
}

impl Message {
    fn empty(kind: MessageKind) -> Self {
        Self {
            tag: kind.tag(),
            payload: Vec::new(),
        }
    }

    fn encoded<T: Serialize>(kind: MessageKind, body: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(body).map_err(|e| ProtocolError::Encode {
            kind: kind.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            tag: kind.tag(),
            payload,
        })
    }

    pub fn job_assignment(assignment: &JobAssignment) -> Result<Self, ProtocolError> {
        Self::encoded(MessageKind::JobAssignment, assignment)
    }

    pub fn stop_execution(job_id: &str) -> Result<Self, ProtocolError> {
        Self::encoded(
            MessageKind::StopExecution,
            &StopExecution {
                job_id: job_id.to_string(),
            },
        )
    }

    pub fn job_finished() -> Self {
        Self::empty(MessageKind::JobFinished)
    }

    pub fn stop_sending() -> Self {
        Self::empty(MessageKind::StopSending)
    }

    pub fn last_message() -> Self {
        Self::empty(MessageKind::LastMessage)
    }

    pub fn kill_me() -> Self {
        Self::empty(MessageKind::KillMe)
    }

    pub fn kind(&self) -> Result<MessageKind, ProtocolError> {
        MessageKind::from_tag(self.tag)
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let kind = self
            .kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|_| format!("type {}", self.tag));
        if self.payload.is_empty() {
            return Err(ProtocolError::Decode {
                kind,
                reason: "empty payload".to_string(),
            });
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Decode {
            kind,
            reason: e.to_string(),
        })
    }
}
