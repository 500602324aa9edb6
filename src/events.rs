//! Observability events.
//!
//! Both the coordinator and agents publish [`DispatchEvent`]s on a shared
//! broadcast channel. Events are informational only: a lagging or absent
//! subscriber never affects dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::channel::AgentId;

/// Events emitted by the coordinator and agents.
///
/// `agent_id: None` means the coordinator itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A run loop started.
    Started {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
    },
    /// An agent began executing a job.
    Executing { agent_id: AgentId, job_id: String },
    /// An agent finished executing a job, including any repeat loop.
    Executed {
        agent_id: AgentId,
        job_id: String,
        started_at: DateTime<Utc>,
        runtime_ms: u64,
    },
    /// The coordinator reaped an exited agent.
    AgentExit { agent_id: AgentId, pid: u32 },
    /// An agent lost its link to the coordinator.
    Disconnected { agent_id: AgentId },
    /// The coordinator finished one pump cycle.
    Patrol,
    /// A run loop ended.
    Shutdown {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
    },
    /// A non-fatal error was absorbed.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        message: String,
    },
    /// A message type the receiver does not handle.
    UnhandledMessage { agent_id: AgentId, tag: u16 },
}

impl DispatchEvent {
    /// Get the action type name (matches serde tag).
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Executing { .. } => "executing",
            Self::Executed { .. } => "executed",
            Self::AgentExit { .. } => "agent_exit",
            Self::Disconnected { .. } => "disconnected",
            Self::Patrol => "patrol",
            Self::Shutdown { .. } => "shutdown",
            Self::Error { .. } => "error",
            Self::UnhandledMessage { .. } => "unhandled_message",
        }
    }
}

/// Broadcast bus for [`DispatchEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: DispatchEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
