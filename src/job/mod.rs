//! Executable jobs and the payload that carries them to an agent.
//!
//! The coordinator never ships code. It sends a [`JobPayload`] naming a job
//! kind and its parameters; the agent rebuilds the job from its own
//! [`JobRegistry`].

pub mod builtin;
pub mod registry;
pub mod repeater;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::channel::AgentId;
use crate::error::JobError;

pub use registry::JobRegistry;
pub use repeater::Repeater;

/// Context handed to every job invocation.
#[derive(Debug, Clone, Serialize)]
pub struct JobContext {
    pub job_id: String,
    pub agent_id: AgentId,
    /// Zero-based iteration within the current dispatch.
    pub iteration: u32,
}

/// A unit of work an agent can run.
#[async_trait]
pub trait Job: Send {
    /// Run one iteration. Not interrupted once started.
    async fn execute(&mut self, ctx: &JobContext) -> Result<(), JobError>;

    /// Repeat policy for this dispatch, if the job loops.
    fn repeater(&self) -> Option<Repeater> {
        None
    }
}

/// Serialized form of a job: a registered kind plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl JobPayload {
    pub fn new(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}
