//! Built-in job kinds.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Job, JobContext, JobRegistry, Repeater};
use crate::error::JobError;

pub(super) fn register(registry: &mut JobRegistry) {
    registry.register("echo", |params| Ok(Box::new(EchoJob::from_params(params)?)));
    registry.register("sleep", |params| Ok(Box::new(SleepJob::from_params(params)?)));
}

fn parse<T: for<'de> Deserialize<'de>>(kind: &str, params: &serde_json::Value) -> Result<T, JobError> {
    let params = if params.is_null() {
        serde_json::json!({})
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| JobError::InvalidParams {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct EchoParams {
    message: String,
    #[serde(default)]
    repeat: Option<Repeater>,
}

/// Logs a message, optionally on a repeat loop.
#[derive(Debug)]
pub struct EchoJob {
    message: String,
    repeat: Option<Repeater>,
}

impl EchoJob {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            repeat: None,
        }
    }

    pub fn from_params(params: &serde_json::Value) -> Result<Self, JobError> {
        let params: EchoParams = parse("echo", params)?;
        Ok(Self {
            message: params.message,
            repeat: params.repeat,
        })
    }
}

#[async_trait]
impl Job for EchoJob {
    async fn execute(&mut self, ctx: &JobContext) -> Result<(), JobError> {
        tracing::info!(
            job_id = %ctx.job_id,
            agent_id = %ctx.agent_id,
            iteration = ctx.iteration,
            "{}",
            self.message
        );
        Ok(())
    }

    fn repeater(&self) -> Option<Repeater> {
        self.repeat.clone()
    }
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    duration_ms: u64,
}

/// Holds its agent busy for a fixed time.
#[derive(Debug)]
pub struct SleepJob {
    duration: Duration,
}

impl SleepJob {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, JobError> {
        let params: SleepParams = parse("sleep", params)?;
        Ok(Self {
            duration: Duration::from_millis(params.duration_ms),
        })
    }
}

#[async_trait]
impl Job for SleepJob {
    async fn execute(&mut self, ctx: &JobContext) -> Result<(), JobError> {
        tracing::debug!(job_id = %ctx.job_id, "Sleeping for {:?}", self.duration);
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}
