//! Error types for tickvisor.

/// Top-level error type for the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Timing error: {0}")]
    Timing(#[from] TimingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Shutdown requested: {reason}")]
    Aborted { reason: String },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors building a timing strategy.
#[derive(Debug, thiserror::Error)]
pub enum TimingError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid period '{input}': {reason}")]
    InvalidPeriod { input: String, reason: String },
}

/// Malformed or unexpected control messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownType(u16),

    #[error("Failed to decode {kind} payload: {reason}")]
    Decode { kind: String, reason: String },

    #[error("Failed to encode {kind} payload: {reason}")]
    Encode { kind: String, reason: String },

    #[error("Missing field '{field}' in {kind} payload")]
    MissingField { kind: String, field: String },

    #[error("Unexpected {kind} message {context}")]
    Unexpected { kind: String, context: String },

    #[error("Stop requested for job {requested}, but job {active} is repeating")]
    StopMismatch { active: String, requested: String },
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel to {peer} is closed")]
    Closed { peer: String },

    #[error("Failed to send to {peer}: {reason}")]
    SendFailed { peer: String, reason: String },

    #[error("Agent {agent_id} lost its connection to the coordinator")]
    Disconnected { agent_id: String },

    #[error("No channel registered for agent {agent_id}")]
    UnknownAgent { agent_id: String },
}

/// Job construction and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No job registered for kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("Invalid parameters for job kind '{kind}': {reason}")]
    InvalidParams { kind: String, reason: String },

    #[error("Job {job_id} failed: {reason}")]
    Failed { job_id: String, reason: String },

    #[error("Job {job_id} panicked: {reason}")]
    Panicked { job_id: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Worker factory errors.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("No runtime available to host agent: {0}")]
    NoRuntime(String),

    #[error("Agent spawn failed: {0}")]
    Failed(String),
}
