//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Length of one scheduler tick.
    pub tick: Duration,
    /// Upper bound on a single reactor pump before a patrol pass runs.
    pub patrol_period: Duration,
    /// How long shutdown waits for agents to exit before giving up.
    pub shutdown_timeout: Duration,
    /// Cadence of the last-message broadcast during shutdown.
    pub last_message_retry: Duration,
    /// Send stop-execution to the assigned agent when a running job is removed.
    pub stop_removed_jobs: bool,
    /// Capacity of the observability event channel.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            patrol_period: Duration::from_secs(300), // 5 minutes
            shutdown_timeout: Duration::from_secs(30),
            last_message_retry: Duration::from_secs(1),
            stop_removed_jobs: true,
            event_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    /// Build from `TICKVISOR_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            tick: env_millis("TICKVISOR_TICK_MS")?.unwrap_or(defaults.tick),
            patrol_period: env_secs("TICKVISOR_PATROL_SECS")?.unwrap_or(defaults.patrol_period),
            shutdown_timeout: env_secs("TICKVISOR_SHUTDOWN_TIMEOUT_SECS")?
                .unwrap_or(defaults.shutdown_timeout),
            last_message_retry: env_millis("TICKVISOR_LAST_MESSAGE_RETRY_MS")?
                .unwrap_or(defaults.last_message_retry),
            stop_removed_jobs: env_bool("TICKVISOR_STOP_REMOVED_JOBS")?
                .unwrap_or(defaults.stop_removed_jobs),
            event_capacity: env_parse::<usize>("TICKVISOR_EVENT_CAPACITY")?
                .unwrap_or(defaults.event_capacity),
        })
    }
}

/// Agent (worker) configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Keep an idle agent alive this long, awaiting reuse. `None` exits after each job.
    pub idle_wait: Option<Duration>,
    /// Ask the coordinator to kill the process instead of exiting on its own.
    pub passive_shutdown: bool,
    /// Upper bound on a single reactor pump.
    pub patrol_period: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            idle_wait: None,
            passive_shutdown: false,
            patrol_period: Duration::from_secs(60), // 1 minute
        }
    }
}

impl AgentConfig {
    /// Set the idle wait. Zero disables it.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = (!idle_wait.is_zero()).then_some(idle_wait);
        self
    }

    /// Switch between active (`false`) and passive (`true`) shutdown.
    pub fn with_passive_shutdown(mut self, passive: bool) -> Self {
        self.passive_shutdown = passive;
        self
    }

    /// Build from `TICKVISOR_AGENT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(idle) = env_secs("TICKVISOR_AGENT_IDLE_WAIT_SECS")? {
            config = config.with_idle_wait(idle);
        }
        if let Some(passive) = env_bool("TICKVISOR_AGENT_PASSIVE_SHUTDOWN")? {
            config.passive_shutdown = passive;
        }
        if let Some(patrol) = env_secs("TICKVISOR_AGENT_PATROL_SECS")? {
            config.patrol_period = patrol;
        }
        Ok(config)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    match env_parse::<u64>(key)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        other => Ok(other.map(Duration::from_millis)),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}' is not a boolean"),
            }),
        },
        Err(_) => Ok(None),
    }
}
