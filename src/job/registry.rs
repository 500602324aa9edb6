//! Registry mapping job kinds to builders.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{Job, JobPayload, builtin};
use crate::error::JobError;

type Builder = Arc<dyn Fn(&serde_json::Value) -> Result<Box<dyn Job>, JobError> + Send + Sync>;

/// Builds jobs from payloads. Shared read-only between agents.
#[derive(Clone, Default)]
pub struct JobRegistry {
    builders: HashMap<String, Builder>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `echo` and `sleep` kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    /// Register a builder. A later registration for the same kind replaces the earlier one.
    pub fn register<F>(&mut self, kind: &str, builder: F)
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Job>, JobError> + Send + Sync + 'static,
    {
        if self.builders.insert(kind.to_string(), Arc::new(builder)).is_some() {
            tracing::warn!(kind = %kind, "Replaced existing job builder");
        } else {
            tracing::debug!("Registered job kind: {}", kind);
        }
    }

    /// Rebuild an executable job from its payload.
    pub fn build(&self, payload: &JobPayload) -> Result<Box<dyn Job>, JobError> {
        let builder = self
            .builders
            .get(&payload.kind)
            .ok_or_else(|| JobError::UnknownKind {
                kind: payload.kind.clone(),
            })?;
        builder(&payload.params)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.builders.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
