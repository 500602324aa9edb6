//! Coordinator side — job scheduling and agent dispatch.
//!
//! Core components:
//! - `coordinator` — Job/agent registries, protocol handling, run loop
//! - `handle` — Cloneable command sender for other tasks

pub mod coordinator;
pub mod handle;

pub use coordinator::{Coordinator, JobRecord};
pub use handle::{Command, CoordinatorHandle};
