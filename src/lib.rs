//! tickvisor — tick-driven job dispatch to a pool of reusable agents.

pub mod agent;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod host;
pub mod job;
pub mod pool;
pub mod protocol;
pub mod state;
pub mod timer;
