//! Agent side — the worker loop that executes dispatched jobs.

pub mod runtime;

pub use runtime::Agent;
