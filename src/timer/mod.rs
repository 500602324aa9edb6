//! Tick-based job timing.

mod scheduler;
mod timing;

pub use scheduler::TickScheduler;
pub use timing::{CronTiming, Period, PeriodicTiming, TickRate, Timing};
