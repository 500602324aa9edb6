//! Discrete tick scheduler.
//!
//! Jobs are bucketed under the absolute tick at which they next fire. A job
//! records the tick it is bucketed under, so stale bucket entries left behind by
//! a reschedule or cancel are recognised and skipped when their tick comes up.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::timing::{TickRate, Timing};

#[derive(Debug)]
struct ScheduledJob {
    timing: Timing,
    executing: bool,
    due: Option<u64>,
}

/// Tick-driven job timer. Owned and driven by a single task.
#[derive(Debug)]
pub struct TickScheduler {
    rate: TickRate,
    running: bool,
    current_tick: u64,
    buckets: HashMap<u64, Vec<String>>,
    jobs: HashMap<String, ScheduledJob>,
}

impl TickScheduler {
    pub fn new(rate: TickRate) -> Self {
        Self {
            rate,
            running: false,
            current_tick: 0,
            buckets: HashMap::new(),
            jobs: HashMap::new(),
        }
    }

    pub fn rate(&self) -> TickRate {
        self.rate
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn is_executing(&self, id: &str) -> bool {
        self.jobs.get(id).is_some_and(|job| job.executing)
    }

    /// Absolute tick the job is bucketed under, if any.
    pub fn scheduled_tick(&self, id: &str) -> Option<u64> {
        self.jobs.get(id).and_then(|job| job.due)
    }

    /// Register or replace a job's timing. The executing flag survives a replace.
    pub fn add_job(&mut self, id: &str, timing: Timing, now: DateTime<Utc>) {
        match self.jobs.get_mut(id) {
            Some(job) => {
                job.timing = timing;
                job.due = None;
            }
            None => {
                self.jobs.insert(
                    id.to_string(),
                    ScheduledJob {
                        timing,
                        executing: false,
                        due: None,
                    },
                );
            }
        }
        if self.running {
            self.schedule_next(id, now);
        }
    }

    /// Forget a job. Its bucket entry goes stale and is skipped.
    pub fn cancel_job(&mut self, id: &str) {
        self.jobs.remove(id);
    }

    /// Advance one tick. Returns the ids to dispatch, in bucket order.
    /// A job still executing is never returned; a continuous one stays armed.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        self.current_tick += 1;
        let tick = self.current_tick;
        let Some(bucket) = self.buckets.remove(&tick) else {
            return Vec::new();
        };

        let mut fired = Vec::new();
        for id in bucket {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.due != Some(tick) {
                continue;
            }
            job.due = None;

            let continuous = job.timing.is_continuous();
            if job.executing {
                if continuous {
                    self.schedule_next(&id, now);
                }
                continue;
            }

            job.executing = true;
            if continuous {
                self.schedule_next(&id, now);
            }
            fired.push(id);
        }
        fired
    }

    /// Report a dispatched job as complete. Non-continuous jobs re-arm from here.
    pub fn finish(&mut self, id: &str, now: DateTime<Utc>) {
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        if !job.executing {
            return;
        }
        job.executing = false;
        if !job.timing.is_continuous() && self.running {
            self.schedule_next(id, now);
        }
    }

    /// Begin consuming ticks. Every registered job gets an initial schedule.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.running = true;
        let ids: Vec<String> = self.jobs.keys().cloned().collect();
        for id in ids {
            self.schedule_next(&id, now);
        }
    }

    /// Stop consuming ticks. Jobs stay registered but unscheduled.
    pub fn stop(&mut self) {
        self.running = false;
        self.current_tick = 0;
        self.buckets.clear();
        for job in self.jobs.values_mut() {
            job.executing = false;
            job.due = None;
        }
    }

    /// Stop and forget every job.
    pub fn clear(&mut self) {
        self.stop();
        self.jobs.clear();
    }

    fn schedule_next(&mut self, id: &str, now: DateTime<Utc>) {
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        job.due = None;

        let delta = job.timing.next_fire_ticks(now, self.rate);
        if delta <= 0 {
            tracing::debug!(job_id = %id, timing = %job.timing, "Job will not fire again");
            return;
        }

        let tick = self.current_tick.saturating_add(delta as u64);
        job.due = Some(tick);
        self.buckets.entry(tick).or_default().push(id.to_string());
    }
}
