//! Repeat policies for jobs that run several times per dispatch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decides whether a job body runs again within the same dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Repeater {
    /// Repeat while the remaining count is positive; each check uses one.
    Countdown {
        remaining: u32,
        #[serde(with = "secs")]
        interval: Duration,
    },
    /// Repeat until stopped from outside.
    Perpetual {
        #[serde(with = "secs")]
        interval: Duration,
    },
    /// Repeat while less than `duration_secs` has passed since `start`.
    /// Without a start, the first check latches it.
    TimeBounded {
        #[serde(default)]
        start: Option<DateTime<Utc>>,
        duration_secs: f64,
        #[serde(with = "secs")]
        interval: Duration,
    },
}

impl Repeater {
    pub fn countdown(count: u32, interval: Duration) -> Self {
        Repeater::Countdown {
            remaining: count,
            interval,
        }
    }

    pub fn perpetual(interval: Duration) -> Self {
        Repeater::Perpetual { interval }
    }

    pub fn time_bounded(start: Option<DateTime<Utc>>, duration: Duration, interval: Duration) -> Self {
        Repeater::TimeBounded {
            start,
            duration_secs: duration.as_secs_f64(),
            interval,
        }
    }

    /// Whether another iteration may run at `now`. Countdown consumes one repetition.
    pub fn is_repeatable(&mut self, now: DateTime<Utc>) -> bool {
        match self {
            Repeater::Countdown { remaining, .. } => {
                if *remaining == 0 {
                    return false;
                }
                *remaining -= 1;
                true
            }
            Repeater::Perpetual { .. } => true,
            Repeater::TimeBounded {
                start,
                duration_secs,
                ..
            } => {
                let start = *start.get_or_insert(now);
                let elapsed = (now - start)
                    .num_microseconds()
                    .map(|us| us as f64 / 1_000_000.0)
                    .unwrap_or(f64::MAX);
                elapsed < *duration_secs
            }
        }
    }

    /// Pause between two iterations.
    pub fn interval(&self) -> Duration {
        match self {
            Repeater::Countdown { interval, .. }
            | Repeater::Perpetual { interval }
            | Repeater::TimeBounded { interval, .. } => *interval,
        }
    }
}

/// Durations on the wire are fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
