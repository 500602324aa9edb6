//! Timing strategies: how many ticks until a job fires next.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Months, TimeDelta, Timelike, Utc};

use crate::error::TimingError;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Scheduler tick rate, kept as `ticks` ticks per `span_nanos` so that rates
/// which do not divide a second evenly convert spans without drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRate {
    span_nanos: i128,
    ticks: i128,
}

impl TickRate {
    /// A rate where one tick lasts `tick`. Sub-nanosecond ticks are rounded up to 1ns.
    pub fn new(tick: Duration) -> Self {
        Self {
            span_nanos: (tick.as_nanos() as i128).max(1),
            ticks: 1,
        }
    }

    /// A rate of `ticks` ticks per second.
    pub fn per_second(ticks: u32) -> Self {
        Self {
            span_nanos: NANOS_PER_SEC,
            ticks: i128::from(ticks.max(1)),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_nanos((self.span_nanos / self.ticks).max(1) as u64)
    }

    pub fn ticks_per_second(&self) -> f64 {
        (self.ticks * NANOS_PER_SEC) as f64 / self.span_nanos as f64
    }

    /// Whole ticks needed to cover `span`, rounded up. Non-positive spans yield `<= 0`.
    pub fn ticks_in(&self, span: TimeDelta) -> i64 {
        let secs = span.num_seconds();
        let subsec = (span - TimeDelta::seconds(secs))
            .num_nanoseconds()
            .unwrap_or(0);
        let nanos = i128::from(secs) * NANOS_PER_SEC + i128::from(subsec);
        if nanos <= 0 {
            return if nanos == 0 { 0 } else { -1 };
        }
        let scaled = nanos.saturating_mul(self.ticks);
        let ticks = (scaled + self.span_nanos - 1) / self.span_nanos;
        i64::try_from(ticks).unwrap_or(i64::MAX)
    }
}

impl Default for TickRate {
    fn default() -> Self {
        Self::per_second(1)
    }
}

/// A calendar-aware interval: whole months first, then a fixed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    months: u32,
    span: TimeDelta,
}

impl Period {
    pub fn new(months: u32, span: TimeDelta) -> Self {
        Self { months, span }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::from_std(Duration::from_secs(secs))
    }

    pub fn from_months(months: u32) -> Self {
        Self::new(months, TimeDelta::zero())
    }

    /// Convert a std duration. Spans beyond chrono's range saturate near its upper bound.
    pub fn from_std(duration: Duration) -> Self {
        let span = TimeDelta::from_std(duration)
            .unwrap_or_else(|_| TimeDelta::seconds(i64::MAX / 1_000 - 31_536_000));
        Self::new(0, span)
    }

    pub fn months(&self) -> u32 {
        self.months
    }

    pub fn span(&self) -> TimeDelta {
        self.span
    }

    /// The instant one period after `start`, or `None` if it is out of range.
    pub fn after(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        start
            .checked_add_months(Months::new(self.months))?
            .checked_add_signed(self.span)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P")?;
        if self.months > 0 {
            write!(f, "{}M", self.months)?;
        }
        let millis = self.span.num_milliseconds();
        if millis != 0 || self.months == 0 {
            if millis % 1000 == 0 {
                write!(f, "T{}S", millis / 1000)?;
            } else {
                write!(f, "T{}.{:03}S", millis / 1000, (millis % 1000).abs())?;
            }
        }
        Ok(())
    }
}

/// Parses ISO-8601 durations: `PT1S`, `P500DT300S`, `P3Y5MT1H50M30.5S`, `P2W`.
impl FromStr for Period {
    type Err = TimingError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TimingError::InvalidPeriod {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let body = input
            .trim()
            .strip_prefix('P')
            .ok_or_else(|| invalid("must start with 'P'"))?;
        if body.is_empty() {
            return Err(invalid("no components"));
        }

        let (date, time) = match body.split_once('T') {
            Some((_, "")) => return Err(invalid("no components after 'T'")),
            Some((date, time)) => (date, Some(time)),
            None => (body, None),
        };

        let mut months: u64 = 0;
        let mut secs: i64 = 0;
        let mut nanos: i64 = 0;

        for (value, unit) in components(date).map_err(|r| invalid(&r))? {
            let n = whole(value).ok_or_else(|| invalid("date components must be integers"))?;
            match unit {
                'Y' => months = months.saturating_add(n.saturating_mul(12)),
                'M' => months = months.saturating_add(n),
                'W' => secs = add_secs(secs, n, 7 * 86_400).ok_or_else(|| invalid("too large"))?,
                'D' => secs = add_secs(secs, n, 86_400).ok_or_else(|| invalid("too large"))?,
                other => return Err(invalid(&format!("unknown date unit '{other}'"))),
            }
        }

        for (value, unit) in components(time.unwrap_or("")).map_err(|r| invalid(&r))? {
            match unit {
                'H' | 'M' => {
                    let n = whole(value)
                        .ok_or_else(|| invalid("only seconds may be fractional"))?;
                    let scale = if unit == 'H' { 3_600 } else { 60 };
                    secs = add_secs(secs, n, scale).ok_or_else(|| invalid("too large"))?;
                }
                'S' => {
                    let (int, frac) = value.split_once('.').unwrap_or((value, ""));
                    let n = whole(int).ok_or_else(|| invalid("malformed seconds"))?;
                    secs = add_secs(secs, n, 1).ok_or_else(|| invalid("too large"))?;
                    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(invalid("malformed fractional seconds"));
                    }
                    if !frac.is_empty() {
                        nanos = format!("{frac:0<9}")
                            .parse::<i64>()
                            .map_err(|_| invalid("malformed fractional seconds"))?;
                    }
                }
                other => return Err(invalid(&format!("unknown time unit '{other}'"))),
            }
        }

        let months = u32::try_from(months).map_err(|_| invalid("too many months"))?;
        let span = TimeDelta::try_seconds(secs)
            .and_then(|s| s.checked_add(&TimeDelta::nanoseconds(nanos)))
            .ok_or_else(|| invalid("too large"))?;
        Ok(Self::new(months, span))
    }
}

/// Split `12D3H` style text into `("12", 'D'), ("3", 'H')`.
fn components(part: &str) -> Result<Vec<(&str, char)>, String> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, ch) in part.char_indices() {
        if ch.is_ascii_digit() || ch == '.' {
            continue;
        }
        if !ch.is_ascii_uppercase() {
            return Err(format!("unexpected character '{ch}'"));
        }
        let value = &part[start..idx];
        if value.is_empty() {
            return Err(format!("unit '{ch}' has no value"));
        }
        out.push((value, ch));
        start = idx + ch.len_utf8();
    }
    if start != part.len() {
        return Err("trailing number without a unit".to_string());
    }
    Ok(out)
}

fn whole(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn add_secs(acc: i64, n: u64, scale: i64) -> Option<i64> {
    i64::try_from(n).ok()?.checked_mul(scale)?.checked_add(acc)
}

/// Fires on a fixed, calendar-aware period.
#[derive(Debug, Clone)]
pub struct PeriodicTiming {
    period: Period,
    continuous: bool,
}

impl PeriodicTiming {
    pub fn new(period: Period, continuous: bool) -> Self {
        Self { period, continuous }
    }

    pub fn period(&self) -> Period {
        self.period
    }
}

/// Fires on a cron schedule. Always continuous.
#[derive(Debug, Clone)]
pub struct CronTiming {
    expression: String,
    schedule: cron::Schedule,
}

impl CronTiming {
    /// Parse a cron expression. Classic 5-field expressions (minute resolution) are
    /// accepted alongside the 6/7-field form with seconds and an optional year.
    pub fn parse(expression: &str) -> Result<Self, TimingError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => format!("0 {}", fields.join(" ")),
            6 | 7 => fields.join(" "),
            n => {
                return Err(TimingError::InvalidCron {
                    expression: expression.to_string(),
                    reason: format!("expected 5, 6 or 7 fields, got {n}"),
                });
            }
        };
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| TimingError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first matching instant at least one second after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let base = now.with_nanosecond(0).unwrap_or(now);
        self.schedule.after(&base).next()
    }
}

/// When a job fires. A closed set of strategies.
#[derive(Debug, Clone)]
pub enum Timing {
    Periodic(PeriodicTiming),
    Cron(CronTiming),
    /// Never fires.
    Void,
}

impl Timing {
    pub fn every(period: Period, continuous: bool) -> Self {
        Timing::Periodic(PeriodicTiming::new(period, continuous))
    }

    pub fn cron(expression: &str) -> Result<Self, TimingError> {
        CronTiming::parse(expression).map(Timing::Cron)
    }

    /// Ticks from `now` until the next fire. Non-positive means "never again".
    pub fn next_fire_ticks(&self, now: DateTime<Utc>, rate: TickRate) -> i64 {
        match self {
            Timing::Periodic(p) => match p.period.after(now) {
                Some(next) => rate.ticks_in(next - now),
                None => -1,
            },
            Timing::Cron(c) => match c.next_after(now) {
                Some(next) => rate.ticks_in(next - now),
                None => -1,
            },
            Timing::Void => -1,
        }
    }

    /// Continuous timings re-arm on fire; the others re-arm on completion.
    pub fn is_continuous(&self) -> bool {
        match self {
            Timing::Periodic(p) => p.continuous,
            Timing::Cron(_) => true,
            Timing::Void => false,
        }
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timing::Periodic(p) if p.continuous => write!(f, "every {} (continuous)", p.period),
            Timing::Periodic(p) => write!(f, "every {} after completion", p.period),
            Timing::Cron(c) => write!(f, "cron '{}'", c.expression),
            Timing::Void => write!(f, "never"),
        }
    }
}
