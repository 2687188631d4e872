//! Repeat schedules: fixed intervals and cron expressions.
//!
//! A repeating job is a series of ordinary job instances. Each instance is
//! materialized for one tick; the next tick is computed from the later of the
//! current tick and now, so ticks missed while the process was busy or down
//! are dropped rather than backfilled.

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::queue::QueueError;

/// How a job repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatOptions {
    /// Run at fixed intervals
    Every(#[serde(with = "humantime_serde")] Duration),
    /// Run on a cron schedule (e.g. `"0 9 * * MON-FRI"`)
    Cron { pattern: String },
}

impl RepeatOptions {
    pub fn every(interval: Duration) -> Self {
        Self::Every(interval)
    }

    pub fn cron(pattern: impl Into<String>) -> Self {
        Self::Cron {
            pattern: pattern.into(),
        }
    }

    /// Reject schedules that can never produce a tick.
    pub fn validate(&self) -> Result<(), QueueError> {
        match self {
            Self::Every(interval) if interval.is_zero() => Err(QueueError::InvalidSchedule(
                "repeat interval must be greater than zero".to_string(),
            )),
            Self::Every(_) => Ok(()),
            Self::Cron { pattern } => parse_cron(pattern).map(|_| ()),
        }
    }

    /// First tick strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, QueueError> {
        match self {
            Self::Every(interval) => {
                let step = chrono::Duration::from_std(*interval)
                    .map_err(|e| QueueError::InvalidSchedule(e.to_string()))?;
                if step <= chrono::Duration::zero() {
                    return Err(QueueError::InvalidSchedule(
                        "repeat interval must be greater than zero".to_string(),
                    ));
                }
                after.checked_add_signed(step).ok_or_else(|| {
                    QueueError::InvalidSchedule("next tick is out of range".to_string())
                })
            }
            Self::Cron { pattern } => parse_cron(pattern)?
                .find_next_occurrence(&after, false)
                .map_err(|e| QueueError::InvalidSchedule(format!("{}: {}", pattern, e))),
        }
    }

    /// Stable label used to key the series.
    pub fn describe(&self) -> String {
        match self {
            Self::Every(interval) => format!("every:{}", interval.as_millis()),
            Self::Cron { pattern } => format!("cron:{}", pattern),
        }
    }
}

fn parse_cron(pattern: &str) -> Result<Cron, QueueError> {
    Cron::new(pattern)
        .parse()
        .map_err(|e| QueueError::InvalidSchedule(format!("{}: {}", pattern, e)))
}

/// Tick following `current`, skipping anything already in the past.
pub fn next_tick(
    repeat: &RepeatOptions,
    current: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, QueueError> {
    repeat.next_after(current.max(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_every_next_after() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let repeat = RepeatOptions::every(Duration::from_secs(300));
        assert_eq!(
            repeat.next_after(start).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 9, 5, 0).unwrap()
        );
    }

    #[test]
    fn test_every_past_last_instant_is_invalid() {
        let repeat = RepeatOptions::every(Duration::from_secs(3600));
        let err = repeat.next_after(DateTime::<Utc>::MAX_UTC).unwrap_err();
        assert!(matches!(err, QueueError::InvalidSchedule(_)));
    }

    #[test]
    fn test_cron_next_after() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap();
        let repeat = RepeatOptions::cron("0 * * * *");
        assert_eq!(
            repeat.next_after(start).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(RepeatOptions::every(Duration::ZERO).validate().is_err());
        assert!(RepeatOptions::cron("not a cron").validate().is_err());
        assert!(RepeatOptions::cron("*/5 * * * *").validate().is_ok());
    }

    #[test]
    fn test_missed_ticks_are_dropped() {
        let repeat = RepeatOptions::every(Duration::from_secs(60));
        let tick = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 9, 10, 30).unwrap();

        assert_eq!(
            next_tick(&repeat, tick, now).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 9, 11, 30).unwrap()
        );
    }
}
