//! Cron triggers

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

/// Every five minutes, on the minute.
pub const DEFAULT_SCHEDULE: &str = "0 */5 * * * *";

/// A named six-field cron schedule (`sec min hour day month weekday`)
#[derive(Debug, Clone)]
pub struct CronTrigger {
    name: String,
    expression: String,
    schedule: Schedule,
}

impl CronTrigger {
    pub fn parse(name: impl Into<String>, expression: &str) -> Result<Self> {
        let name = name.into();
        let schedule = Schedule::from_str(expression)
            .with_context(|| format!("Invalid cron expression for {}: '{}'", name, expression))?;

        Ok(Self {
            name,
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    /// How long to wait from `now` until the next fire time.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_schedule_fires_every_five_minutes() {
        let trigger = CronTrigger::parse("upload", DEFAULT_SCHEDULE).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 3, 20).unwrap();

        let next = trigger.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap());
        assert_eq!(
            trigger.next_after(next).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 10, 0).unwrap()
        );
        assert_eq!(trigger.delay_from(now), Some(Duration::from_secs(100)));
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let err = CronTrigger::parse("discovery", "every five minutes").unwrap_err();
        assert!(err.to_string().contains("discovery"));
    }
}
