//! Tick timing: fixed intervals and cron expressions.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// How ticks are spaced once the first one has fired.
#[derive(Debug, Clone)]
pub(crate) enum Trigger {
    /// Fixed period measured from schedule start.
    Interval(Duration),
    /// Next matching instant of a cron expression in `tz`.
    Cron {
        schedule: Box<cron::Schedule>,
        tz: Tz,
    },
}

impl Trigger {
    /// First fire time strictly after `now`, for cron triggers.
    pub fn next_cron_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(_) => None,
            Trigger::Cron { schedule, tz } => schedule
                .after(&now.with_timezone(tz))
                .next()
                .map(|at| at.with_timezone(&Utc)),
        }
    }

    /// Next fire time after both `now` and the previous fire. The wall clock
    /// may still read before `previous` when a monotonic sleep ends.
    pub fn next_cron_fire_after(
        &self,
        now: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let from = previous.map_or(now, |prev| prev.max(now));
        self.next_cron_fire(from)
    }
}

/// Parses a cron expression. Classic five-field expressions are accepted and
/// run at second zero.
pub(crate) fn parse_cron(expr: &str) -> Result<cron::Schedule, String> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| format!("invalid cron expression '{expr}': {e}"))
}

/// Random delay in `[0, max]`.
pub(crate) fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    max.mul_f64(rand::random::<f64>())
}

/// Time left until `at`, zero when it has passed.
pub(crate) fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}
