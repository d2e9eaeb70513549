//! Sampler definitions as supplied by clients, and their validated form.

use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::pack::REF_SEPARATOR;
use crate::registry::CollectorTarget;
use crate::runner::QueryInvocation;

use super::schedule::{Trigger, parse_cron};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Upper bound for every schedule and retention duration: one leap year.
pub const MAX_SCHEDULE_SECS: f64 = 366.0 * 24.0 * 3600.0;

/// Client-supplied description of one recurring collector run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerDefinition {
    /// Filled in from the id the definition is registered under when empty.
    #[serde(default)]
    pub sampler_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: Schedule,
    #[serde(default)]
    pub run_policy: RunPolicy,
    #[serde(default)]
    pub result_policy: ResultPolicy,
    pub target: SamplerTarget,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Interval,
    Cron,
}

/// When ticks fire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "type", default)]
    pub kind: ScheduleKind,
    /// Seconds between ticks, required for `interval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_sec: Option<f64>,
    /// Cron expression, required for `cron`. Five-field expressions get a
    /// leading seconds field of `0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// IANA zone the cron expression is evaluated in; UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub start_delay_sec: f64,
    /// Upper bound of the random delay added to the first tick.
    #[serde(default)]
    pub jitter_sec: f64,
}

impl Schedule {
    pub fn every(interval_sec: f64) -> Self {
        Self {
            kind: ScheduleKind::Interval,
            interval_sec: Some(interval_sec),
            ..Self::default()
        }
    }

    pub fn cron(expr: &str) -> Self {
        Self {
            kind: ScheduleKind::Cron,
            cron: Some(expr.to_string()),
            ..Self::default()
        }
    }
}

/// What happens to a tick that fires while earlier runs are still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the tick.
    #[default]
    Skip,
    /// Run it once the in-flight run finishes; at most one tick waits.
    Queue,
    /// Cancel the oldest in-flight run and start the tick now.
    #[serde(alias = "cancelPrevious")]
    CancelPrevious,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Record failures and keep ticking.
    #[default]
    Continue,
    /// Stop once this many runs in a row have failed.
    #[serde(alias = "stopAfterConsecutiveFailures")]
    StopAfterConsecutiveFailures(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPolicy {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub on_overlap: OverlapPolicy,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrency: 1,
            on_overlap: OverlapPolicy::Skip,
            error_policy: ErrorPolicy::Continue,
        }
    }
}

/// How many successful snapshots are retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPolicy {
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_sec: Option<f64>,
}

impl Default for ResultPolicy {
    fn default() -> Self {
        Self {
            keep_last_n: 1,
            retention_sec: None,
        }
    }
}

/// The collector a sampler runs: exactly one of `collector_id` and
/// `collector_ref`, plus optional queries of the same collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplerTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<QueryInvocation>,
}

impl SamplerDefinition {
    /// Enabled definition with default policies.
    pub fn new(schedule: Schedule, target: CollectorTarget) -> Self {
        let target = match target {
            CollectorTarget::Id(id) => SamplerTarget {
                collector_id: Some(id),
                ..SamplerTarget::default()
            },
            CollectorTarget::Ref(reference) => SamplerTarget {
                collector_ref: Some(reference),
                ..SamplerTarget::default()
            },
        };
        Self {
            sampler_id: String::new(),
            enabled: true,
            schedule,
            run_policy: RunPolicy::default(),
            result_policy: ResultPolicy::default(),
            target,
        }
    }

    /// Checks the definition and converts it into the form the scheduler runs.
    pub(crate) fn plan(&self) -> Result<SamplerPlan, EngineError> {
        let schedule = &self.schedule;
        let trigger = match schedule.kind {
            ScheduleKind::Interval => {
                let secs = schedule
                    .interval_sec
                    .ok_or_else(|| invalid("schedule.interval_sec is required for interval schedules"))?;
                Trigger::Interval(positive_secs("schedule.interval_sec", secs)?)
            }
            ScheduleKind::Cron => {
                let expr = schedule
                    .cron
                    .as_deref()
                    .ok_or_else(|| invalid("schedule.cron is required for cron schedules"))?;
                let tz = match schedule.timezone.as_deref() {
                    Some(name) => name
                        .parse::<Tz>()
                        .map_err(|e| invalid(format!("schedule.timezone '{name}': {e}")))?,
                    None => Tz::UTC,
                };
                let parsed = parse_cron(expr).map_err(invalid)?;
                Trigger::Cron {
                    schedule: Box::new(parsed),
                    tz,
                }
            }
        };

        let start_delay = non_negative_secs("schedule.start_delay_sec", schedule.start_delay_sec)?;
        let jitter = non_negative_secs("schedule.jitter_sec", schedule.jitter_sec)?;

        let run = &self.run_policy;
        if run.timeout_ms == 0 {
            return Err(invalid("run_policy.timeout_ms must be positive"));
        }
        if run.max_concurrency == 0 {
            return Err(invalid("run_policy.max_concurrency must be at least 1"));
        }
        if run.error_policy == ErrorPolicy::StopAfterConsecutiveFailures(0) {
            return Err(invalid(
                "run_policy.error_policy threshold must be at least 1",
            ));
        }

        let result = &self.result_policy;
        if result.keep_last_n == 0 {
            return Err(invalid("result_policy.keep_last_n must be at least 1"));
        }
        let retention = result
            .retention_sec
            .map(|secs| positive_secs("result_policy.retention_sec", secs))
            .transpose()?;

        let target = match (&self.target.collector_id, &self.target.collector_ref) {
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "target takes either collector_id or collector_ref, not both",
                ));
            }
            (None, None) => return Err(invalid("target.collector_id or target.collector_ref is required")),
            (Some(id), None) => {
                if id.trim().is_empty() || id.contains(REF_SEPARATOR) {
                    return Err(invalid(format!("target.collector_id '{id}' is not a plain id")));
                }
                CollectorTarget::Id(id.clone())
            }
            (None, Some(reference)) => match reference.rsplit_once(REF_SEPARATOR) {
                Some((source, id)) if !source.is_empty() && !id.is_empty() => {
                    CollectorTarget::Ref(reference.clone())
                }
                _ => {
                    return Err(invalid(format!(
                        "target.collector_ref '{reference}' must look like source{REF_SEPARATOR}collector"
                    )));
                }
            },
        };
        if let Some(q) = self.target.queries.iter().find(|q| q.query_id.trim().is_empty()) {
            return Err(invalid(format!("target query with empty id: {q:?}")));
        }

        Ok(SamplerPlan {
            trigger,
            interval_sec: schedule.interval_sec,
            start_delay,
            jitter,
            timeout: Duration::from_millis(run.timeout_ms),
            max_concurrency: run.max_concurrency,
            on_overlap: run.on_overlap,
            error_policy: run.error_policy,
            keep_last_n: result.keep_last_n,
            retention,
            target,
            queries: self.target.queries.clone(),
        })
    }
}

/// Validated sampler definition.
#[derive(Debug, Clone)]
pub(crate) struct SamplerPlan {
    pub trigger: Trigger,
    pub interval_sec: Option<f64>,
    pub start_delay: Duration,
    pub jitter: Duration,
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub on_overlap: OverlapPolicy,
    pub error_policy: ErrorPolicy,
    pub keep_last_n: usize,
    pub retention: Option<Duration>,
    pub target: CollectorTarget,
    pub queries: Vec<QueryInvocation>,
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::SamplerInvalidConfig(reason.into())
}

fn positive_secs(field: &str, secs: f64) -> Result<Duration, EngineError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => bounded(field, d),
        _ => Err(invalid(format!("{field} must be a positive number of seconds"))),
    }
}

fn non_negative_secs(field: &str, secs: f64) -> Result<Duration, EngineError> {
    let d = Duration::try_from_secs_f64(secs)
        .map_err(|_| invalid(format!("{field} must be zero or a positive number of seconds")))?;
    bounded(field, d)
}

fn bounded(field: &str, d: Duration) -> Result<Duration, EngineError> {
    if d.as_secs_f64() > MAX_SCHEDULE_SECS {
        return Err(invalid(format!(
            "{field} must not exceed {MAX_SCHEDULE_SECS} seconds"
        )));
    }
    Ok(d)
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_concurrency() -> usize {
    1
}

fn default_keep_last_n() -> usize {
    1
}
