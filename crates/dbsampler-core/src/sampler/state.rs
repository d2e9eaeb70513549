//! Per-sampler runtime state and its transitions.
//!
//! Everything here is synchronous and clock-free: callers pass the current
//! time in, which keeps the transitions testable without a runtime.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::result::CollectorResult;

use super::definition::{ErrorPolicy, OverlapPolicy, SamplerDefinition, SamplerPlan};

pub(crate) const REASON_STOPPED_BY_REQUEST: &str = "stopped by request";
pub(crate) const REASON_DISABLED: &str = "sampler disabled";
pub(crate) const REASON_CRON_EXHAUSTED: &str = "cron expression has no future fire time";

/// Lifecycle phase of a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SamplerPhase {
    /// Registered, first run not started yet.
    Starting,
    Running,
    /// No further ticks until re-registered or restarted.
    Stopped,
}

/// One retained successful run.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub captured_at: DateTime<Utc>,
    pub result: Arc<CollectorResult>,
}

/// Status of one sampler as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplerStatusReport {
    pub status: SamplerPhase,
    pub reason: Option<String>,
    pub consecutive_failures: u32,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub next_tick_at: Option<DateTime<Utc>>,
    pub runs: u64,
    pub failures: u64,
    pub skipped_ticks: u64,
    pub buffered: usize,
}

/// Outcome of a snapshot request.
#[derive(Debug, Clone)]
pub enum SnapshotLookup {
    Ready(SnapshotEntry),
    /// Registered and not stopped, no successful run yet.
    Pending,
    Stopped { reason: Option<String> },
    NotFound,
}

/// Latest snapshot plus a bounded history.
///
/// `keep_last_n` and `retention` apply independently to the history; the
/// latest snapshot stays available whatever its age.
#[derive(Debug)]
pub(crate) struct SnapshotBuffer {
    latest: Option<SnapshotEntry>,
    history: VecDeque<(Instant, SnapshotEntry)>,
    keep_last_n: usize,
    retention: Option<Duration>,
}

impl SnapshotBuffer {
    pub fn new(keep_last_n: usize, retention: Option<Duration>) -> Self {
        Self {
            latest: None,
            history: VecDeque::new(),
            keep_last_n: keep_last_n.max(1),
            retention,
        }
    }

    pub fn set_policy(&mut self, keep_last_n: usize, retention: Option<Duration>, now: Instant) {
        self.keep_last_n = keep_last_n.max(1);
        self.retention = retention;
        self.prune(now);
    }

    pub fn push(&mut self, entry: SnapshotEntry, now: Instant) {
        self.latest = Some(entry.clone());
        self.history.push_back((now, entry));
        self.prune(now);
    }

    pub fn latest(&self) -> Option<&SnapshotEntry> {
        self.latest.as_ref()
    }

    /// Retained entries, oldest first.
    pub fn history(&mut self, now: Instant) -> Vec<SnapshotEntry> {
        self.prune(now);
        self.history.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    fn prune(&mut self, now: Instant) {
        while self.history.len() > self.keep_last_n {
            self.history.pop_front();
        }
        if let Some(retention) = self.retention {
            while let Some((at, _)) = self.history.front() {
                if now.saturating_duration_since(*at) > retention {
                    self.history.pop_front();
                } else {
                    break;
                }
            }
        }
    }
}

/// Permission to start one run.
#[derive(Debug, Clone)]
pub(crate) struct RunTicket {
    pub id: u64,
    pub token: CancellationToken,
    pub plan: Arc<SamplerPlan>,
}

#[derive(Debug)]
pub(crate) enum TickDecision {
    Run(RunTicket),
    Skipped,
    Queued,
}

/// What finishing a run led to.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    /// The run was cancelled or the sampler stopped; its result was dropped.
    pub discarded: bool,
    /// This run made the error policy stop the sampler.
    pub stopped: bool,
    /// A queued tick that may start now.
    pub next: Option<RunTicket>,
}

#[derive(Debug)]
struct InFlight {
    id: u64,
    token: CancellationToken,
}

/// Mutable state of one sampler, guarded by the sampler's mutex.
#[derive(Debug)]
pub(crate) struct SamplerState {
    pub definition: SamplerDefinition,
    pub plan: Arc<SamplerPlan>,
    pub phase: SamplerPhase,
    pub reason: Option<String>,
    pub consecutive_failures: u32,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub next_tick_at: Option<DateTime<Utc>>,
    pub runs: u64,
    pub failures: u64,
    pub skipped_ticks: u64,
    pub snapshots: SnapshotBuffer,
    /// Cancelled to end the current schedule loop.
    pub schedule_token: CancellationToken,
    in_flight: Vec<InFlight>,
    /// Runs already completed or cancelled whose database call has not
    /// returned yet. They hold a concurrency slot until it does.
    draining: usize,
    queued: bool,
    next_run_id: u64,
}

impl SamplerState {
    pub fn new(definition: SamplerDefinition, plan: SamplerPlan) -> Self {
        let snapshots = SnapshotBuffer::new(plan.keep_last_n, plan.retention);
        Self {
            definition,
            plan: Arc::new(plan),
            phase: SamplerPhase::Starting,
            reason: None,
            consecutive_failures: 0,
            last_tick_at: None,
            next_tick_at: None,
            runs: 0,
            failures: 0,
            skipped_ticks: 0,
            snapshots,
            schedule_token: CancellationToken::new(),
            in_flight: Vec::new(),
            draining: 0,
            queued: false,
            next_run_id: 0,
        }
    }

    /// Swaps in a new definition. Runs in flight finish under the old one;
    /// the snapshot is kept. Returns the token for the new schedule loop.
    pub fn replace(
        &mut self,
        definition: SamplerDefinition,
        plan: SamplerPlan,
        now: Instant,
    ) -> CancellationToken {
        self.schedule_token.cancel();
        self.schedule_token = CancellationToken::new();
        self.snapshots
            .set_policy(plan.keep_last_n, plan.retention, now);
        self.definition = definition;
        self.plan = Arc::new(plan);
        self.next_tick_at = None;
        if self.phase == SamplerPhase::Stopped {
            self.phase = SamplerPhase::Starting;
            self.reason = None;
            self.consecutive_failures = 0;
        }
        self.schedule_token.clone()
    }

    /// Ends scheduling and cancels every in-flight run.
    pub fn stop(&mut self, reason: impl Into<String>) {
        self.phase = SamplerPhase::Stopped;
        self.reason = Some(reason.into());
        self.schedule_token.cancel();
        for run in self.in_flight.drain(..) {
            run.token.cancel();
        }
        self.queued = false;
        self.next_tick_at = None;
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Slots taken against `max_concurrency`.
    fn occupied(&self) -> usize {
        self.in_flight.len() + self.draining
    }

    /// Applies the overlap policy to a tick firing at `now`.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> TickDecision {
        if self.phase == SamplerPhase::Stopped {
            return TickDecision::Skipped;
        }
        self.last_tick_at = Some(now);
        if self.occupied() < self.plan.max_concurrency {
            return TickDecision::Run(self.begin());
        }
        match self.plan.on_overlap {
            OverlapPolicy::Skip => {
                self.skipped_ticks += 1;
                TickDecision::Skipped
            }
            OverlapPolicy::Queue if !self.queued => {
                self.queued = true;
                TickDecision::Queued
            }
            OverlapPolicy::Queue => {
                self.skipped_ticks += 1;
                TickDecision::Skipped
            }
            OverlapPolicy::CancelPrevious if self.in_flight.is_empty() => {
                self.skipped_ticks += 1;
                TickDecision::Skipped
            }
            OverlapPolicy::CancelPrevious => {
                let oldest = self.in_flight.remove(0);
                oldest.token.cancel();
                TickDecision::Run(self.begin())
            }
        }
    }

    fn begin(&mut self) -> RunTicket {
        self.next_run_id += 1;
        let token = CancellationToken::new();
        self.in_flight.push(InFlight {
            id: self.next_run_id,
            token: token.clone(),
        });
        if self.phase == SamplerPhase::Starting {
            self.phase = SamplerPhase::Running;
        }
        RunTicket {
            id: self.next_run_id,
            token,
            plan: self.plan.clone(),
        }
    }

    /// Records the outcome of run `id`. With `still_running` the run's
    /// database call has not returned; its slot stays taken until
    /// [`drained`](Self::drained) is called.
    pub fn complete(
        &mut self,
        id: u64,
        outcome: Result<CollectorResult, EngineError>,
        still_running: bool,
        now: Instant,
    ) -> Completion {
        if still_running {
            self.draining += 1;
        }
        let Some(pos) = self.in_flight.iter().position(|r| r.id == id) else {
            return Completion {
                discarded: true,
                ..Completion::default()
            };
        };
        self.in_flight.remove(pos);
        if self.phase == SamplerPhase::Stopped {
            return Completion {
                discarded: true,
                ..Completion::default()
            };
        }

        self.runs += 1;
        let mut completion = Completion::default();
        match outcome {
            Ok(result) => {
                self.consecutive_failures = 0;
                self.reason = None;
                self.snapshots.push(
                    SnapshotEntry {
                        captured_at: result.collected_at,
                        result: Arc::new(result),
                    },
                    now,
                );
            }
            Err(e) => {
                self.failures += 1;
                self.consecutive_failures += 1;
                let message = e.to_string();
                match self.plan.error_policy {
                    ErrorPolicy::StopAfterConsecutiveFailures(threshold)
                        if self.consecutive_failures >= threshold =>
                    {
                        self.stop(format!(
                            "stopped after {} consecutive failures, last error: {message}",
                            self.consecutive_failures
                        ));
                        completion.stopped = true;
                        return completion;
                    }
                    _ => self.reason = Some(message),
                }
            }
        }

        completion.next = self.start_queued();
        completion
    }

    /// Releases the slot of a run whose database call finally returned.
    pub fn drained(&mut self) -> Option<RunTicket> {
        self.draining = self.draining.saturating_sub(1);
        self.start_queued()
    }

    fn start_queued(&mut self) -> Option<RunTicket> {
        if self.phase == SamplerPhase::Stopped
            || !self.queued
            || self.occupied() >= self.plan.max_concurrency
        {
            return None;
        }
        self.queued = false;
        Some(self.begin())
    }

    pub fn report(&self) -> SamplerStatusReport {
        SamplerStatusReport {
            status: self.phase,
            reason: self.reason.clone(),
            consecutive_failures: self.consecutive_failures,
            last_tick_at: self.last_tick_at,
            next_tick_at: self.next_tick_at,
            runs: self.runs,
            failures: self.failures,
            skipped_ticks: self.skipped_ticks,
            buffered: self.snapshots.len(),
        }
    }

    pub fn lookup(&self) -> SnapshotLookup {
        if self.phase == SamplerPhase::Stopped {
            return SnapshotLookup::Stopped {
                reason: self.reason.clone(),
            };
        }
        match self.snapshots.latest() {
            Some(entry) => SnapshotLookup::Ready(entry.clone()),
            None => SnapshotLookup::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CollectorTarget;
    use crate::result::LayerResults;
    use crate::sampler::definition::{ResultPolicy, RunPolicy, Schedule};

    fn result(tag: &str) -> CollectorResult {
        CollectorResult {
            db_type: "postgres".into(),
            interval_sec: Some(1.0),
            collector_id: tag.into(),
            collector_ref: format!("pg:{tag}"),
            source_identifier: "pg".into(),
            server_version: None,
            collected_at: Utc::now(),
            duration_ms: 1,
            layers: LayerResults::default(),
            queries: Default::default(),
        }
    }

    fn entry(tag: &str) -> SnapshotEntry {
        let result = result(tag);
        SnapshotEntry {
            captured_at: result.collected_at,
            result: Arc::new(result),
        }
    }

    fn state(run_policy: RunPolicy) -> SamplerState {
        let def = SamplerDefinition {
            run_policy,
            ..SamplerDefinition::new(Schedule::every(1.0), CollectorTarget::id("top"))
        };
        let plan = def.plan().unwrap();
        SamplerState::new(def, plan)
    }

    fn start(state: &mut SamplerState) -> u64 {
        match state.on_tick(Utc::now()) {
            TickDecision::Run(ticket) => ticket.id,
            other => panic!("expected run, got {other:?}"),
        }
    }

    fn failed() -> Result<CollectorResult, EngineError> {
        Err(EngineError::CollectorNotFound("top".into()))
    }

    #[test]
    fn test_buffer_keep_last_n() {
        let now = Instant::now();
        let mut buf = SnapshotBuffer::new(3, None);
        for tag in ["a", "b", "c", "d", "e"] {
            buf.push(entry(tag), now);
        }
        let tags: Vec<String> = buf
            .history(now)
            .iter()
            .map(|e| e.result.collector_id.clone())
            .collect();
        assert_eq!(tags, vec!["c", "d", "e"]);
        assert_eq!(buf.latest().unwrap().result.collector_id, "e");
    }

    #[test]
    fn test_buffer_retention_keeps_latest() {
        let t0 = Instant::now();
        let mut buf = SnapshotBuffer::new(10, Some(Duration::from_secs(60)));
        buf.push(entry("old"), t0);
        buf.push(entry("new"), t0 + Duration::from_secs(50));

        let later = t0 + Duration::from_secs(100);
        let tags: Vec<String> = buf
            .history(later)
            .iter()
            .map(|e| e.result.collector_id.clone())
            .collect();
        assert_eq!(tags, vec!["new"]);

        assert!(buf.history(t0 + Duration::from_secs(200)).is_empty());
        assert_eq!(buf.latest().unwrap().result.collector_id, "new");
    }

    #[test]
    fn test_buffer_policy_shrink() {
        let now = Instant::now();
        let mut buf = SnapshotBuffer::new(5, None);
        for tag in ["a", "b", "c"] {
            buf.push(entry(tag), now);
        }
        buf.set_policy(1, None, now);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_first_tick_moves_to_running() {
        let mut s = state(RunPolicy::default());
        assert_eq!(s.phase, SamplerPhase::Starting);
        assert!(matches!(s.lookup(), SnapshotLookup::Pending));
        start(&mut s);
        assert_eq!(s.phase, SamplerPhase::Running);
        assert!(matches!(s.lookup(), SnapshotLookup::Pending));
    }

    #[test]
    fn test_skip_drops_overlapping_ticks() {
        let mut s = state(RunPolicy::default());
        let id = start(&mut s);
        assert!(matches!(s.on_tick(Utc::now()), TickDecision::Skipped));
        assert!(matches!(s.on_tick(Utc::now()), TickDecision::Skipped));
        assert_eq!(s.skipped_ticks, 2);

        let done = s.complete(id, Ok(result("top")), false, Instant::now());
        assert!(done.next.is_none());
        assert_eq!(s.in_flight(), 0);
    }

    #[test]
    fn test_queue_holds_one_tick() {
        let mut s = state(RunPolicy {
            on_overlap: OverlapPolicy::Queue,
            ..RunPolicy::default()
        });
        let id = start(&mut s);
        assert!(matches!(s.on_tick(Utc::now()), TickDecision::Queued));
        assert!(matches!(s.on_tick(Utc::now()), TickDecision::Skipped));
        assert_eq!(s.skipped_ticks, 1);

        let done = s.complete(id, Ok(result("top")), false, Instant::now());
        let next = done.next.expect("queued tick starts");
        assert_eq!(s.in_flight(), 1);
        let done = s.complete(next.id, Ok(result("top")), false, Instant::now());
        assert!(done.next.is_none());
        assert_eq!(s.runs, 2);
    }

    #[test]
    fn test_max_concurrency_allows_overlap() {
        let mut s = state(RunPolicy {
            max_concurrency: 2,
            ..RunPolicy::default()
        });
        start(&mut s);
        start(&mut s);
        assert!(matches!(s.on_tick(Utc::now()), TickDecision::Skipped));
        assert_eq!(s.in_flight(), 2);
    }

    #[test]
    fn test_cancel_previous_replaces_run() {
        let mut s = state(RunPolicy {
            on_overlap: OverlapPolicy::CancelPrevious,
            ..RunPolicy::default()
        });
        let first = match s.on_tick(Utc::now()) {
            TickDecision::Run(ticket) => ticket,
            other => panic!("expected run, got {other:?}"),
        };
        let second = start(&mut s);
        assert!(first.token.is_cancelled());
        assert_eq!(s.in_flight(), 1);

        let late = s.complete(first.id, Err(EngineError::Cancelled), false, Instant::now());
        assert!(late.discarded);
        assert_eq!(s.failures, 0);

        s.complete(second, Ok(result("top")), false, Instant::now());
        assert_eq!(s.runs, 1);
    }

    #[test]
    fn test_timed_out_run_holds_slot_until_drained() {
        let mut s = state(RunPolicy::default());
        let id = start(&mut s);
        let done = s.complete(
            id,
            Err(EngineError::Timeout(Duration::from_millis(50))),
            true,
            Instant::now(),
        );
        assert!(!done.discarded);
        assert_eq!(s.failures, 1);
        assert_eq!(s.in_flight(), 0);
        assert!(matches!(s.on_tick(Utc::now()), TickDecision::Skipped));

        assert!(s.drained().is_none());
        start(&mut s);
    }

    #[test]
    fn test_queued_tick_waits_for_drained_run() {
        let mut s = state(RunPolicy {
            on_overlap: OverlapPolicy::Queue,
            ..RunPolicy::default()
        });
        let id = start(&mut s);
        assert!(matches!(s.on_tick(Utc::now()), TickDecision::Queued));

        let done = s.complete(
            id,
            Err(EngineError::Timeout(Duration::from_millis(50))),
            true,
            Instant::now(),
        );
        assert!(done.next.is_none());
        assert!(s.drained().is_some());
        assert_eq!(s.in_flight(), 1);
    }

    #[test]
    fn test_cancel_previous_skips_while_only_draining() {
        let mut s = state(RunPolicy {
            on_overlap: OverlapPolicy::CancelPrevious,
            ..RunPolicy::default()
        });
        let id = start(&mut s);
        s.complete(id, Err(EngineError::Cancelled), true, Instant::now());
        assert!(matches!(s.on_tick(Utc::now()), TickDecision::Skipped));
        assert_eq!(s.skipped_ticks, 1);
    }

    #[test]
    fn test_stop_after_consecutive_failures() {
        let mut s = state(RunPolicy {
            error_policy: ErrorPolicy::StopAfterConsecutiveFailures(3),
            ..RunPolicy::default()
        });

        for _ in 0..2 {
            let id = start(&mut s);
            assert!(!s.complete(id, failed(), false, Instant::now()).stopped);
        }
        assert_eq!(s.consecutive_failures, 2);

        let id = start(&mut s);
        s.complete(id, Ok(result("top")), false, Instant::now());
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.reason.is_none());

        for _ in 0..2 {
            let id = start(&mut s);
            assert!(!s.complete(id, failed(), false, Instant::now()).stopped);
        }
        assert_eq!(s.phase, SamplerPhase::Running);
        assert!(s.reason.as_deref().unwrap().contains("collector not found"));

        let id = start(&mut s);
        assert!(s.complete(id, failed(), false, Instant::now()).stopped);
        assert_eq!(s.phase, SamplerPhase::Stopped);
        assert!(s.schedule_token.is_cancelled());
        assert!(
            s.reason
                .as_deref()
                .unwrap()
                .starts_with("stopped after 3 consecutive failures")
        );
        assert!(matches!(s.on_tick(Utc::now()), TickDecision::Skipped));
    }

    #[test]
    fn test_continue_policy_keeps_last_good_snapshot() {
        let mut s = state(RunPolicy::default());
        let id = start(&mut s);
        s.complete(id, Ok(result("good")), false, Instant::now());
        for _ in 0..5 {
            let id = start(&mut s);
            s.complete(id, failed(), false, Instant::now());
        }
        assert_eq!(s.phase, SamplerPhase::Running);
        assert_eq!(s.consecutive_failures, 5);
        match s.lookup() {
            SnapshotLookup::Ready(entry) => assert_eq!(entry.result.collector_id, "good"),
            other => panic!("unexpected lookup {other:?}"),
        }
    }

    #[test]
    fn test_stop_hides_snapshot_and_cancels_runs() {
        let mut s = state(RunPolicy::default());
        let id = start(&mut s);
        s.complete(id, Ok(result("top")), false, Instant::now());
        let running = match s.on_tick(Utc::now()) {
            TickDecision::Run(ticket) => ticket,
            other => panic!("expected run, got {other:?}"),
        };

        s.stop(REASON_STOPPED_BY_REQUEST);
        assert!(running.token.is_cancelled());
        match s.lookup() {
            SnapshotLookup::Stopped { reason } => {
                assert_eq!(reason.as_deref(), Some(REASON_STOPPED_BY_REQUEST))
            }
            other => panic!("unexpected lookup {other:?}"),
        }

        let late = s.complete(running.id, Ok(result("late")), false, Instant::now());
        assert!(late.discarded);
        assert_eq!(s.snapshots.latest().unwrap().result.collector_id, "top");
    }

    #[test]
    fn test_replace_restarts_stopped_sampler() {
        let mut s = state(RunPolicy::default());
        let id = start(&mut s);
        s.complete(id, Ok(result("top")), false, Instant::now());
        s.stop(REASON_STOPPED_BY_REQUEST);
        let old_token = s.schedule_token.clone();

        let def = SamplerDefinition {
            result_policy: ResultPolicy {
                keep_last_n: 4,
                retention_sec: None,
            },
            ..SamplerDefinition::new(Schedule::every(2.0), CollectorTarget::id("top"))
        };
        let plan = def.plan().unwrap();
        let token = s.replace(def, plan, Instant::now());

        assert!(old_token.is_cancelled());
        assert!(!token.is_cancelled());
        assert_eq!(s.phase, SamplerPhase::Starting);
        assert!(s.reason.is_none());
        assert!(matches!(s.lookup(), SnapshotLookup::Ready(_)));
    }
}
