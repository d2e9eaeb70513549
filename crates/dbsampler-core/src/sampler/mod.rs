//! Sampler manager: independently scheduled collector runs per session.
//!
//! Every `(session, sampler)` pair owns a schedule loop on the tokio runtime
//! and a mutex-guarded [`SamplerState`](state::SamplerState). A tick decides,
//! under that mutex, whether a run may start (overlap policy). A run borrows a
//! connection from the [`ConnectionProvider`] on a blocking thread, executes
//! the collector and returns the connection by dropping it. Timeouts and
//! cancellations interrupt the database call through the connection's
//! cancel handle; the blocking thread still owns and releases the connection
//! once the call returns.
//!
//! Failures inside a run never escape the scheduler. They are recorded in the
//! sampler state and visible through [`SamplerManager::get_sampler_status`].

mod definition;
mod schedule;
mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{CancelHandle, ConnectionProvider};
use crate::error::{DbError, EngineError};
use crate::result::CollectorResult;
use crate::runner::{CollectorRunner, RunContext};

pub use definition::{
    ErrorPolicy, OverlapPolicy, ResultPolicy, RunPolicy, SamplerDefinition, SamplerTarget,
    Schedule, ScheduleKind,
};
pub use state::{SamplerPhase, SamplerStatusReport, SnapshotEntry, SnapshotLookup};

use definition::SamplerPlan;
use schedule::Trigger;
use state::{
    REASON_CRON_EXHAUSTED, REASON_DISABLED, REASON_STOPPED_BY_REQUEST, RunTicket, SamplerState,
    TickDecision,
};

type SamplerKey = (String, String);

struct SamplerHandle {
    session: String,
    sampler: String,
    state: Mutex<SamplerState>,
}

struct ManagerInner {
    runner: CollectorRunner,
    provider: Arc<dyn ConnectionProvider>,
    runtime: Option<Handle>,
    samplers: Mutex<HashMap<SamplerKey, Arc<SamplerHandle>>>,
}

/// Owns every sampler of every session.
#[derive(Clone)]
pub struct SamplerManager {
    inner: Arc<ManagerInner>,
}

impl SamplerManager {
    /// Creates a manager that schedules on the current tokio runtime, if any.
    pub fn new(runner: CollectorRunner, provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                runner,
                provider,
                runtime: Handle::try_current().ok(),
                samplers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a manager that schedules on `runtime`.
    pub fn with_runtime(
        runner: CollectorRunner,
        provider: Arc<dyn ConnectionProvider>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                runner,
                provider,
                runtime: Some(runtime),
                samplers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn runner(&self) -> &CollectorRunner {
        &self.inner.runner
    }

    /// Registers a sampler or replaces the definition of an existing one.
    ///
    /// A replaced sampler keeps its snapshot; the new schedule takes effect
    /// from its next tick. A stopped sampler is started again.
    pub fn upsert_sampler(
        &self,
        session_id: &str,
        sampler_id: &str,
        mut definition: SamplerDefinition,
    ) -> Result<SamplerStatusReport, EngineError> {
        if sampler_id.trim().is_empty() {
            return Err(EngineError::SamplerInvalidConfig(
                "sampler id is empty".to_string(),
            ));
        }
        if definition.sampler_id.is_empty() {
            definition.sampler_id = sampler_id.to_string();
        } else if definition.sampler_id != sampler_id {
            return Err(EngineError::SamplerInvalidConfig(format!(
                "definition is for sampler '{}', not '{sampler_id}'",
                definition.sampler_id
            )));
        }
        let plan = definition.plan()?;

        let runtime = self
            .inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or_else(|| {
                EngineError::SamplerUpdateFailed("no async runtime to schedule on".to_string())
            })?;
        self.inner.provider.db_type(session_id).map_err(|e| {
            EngineError::SamplerUpdateFailed(format!("session '{session_id}': {e}"))
        })?;

        let key = (session_id.to_string(), sampler_id.to_string());
        let enabled = definition.enabled;
        let mut samplers = self.inner.samplers.lock();
        let (handle, token) = match samplers.get(&key) {
            Some(handle) => {
                let token = handle
                    .state
                    .lock()
                    .replace(definition, plan, Instant::now());
                (handle.clone(), token)
            }
            None => {
                let state = SamplerState::new(definition, plan);
                let token = state.schedule_token.clone();
                let handle = Arc::new(SamplerHandle {
                    session: key.0.clone(),
                    sampler: key.1.clone(),
                    state: Mutex::new(state),
                });
                samplers.insert(key, handle.clone());
                (handle, token)
            }
        };
        drop(samplers);

        let mut state = handle.state.lock();
        if enabled {
            let plan = state.plan.clone();
            runtime.spawn(schedule_loop(self.inner.clone(), handle.clone(), plan, token));
            info!(session = %handle.session, sampler = %handle.sampler, "sampler scheduled");
        } else {
            state.stop(REASON_DISABLED);
            info!(session = %handle.session, sampler = %handle.sampler, "sampler registered disabled");
        }
        Ok(state.report())
    }

    /// Starts a stopped sampler again with its current definition.
    pub fn restart_sampler(
        &self,
        session_id: &str,
        sampler_id: &str,
    ) -> Result<SamplerStatusReport, EngineError> {
        let handle = self.handle(session_id, sampler_id)?;
        let mut definition = handle.state.lock().definition.clone();
        definition.enabled = true;
        self.upsert_sampler(session_id, sampler_id, definition)
    }

    /// Stops ticking and cancels in-flight runs. The sampler stays registered.
    pub fn stop_sampler(
        &self,
        session_id: &str,
        sampler_id: &str,
    ) -> Result<SamplerStatusReport, EngineError> {
        let handle = self.handle(session_id, sampler_id)?;
        let mut state = handle.state.lock();
        if state.phase != SamplerPhase::Stopped {
            state.stop(REASON_STOPPED_BY_REQUEST);
            info!(session = session_id, sampler = sampler_id, "sampler stopped");
        }
        Ok(state.report())
    }

    /// Stops a sampler and forgets it.
    pub fn remove_sampler(&self, session_id: &str, sampler_id: &str) -> Result<(), EngineError> {
        let key = (session_id.to_string(), sampler_id.to_string());
        let handle = self
            .inner
            .samplers
            .lock()
            .remove(&key)
            .ok_or_else(|| not_found(session_id, sampler_id))?;
        handle.state.lock().stop(REASON_STOPPED_BY_REQUEST);
        debug!(session = session_id, sampler = sampler_id, "sampler removed");
        Ok(())
    }

    /// Stops and removes every sampler of a session. Call before releasing
    /// the session's connection resources.
    pub fn teardown_session(&self, session_id: &str) -> usize {
        let removed: Vec<Arc<SamplerHandle>> = {
            let mut samplers = self.inner.samplers.lock();
            let keys: Vec<SamplerKey> = samplers
                .keys()
                .filter(|(session, _)| session == session_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| samplers.remove(k)).collect()
        };
        for handle in &removed {
            handle.state.lock().stop(REASON_STOPPED_BY_REQUEST);
        }
        if !removed.is_empty() {
            info!(session = session_id, samplers = removed.len(), "session torn down");
        }
        removed.len()
    }

    /// Tears down every session.
    pub fn shutdown(&self) {
        for session in self.session_ids() {
            self.teardown_session(&session);
        }
    }

    /// Sessions owning at least one sampler, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .samplers
            .lock()
            .keys()
            .map(|(session, _)| session.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Sampler ids of a session, sorted.
    pub fn list_sampler_ids(&self, session_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .samplers
            .lock()
            .keys()
            .filter(|(session, _)| session == session_id)
            .map(|(_, sampler)| sampler.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn get_sampler_status(
        &self,
        session_id: &str,
        sampler_id: &str,
    ) -> Result<SamplerStatusReport, EngineError> {
        Ok(self.handle(session_id, sampler_id)?.state.lock().report())
    }

    /// Latest successful snapshot, or why there is none.
    pub fn get_snapshot(&self, session_id: &str, sampler_id: &str) -> SnapshotLookup {
        match self.handle(session_id, sampler_id) {
            Ok(handle) => handle.state.lock().lookup(),
            Err(_) => SnapshotLookup::NotFound,
        }
    }

    /// Retained snapshots, oldest first.
    pub fn get_snapshot_history(
        &self,
        session_id: &str,
        sampler_id: &str,
    ) -> Result<Vec<SnapshotEntry>, EngineError> {
        let handle = self.handle(session_id, sampler_id)?;
        let mut state = handle.state.lock();
        Ok(state.snapshots.history(Instant::now()))
    }

    /// Current definition of a sampler.
    pub fn get_definition(
        &self,
        session_id: &str,
        sampler_id: &str,
    ) -> Result<SamplerDefinition, EngineError> {
        Ok(self
            .handle(session_id, sampler_id)?
            .state
            .lock()
            .definition
            .clone())
    }

    fn handle(&self, session_id: &str, sampler_id: &str) -> Result<Arc<SamplerHandle>, EngineError> {
        self.inner
            .samplers
            .lock()
            .get(&(session_id.to_string(), sampler_id.to_string()))
            .cloned()
            .ok_or_else(|| not_found(session_id, sampler_id))
    }
}

fn not_found(session_id: &str, sampler_id: &str) -> EngineError {
    EngineError::SamplerNotFound {
        session: session_id.to_string(),
        sampler: sampler_id.to_string(),
    }
}

/// Fires ticks until `token` is cancelled.
async fn schedule_loop(
    inner: Arc<ManagerInner>,
    handle: Arc<SamplerHandle>,
    plan: Arc<SamplerPlan>,
    token: CancellationToken,
) {
    let first = plan.start_delay + schedule::jitter(plan.jitter);

    match &plan.trigger {
        Trigger::Interval(period) => {
            handle.state.lock().next_tick_at = wall_clock_after(first);
            let start = tokio::time::Instant::now() + first;
            let mut ticker = tokio::time::interval_at(start, *period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                handle.state.lock().next_tick_at = wall_clock_after(*period);
                fire(&inner, &handle);
            }
        }
        Trigger::Cron { .. } => {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(first) => {}
            }
            let mut previous = None;
            loop {
                let now = Utc::now();
                let Some(at) = plan.trigger.next_cron_fire_after(now, previous) else {
                    warn!(
                        session = %handle.session,
                        sampler = %handle.sampler,
                        "cron expression has no future fire time"
                    );
                    let mut state = handle.state.lock();
                    if !token.is_cancelled() {
                        state.stop(REASON_CRON_EXHAUSTED);
                    }
                    break;
                };
                handle.state.lock().next_tick_at = Some(at);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(schedule::until(at, now)) => {}
                }
                previous = Some(at);
                fire(&inner, &handle);
            }
        }
    }
    debug!(session = %handle.session, sampler = %handle.sampler, "schedule loop finished");
}

/// Wall-clock time `d` from now; `None` past the representable range.
fn wall_clock_after(d: Duration) -> Option<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
}

fn fire(inner: &Arc<ManagerInner>, handle: &Arc<SamplerHandle>) {
    let decision = handle.state.lock().on_tick(Utc::now());
    match decision {
        TickDecision::Run(ticket) => {
            tokio::spawn(execute(inner.clone(), handle.clone(), ticket));
        }
        TickDecision::Skipped => {
            debug!(session = %handle.session, sampler = %handle.sampler, "tick skipped");
        }
        TickDecision::Queued => {
            debug!(session = %handle.session, sampler = %handle.sampler, "tick queued");
        }
    }
}

/// Runs a ticket, then any queued tick it unblocks.
async fn execute(inner: Arc<ManagerInner>, handle: Arc<SamplerHandle>, ticket: RunTicket) {
    let mut ticket = ticket;
    loop {
        let started = Instant::now();
        let (outcome, abandoned) = run_once(&inner, &handle, &ticket).await;
        let elapsed = started.elapsed();

        if let Err(e) = &outcome
            && (!ticket.token.is_cancelled() || matches!(e, EngineError::Timeout(_)))
        {
            warn!(
                session = %handle.session,
                sampler = %handle.sampler,
                duration_ms = elapsed.as_millis() as u64,
                error = %e,
                "sampler run failed"
            );
        }
        if let Trigger::Interval(period) = ticket.plan.trigger
            && elapsed > period
        {
            warn!(
                session = %handle.session,
                sampler = %handle.sampler,
                duration_ms = elapsed.as_millis() as u64,
                interval_ms = period.as_millis() as u64,
                "sampler run exceeded its interval"
            );
        }

        let completion = handle.state.lock().complete(
            ticket.id,
            outcome,
            abandoned.is_some(),
            Instant::now(),
        );
        if completion.discarded {
            debug!(session = %handle.session, sampler = %handle.sampler, "run result discarded");
        }
        if completion.stopped {
            warn!(
                session = %handle.session,
                sampler = %handle.sampler,
                "sampler stopped by error policy"
            );
        }
        let mut next = completion.next;
        if let Some(job) = abandoned {
            // The database call keeps its slot until it returns.
            let _ = job.await;
            debug!(session = %handle.session, sampler = %handle.sampler, "abandoned run returned");
            let queued = handle.state.lock().drained();
            next = next.or(queued);
        }
        match next {
            Some(next) => ticket = next,
            None => break,
        }
    }
}

type RunJob = JoinHandle<Result<CollectorResult, EngineError>>;

/// One bounded execution: acquire, run, release.
///
/// On timeout or cancellation the outcome is returned at once together with
/// the blocking job, which is still running its database call.
async fn run_once(
    inner: &Arc<ManagerInner>,
    handle: &Arc<SamplerHandle>,
    ticket: &RunTicket,
) -> (Result<CollectorResult, EngineError>, Option<RunJob>) {
    let plan = ticket.plan.clone();
    let token = ticket.token.clone();
    let interrupt_slot: Arc<Mutex<Option<Arc<dyn CancelHandle>>>> = Arc::new(Mutex::new(None));

    let mut job = {
        let runner = inner.runner.clone();
        let provider = inner.provider.clone();
        let session = handle.session.clone();
        let slot = interrupt_slot.clone();
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            let db_type = provider.db_type(&session).map_err(EngineError::Connection)?;
            let mut conn = provider.acquire(&session).map_err(EngineError::Connection)?;
            *slot.lock() = conn.cancel_handle();
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let mut ctx = RunContext::new().with_token(token);
            if let Some(secs) = plan.interval_sec {
                ctx = ctx.with_interval(secs);
            }
            let result = runner.run_collector_with(
                conn.as_mut(),
                &db_type,
                &plan.target,
                &plan.queries,
                &ctx,
            );
            slot.lock().take();
            result
        })
    };

    let timeout = ticket.plan.timeout;
    tokio::select! {
        joined = &mut job => {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(EngineError::Db(DbError::Query(format!("sampler run aborted: {e}")))),
            };
            (outcome, None)
        }
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            interrupt(&interrupt_slot, handle);
            (Err(EngineError::Timeout(timeout)), Some(job))
        }
        _ = token.cancelled() => {
            interrupt(&interrupt_slot, handle);
            (Err(EngineError::Cancelled), Some(job))
        }
    }
}

/// Asks the database to abort the statement running on the run's connection.
fn interrupt(slot: &Mutex<Option<Arc<dyn CancelHandle>>>, handle: &SamplerHandle) {
    let Some(cancel) = slot.lock().clone() else {
        return;
    };
    debug!(session = %handle.session, sampler = %handle.sampler, "cancelling in-flight query");
    tokio::task::spawn_blocking(move || cancel.cancel());
}
