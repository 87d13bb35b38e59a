//! Timer loop — a single long-lived task that drives all job execution.
//!
//! The loop sleeps until the earliest `next_run_at_ms` (bounded by a maximum
//! tick so hand-edited or sooner jobs are picked up promptly), wakes early on
//! registry mutations, and hands each due job to the executor as an
//! independent task. A job never overlaps itself: a selection that finds the
//! previous run still in flight is recorded as `skipped` and re-armed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::calc::{next_fire_ms, now_ms};
use crate::executor::{Executor, RunReason};
use crate::model::{JobRun, JobStatus, RunStatus, Schedule, TimestampMs};
use crate::store::SchedulerStore;

/// Upper bound on one sleep, so newly added sooner jobs are seen even
/// without an explicit wake-up.
pub const MAX_TICK: Duration = Duration::from_secs(30);

/// An armed one-shot whose instant is older than this at selection time was
/// missed while the scheduler was down; it completes with a skipped record
/// instead of firing late.
const MISSED_AT_GRACE_MS: TimestampMs = 120_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SingleFlight
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-job in-flight marker enforcing the no-overlap rule.
pub struct SingleFlight {
    busy: parking_lot::Mutex<HashSet<String>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            busy: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Claim the job's slot. Returns false when a run is already in flight.
    pub fn try_begin(&self, job_id: &str) -> bool {
        self.busy.lock().insert(job_id.to_string())
    }

    pub fn end(&self, job_id: &str) {
        self.busy.lock().remove(job_id);
    }

    pub fn in_flight(&self, job_id: &str) -> bool {
        self.busy.lock().contains(job_id)
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TimerLoop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TimerLoop {
    store: Arc<SchedulerStore>,
    executor: Arc<Executor>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    manual_rx: mpsc::UnboundedReceiver<String>,
    inflight: Arc<SingleFlight>,
    tracker: TaskTracker,
    max_tick: Duration,
}

impl TimerLoop {
    pub fn new(
        store: Arc<SchedulerStore>,
        executor: Arc<Executor>,
        wake: Arc<Notify>,
        cancel: CancellationToken,
        manual_rx: mpsc::UnboundedReceiver<String>,
        tracker: TaskTracker,
        max_tick: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            wake,
            cancel,
            manual_rx,
            inflight: Arc::new(SingleFlight::new()),
            tracker,
            max_tick,
        }
    }

    /// Drive the clock until cancellation.
    pub async fn run(mut self) {
        tracing::info!("timer loop started");
        loop {
            let sleep_for = self.next_sleep().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {
                    self.tick().await;
                }
                _ = self.wake.notified() => {
                    // A mutation may have armed a sooner job; re-plan after
                    // picking up anything already due.
                    self.tick().await;
                }
                Some(job_id) = self.manual_rx.recv() => {
                    self.fire_manual(&job_id).await;
                }
            }
        }
        tracing::info!("timer loop stopped");
    }

    /// Sleep until the earliest armed fire, bounded by `max_tick`.
    async fn next_sleep(&self) -> Duration {
        match self.store.next_run_time().await {
            Some(next) => {
                let delta = next.saturating_sub(now_ms()).max(0) as u64;
                Duration::from_millis(delta).min(self.max_tick)
            }
            None => self.max_tick,
        }
    }

    /// One scheduling pass: retry queued writes, then launch every due job.
    pub(crate) async fn tick(&self) {
        self.store.flush_pending().await;

        let now = now_ms();
        let due = self.store.due_jobs(now).await;
        for job in due {
            // A one-shot that slept through its window (scheduler down)
            // completes instead of firing late.
            if let Schedule::At { .. } = job.schedule {
                let overdue = job
                    .state
                    .next_run_at_ms
                    .map_or(false, |t| now - t > MISSED_AT_GRACE_MS);
                if overdue {
                    tracing::warn!(job_id = %job.id, "one-shot missed its window; completing");
                    self.record_skip(&job.id, now, "missed while scheduler was down");
                    self.store
                        .update_state(&job.id, |j| {
                            j.state.next_run_at_ms = None;
                            j.state.last_status = Some(RunStatus::Skipped);
                            j.status = JobStatus::Completed;
                        })
                        .await;
                    continue;
                }
            }

            if !self.inflight.try_begin(&job.id) {
                tracing::warn!(job_id = %job.id, "previous run still in flight; skipping");
                self.record_skip(&job.id, now, "previous run still in flight");
                self.store
                    .update_state(&job.id, |j| {
                        j.state.next_run_at_ms = next_fire_ms(&j.schedule, now, Some(now));
                    })
                    .await;
                continue;
            }

            // Provisionally advance the fire time at launch so this slot is
            // consumed even before the run finalizes; finalization overwrites
            // it with the authoritative value (or a retry slot).
            self.store
                .update_state(&job.id, |j| {
                    j.state.next_run_at_ms = next_fire_ms(&j.schedule, now, Some(now));
                })
                .await;

            let executor = self.executor.clone();
            let inflight = self.inflight.clone();
            self.tracker.spawn(async move {
                executor.execute(&job, RunReason::Scheduled).await;
                inflight.end(&job.id);
            });
        }
    }

    /// Immediate execution requested through `run_once`.
    async fn fire_manual(&self, job_id: &str) {
        let Some(job) = self.store.get(job_id).await else {
            tracing::warn!(job_id = %job_id, "run_once target no longer exists");
            return;
        };
        if !self.inflight.try_begin(&job.id) {
            tracing::warn!(job_id = %job.id, "run_once skipped; a run is in flight");
            self.record_skip(&job.id, now_ms(), "previous run still in flight");
            return;
        }
        let executor = self.executor.clone();
        let inflight = self.inflight.clone();
        self.tracker.spawn(async move {
            executor.execute(&job, RunReason::Manual).await;
            inflight.end(&job.id);
        });
    }

    fn record_skip(&self, job_id: &str, now: TimestampMs, reason: &str) {
        let mut run = JobRun::new(job_id, now);
        run.status = RunStatus::Skipped;
        run.error = Some(reason.to_string());
        self.store.save_run(&run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::Collaborators;
    use crate::events::EventBus;
    use crate::model::{
        AgentTurnPayload, JobCreate, JobState, Payload, RunFilter, ScheduledJob, SessionTarget,
    };

    fn make_loop(
        store: Arc<SchedulerStore>,
        collab: Collaborators,
    ) -> (TimerLoop, mpsc::UnboundedSender<String>) {
        let cancel = CancellationToken::new();
        let executor = Arc::new(Executor::new(
            store.clone(),
            collab,
            EventBus::new(),
            cancel.clone(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = TimerLoop::new(
            store,
            executor,
            Arc::new(Notify::new()),
            cancel,
            rx,
            TaskTracker::new(),
            MAX_TICK,
        );
        (timer, tx)
    }

    fn job(id: &str, schedule: Schedule, next_run: TimestampMs) -> ScheduledJob {
        let now = now_ms();
        let spec = JobCreate::new(
            schedule,
            Payload::AgentTurn(AgentTurnPayload {
                prompt: "x".into(),
                ..Default::default()
            }),
        );
        ScheduledJob {
            id: id.into(),
            user_id: spec.user_id,
            agent_id: spec.agent_id,
            name: id.into(),
            description: String::new(),
            enabled: true,
            schedule: spec.schedule,
            payload: spec.payload,
            target: SessionTarget::default(),
            max_retries: 3,
            retry_delay_ms: 60_000,
            on_complete: vec![],
            state: JobState {
                next_run_at_ms: Some(next_run),
                ..Default::default()
            },
            status: JobStatus::Active,
            created_at_ms: now,
            updated_at_ms: now,
            extra: Default::default(),
        }
    }

    #[test]
    fn single_flight_claims_once() {
        let guard = SingleFlight::new();
        assert!(guard.try_begin("a"));
        assert!(!guard.try_begin("a"));
        assert!(guard.try_begin("b"), "jobs are independent");
        guard.end("a");
        assert!(guard.try_begin("a"));
    }

    #[tokio::test]
    async fn overlap_selection_is_skipped_and_rearmed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SchedulerStore::open(dir.path()).unwrap());
        let (timer, _tx) = make_loop(store.clone(), Collaborators::default());

        let now = now_ms();
        store
            .insert(job("a", Schedule::Every { interval_ms: 60_000 }, now - 10))
            .await
            .unwrap();

        // Simulate an in-flight run, then tick.
        assert!(timer.inflight.try_begin("a"));
        timer.tick().await;

        let (runs, total) = store
            .runs(&RunFilter {
                job_id: Some("a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(runs[0].status, RunStatus::Skipped);

        let updated = store.get("a").await.unwrap();
        assert!(updated.state.next_run_at_ms.unwrap() > now, "re-armed from now");
        assert_eq!(updated.state.run_count, 0, "skips do not count as runs");
    }

    #[tokio::test]
    async fn missed_one_shot_completes_with_skip_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SchedulerStore::open(dir.path()).unwrap());
        let (timer, _tx) = make_loop(store.clone(), Collaborators::default());

        let now = now_ms();
        let stale = now - MISSED_AT_GRACE_MS - 1_000;
        store
            .insert(job("old", Schedule::At { at_ms: stale }, stale))
            .await
            .unwrap();

        timer.tick().await;
        timer.tracker.close();
        timer.tracker.wait().await;

        let updated = store.get("old").await.unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        assert_eq!(updated.state.next_run_at_ms, None);

        let (runs, total) = store
            .runs(&RunFilter {
                job_id: Some("old".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(runs[0].status, RunStatus::Skipped);
    }

    #[tokio::test]
    async fn due_job_is_executed_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SchedulerStore::open(dir.path()).unwrap());

        // No agent runner: the run fails, but it still proves selection.
        let (timer, _tx) = make_loop(store.clone(), Collaborators::default());

        let now = now_ms();
        store
            .insert(job("a", Schedule::Every { interval_ms: 60_000 }, now - 10))
            .await
            .unwrap();

        timer.tick().await;
        timer.tracker.close();
        timer.tracker.wait().await;

        let updated = store.get("a").await.unwrap();
        assert_eq!(updated.state.run_count, 1);
        assert_eq!(updated.state.consecutive_failures, 1);
        assert!(updated.state.next_run_at_ms.is_some(), "retry slot armed");
    }

    #[tokio::test]
    async fn next_sleep_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SchedulerStore::open(dir.path()).unwrap());
        let (timer, _tx) = make_loop(store.clone(), Collaborators::default());

        // Empty store: the bound applies.
        assert_eq!(timer.next_sleep().await, MAX_TICK);

        // A job far in the future: still bounded.
        let now = now_ms();
        store
            .insert(job("far", Schedule::Every { interval_ms: 60_000 }, now + 3_600_000))
            .await
            .unwrap();
        assert_eq!(timer.next_sleep().await, MAX_TICK);

        // A due job: no sleep.
        store
            .insert(job("due", Schedule::Every { interval_ms: 60_000 }, now - 100))
            .await
            .unwrap();
        assert_eq!(timer.next_sleep().await, Duration::from_millis(0));
    }
}
