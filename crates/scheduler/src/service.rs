//! `SchedulerService` — the programmatic surface consumed by the
//! surrounding daemon.
//!
//! Construction wires the hybrid store, registry, executor, and event bus;
//! `start` launches the timer loop; `shutdown` cancels it together with
//! every in-flight run and waits for them to finish their persistence
//! writes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::callbacks::Collaborators;
use crate::error::Result;
use crate::events::{EventBus, SchedulerEvent};
use crate::executor::Executor;
use crate::model::{
    JobCreate, JobFilter, JobPatch, JobRun, JobStats, RunFilter, ScheduledJob, SchedulerStatus,
    TimestampMs, DEFAULT_TIMEZONE,
};
use crate::registry::JobRegistry;
use crate::runner::{TimerLoop, MAX_TICK};
use crate::store::SchedulerStore;

/// Engine configuration. Only the data directory is required.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Writable directory holding `scheduler.yaml` and `scheduler_state.db`.
    pub data_dir: PathBuf,
    /// Timezone for the `today_stats` window.
    pub timezone: String,
    /// Upper bound on one timer sleep.
    pub max_tick: Duration,
}

impl SchedulerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            max_tick: MAX_TICK,
        }
    }
}

pub struct SchedulerService {
    config: SchedulerConfig,
    store: Arc<SchedulerStore>,
    registry: JobRegistry,
    bus: EventBus,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
    timer_parts: Mutex<Option<(Arc<Executor>, mpsc::UnboundedReceiver<String>)>>,
}

impl SchedulerService {
    /// Open the store under `config.data_dir` and wire the components.
    /// Collaborators are optional; a job that needs a missing one fails at
    /// run time with a clear error.
    pub fn new(config: SchedulerConfig, collaborators: Collaborators) -> Result<Self> {
        let store = Arc::new(SchedulerStore::open(&config.data_dir)?);
        let bus = EventBus::new();
        let wake = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let (manual_tx, manual_rx) = mpsc::unbounded_channel();

        let registry = JobRegistry::new(store.clone(), bus.clone(), wake.clone(), manual_tx);
        let executor = Arc::new(Executor::new(
            store.clone(),
            collaborators,
            bus.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            config,
            store,
            registry,
            bus,
            wake,
            cancel,
            tracker: TaskTracker::new(),
            running: AtomicBool::new(false),
            timer_parts: Mutex::new(Some((executor, manual_rx))),
        })
    }

    /// Launch the timer loop. Idempotent; the second call is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some((executor, manual_rx)) = self.timer_parts.lock().take() else {
            return;
        };
        let timer = TimerLoop::new(
            self.store.clone(),
            executor,
            self.wake.clone(),
            self.cancel.clone(),
            manual_rx,
            self.tracker.clone(),
            self.config.max_tick,
        );
        self.tracker.spawn(timer.run());
        tracing::info!(data_dir = %self.config.data_dir.display(), "scheduler started");
    }

    /// Cancel the timer and all in-flight runs, then wait for them to finish
    /// their current persistence writes.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("scheduler shut down");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Job operations ──────────────────────────────────────────────

    pub async fn create(&self, spec: JobCreate) -> Result<ScheduledJob> {
        self.registry.create(spec).await
    }

    pub async fn patch(&self, id: &str, patch: JobPatch) -> Result<ScheduledJob> {
        self.registry.patch(id, patch).await
    }

    pub async fn pause(&self, id: &str) -> Result<ScheduledJob> {
        self.registry.pause(id).await
    }

    pub async fn resume(&self, id: &str) -> Result<ScheduledJob> {
        self.registry.resume(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.registry.delete(id).await
    }

    /// Execute a job immediately without consuming its schedule. The run
    /// fires on the timer task; requests queue until `start`.
    pub async fn run_once(&self, id: &str) -> Result<()> {
        self.registry.run_once(id).await
    }

    pub async fn get(&self, id: &str) -> Option<ScheduledJob> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<ScheduledJob> {
        self.store.list(filter).await
    }

    // ── History & stats ─────────────────────────────────────────────

    pub fn runs(&self, filter: &RunFilter) -> Result<(Vec<JobRun>, u64)> {
        self.store.runs(filter)
    }

    pub fn job_stats(&self, id: &str) -> Result<JobStats> {
        self.store.job_stats(id)
    }

    pub fn today_stats(&self) -> Result<BTreeMap<String, u64>> {
        self.store.today_stats(&self.config.timezone)
    }

    pub fn delete_old_runs(&self, before_ms: TimestampMs) -> Result<usize> {
        self.store.delete_old_runs(before_ms)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let (jobs_total, jobs_active, jobs_paused) = self.store.counts().await;
        SchedulerStatus {
            running: self.is_running(),
            jobs_total,
            jobs_active,
            jobs_paused,
            next_run_at_ms: self.store.next_run_time().await,
        }
    }

    // ── Config & events ─────────────────────────────────────────────

    /// Re-read the config file and reconcile. Returns the job count.
    pub async fn reload_config(&self) -> Result<usize> {
        let count = self.store.reload().await?;
        self.wake.notify_one();
        Ok(count)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.bus.subscribe()
    }
}
