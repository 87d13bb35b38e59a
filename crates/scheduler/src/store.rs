//! Hybrid job store — YAML definitions + SQLite runtime state.
//!
//! Humans own the config file (rewritten only on CRUD, atomically); the
//! program owns the state DB (written on every run). An in-memory map of
//! merged jobs serves queries; the two artifacts are reconciled at startup
//! and on reload.
//!
//! Failed state writes are queued and retried on the next timer tick; while
//! any write is pending the store reports itself degraded and the registry
//! refuses new jobs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::calc::{next_fire_ms, now_ms};
use crate::config::{ConfigFile, JobEntry};
use crate::cron::parse_tz;
use crate::db::{StateDb, StateRow, STATE_DB_NAME};
use crate::error::{Error, Result};
use crate::model::{
    JobFilter, JobRun, JobState, JobStats, JobStatus, RunFilter, Schedule, ScheduledJob,
    TimestampMs,
};

pub struct SchedulerStore {
    jobs: RwLock<HashMap<String, ScheduledJob>>,
    config: ConfigFile,
    db: StateDb,
    /// Set when the config file failed to parse; config writes are refused
    /// until a successful reload so the user's file is never clobbered.
    config_poisoned: AtomicBool,
    /// Set while any state write is pending retry.
    degraded: AtomicBool,
    /// Job ids whose state row failed to persist.
    dirty_state: Mutex<HashSet<String>>,
    /// Run records that failed to persist.
    pending_runs: Mutex<Vec<JobRun>>,
}

impl SchedulerStore {
    /// Open both artifacts under `data_dir` and reconcile them.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let config = ConfigFile::new(data_dir);
        let db = StateDb::open(&data_dir.join(STATE_DB_NAME))?;

        let (entries, poisoned) = match config.load() {
            Ok(entries) => (entries, false),
            Err(e) => {
                tracing::error!(error = %e, path = %config.path().display(),
                    "config file unreadable; starting empty, config writes disabled");
                (Vec::new(), true)
            }
        };

        let map = reconcile(&db, entries)?;
        Ok(Self {
            jobs: RwLock::new(map),
            config,
            db,
            config_poisoned: AtomicBool::new(poisoned),
            degraded: AtomicBool::new(false),
            dirty_state: Mutex::new(HashSet::new()),
            pending_runs: Mutex::new(Vec::new()),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn is_config_poisoned(&self) -> bool {
        self.config_poisoned.load(Ordering::SeqCst)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> Option<ScheduledJob> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.jobs.read().await.contains_key(id)
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| filter.include_disabled || j.enabled)
            .filter(|j| filter.user_id.as_deref().map_or(true, |u| j.user_id == u))
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Armed jobs due at or before `before_ms`, soonest first.
    pub async fn due_jobs(&self, before_ms: TimestampMs) -> Vec<ScheduledJob> {
        let mut due: Vec<ScheduledJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.is_armed())
            .filter(|j| j.state.next_run_at_ms.map_or(false, |next| next <= before_ms))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.state.next_run_at_ms);
        due
    }

    /// The earliest `next_run_at_ms` across armed jobs.
    pub async fn next_run_time(&self) -> Option<TimestampMs> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.is_armed())
            .filter_map(|j| j.state.next_run_at_ms)
            .min()
    }

    pub async fn counts(&self) -> (usize, usize, usize) {
        let jobs = self.jobs.read().await;
        let total = jobs.len();
        let active = jobs.values().filter(|j| j.status == JobStatus::Active).count();
        let paused = jobs.values().filter(|j| j.status == JobStatus::Paused).count();
        (total, active, paused)
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Insert a brand-new job: memory + state row + config rewrite.
    pub async fn insert(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        if self.is_config_poisoned() {
            return Err(Error::ConfigPoisoned(
                self.config.path().display().to_string(),
            ));
        }
        self.db.upsert_state(&job.id, &to_row(&job))?;
        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(job.id.clone(), job.clone());
        }
        self.write_config().await?;
        Ok(job)
    }

    /// Mutate a job's definition. Rewrites the config file.
    pub async fn update_definition(
        &self,
        id: &str,
        f: impl FnOnce(&mut ScheduledJob),
    ) -> Result<ScheduledJob> {
        if self.is_config_poisoned() {
            return Err(Error::ConfigPoisoned(
                self.config.path().display().to_string(),
            ));
        }
        let job = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(id).ok_or_else(|| Error::JobNotFound(id.into()))?;
            f(job);
            job.clone()
        };
        self.db.upsert_state(&job.id, &to_row(&job))?;
        self.write_config().await?;
        Ok(job)
    }

    /// Mutate runtime state from a caller-facing operation (pause/resume).
    /// No config rewrite; DB errors surface to the caller.
    pub async fn update_runtime(
        &self,
        id: &str,
        f: impl FnOnce(&mut ScheduledJob),
    ) -> Result<ScheduledJob> {
        let job = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(id).ok_or_else(|| Error::JobNotFound(id.into()))?;
            f(job);
            job.clone()
        };
        self.db.upsert_state(&job.id, &to_row(&job))?;
        Ok(job)
    }

    /// Mutate a job's runtime state only. Never touches the config file; a
    /// failed DB write is queued for retry instead of surfacing.
    pub async fn update_state(
        &self,
        id: &str,
        f: impl FnOnce(&mut ScheduledJob),
    ) -> Option<ScheduledJob> {
        let job = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(id)?;
            f(job);
            job.clone()
        };
        if let Err(e) = self.db.upsert_state(&job.id, &to_row(&job)) {
            tracing::warn!(job_id = %job.id, error = %e, "state write failed; queued for retry");
            self.dirty_state.lock().insert(job.id.clone());
            self.degraded.store(true, Ordering::SeqCst);
        }
        Some(job)
    }

    /// Delete a job, its state row, and its run history.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let existed = self.jobs.write().await.remove(id).is_some();
        if !existed {
            return Ok(false);
        }
        self.db.delete_job(id)?;
        self.write_config().await?;
        Ok(true)
    }

    /// Rewrite the config file from the current job set, in creation order.
    async fn write_config(&self) -> Result<()> {
        if self.is_config_poisoned() {
            return Err(Error::ConfigPoisoned(
                self.config.path().display().to_string(),
            ));
        }
        let jobs = self.jobs.read().await;
        let mut ordered: Vec<&ScheduledJob> = jobs.values().collect();
        ordered.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        let entries: Vec<JobEntry> = ordered.into_iter().map(JobEntry::from_job).collect();
        drop(jobs);
        self.config.save(&entries)
    }

    // ── Run history ─────────────────────────────────────────────────

    /// Persist a run record; on DB failure the record is kept in memory and
    /// retried on the next flush.
    pub fn save_run(&self, run: &JobRun) {
        if let Err(e) = self.db.insert_run(run) {
            tracing::warn!(run_id = %run.id, error = %e, "run write failed; queued for retry");
            self.pending_runs.lock().push(run.clone());
            self.degraded.store(true, Ordering::SeqCst);
        }
    }

    pub fn runs(&self, filter: &RunFilter) -> Result<(Vec<JobRun>, u64)> {
        self.db.list_runs(filter)
    }

    pub fn job_stats(&self, id: &str) -> Result<JobStats> {
        self.db.job_stats(id)
    }

    /// Run counts by status since local midnight in `timezone`.
    pub fn today_stats(&self, timezone: &str) -> Result<BTreeMap<String, u64>> {
        use chrono::TimeZone;
        let tz = parse_tz(timezone);
        let now_local = chrono::Utc::now().with_timezone(&tz);
        let midnight = now_local
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_else(|| now_local.naive_local());
        let since_ms = match tz.from_local_datetime(&midnight) {
            chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
                dt.timestamp_millis()
            }
            chrono::LocalResult::None => now_local.timestamp_millis(),
        };
        self.db.run_counts_since(since_ms)
    }

    pub fn delete_old_runs(&self, before_ms: TimestampMs) -> Result<usize> {
        self.db.delete_old_runs(before_ms)
    }

    // ── Reload & recovery ───────────────────────────────────────────

    /// Re-read the config file and reconcile against the live job set.
    /// Existing jobs keep their runtime state; new jobs are armed; jobs
    /// removed from the file are dropped with their state and history.
    pub async fn reload(&self) -> Result<usize> {
        let entries = self.config.load()?;
        self.config_poisoned.store(false, Ordering::SeqCst);
        let now = now_ms();

        let mut jobs = self.jobs.write().await;
        let mut next = HashMap::new();
        for entry in entries {
            let id = entry.id.clone();
            let job = match jobs.remove(&id) {
                Some(existing) => {
                    let schedule_changed = existing.schedule != entry.schedule;
                    let mut job = entry.into_job(
                        existing.state.clone(),
                        existing.status,
                        existing.created_at_ms,
                        now,
                    );
                    if schedule_changed {
                        rearm(&mut job, now);
                    }
                    job
                }
                None => {
                    let mut job = entry.into_job(JobState::default(), JobStatus::Pending, now, now);
                    arm_new(&mut job, now);
                    job
                }
            };
            self.db.upsert_state(&job.id, &to_row(&job))?;
            next.insert(id, job);
        }

        let keep: HashSet<String> = next.keys().cloned().collect();
        self.db.remove_orphans(&keep)?;
        let count = next.len();
        *jobs = next;
        tracing::info!(count, "config reloaded");
        Ok(count)
    }

    /// Retry queued state and run writes. Called once per timer tick.
    pub async fn flush_pending(&self) {
        if !self.is_degraded() {
            return;
        }
        let dirty: Vec<String> = self.dirty_state.lock().drain().collect();
        let mut still_dirty = HashSet::new();
        for id in dirty {
            if let Some(job) = self.get(&id).await {
                if let Err(e) = self.db.upsert_state(&id, &to_row(&job)) {
                    tracing::warn!(job_id = %id, error = %e, "state retry failed");
                    still_dirty.insert(id);
                }
            }
        }

        let pending: Vec<JobRun> = std::mem::take(&mut *self.pending_runs.lock());
        let mut still_pending = Vec::new();
        for run in pending {
            if self.db.insert_run(&run).is_err() {
                still_pending.push(run);
            }
        }

        let clean = still_dirty.is_empty() && still_pending.is_empty();
        *self.dirty_state.lock() = still_dirty;
        *self.pending_runs.lock() = still_pending;
        if clean {
            self.degraded.store(false, Ordering::SeqCst);
            tracing::info!("state persistence recovered");
        }
    }
}

/// Compute initial arming for a freshly defined job.
pub(crate) fn arm_new(job: &mut ScheduledJob, now: TimestampMs) {
    match next_fire_ms(&job.schedule, now, None) {
        Some(next) => {
            job.state.next_run_at_ms = Some(next);
            job.status = JobStatus::Active;
        }
        None => {
            job.state.next_run_at_ms = None;
            // An At instant already in the past is complete, not broken.
            job.status = match &job.schedule {
                Schedule::At { .. } => JobStatus::Completed,
                _ => {
                    job.state.last_error = Some("schedule has no future firings".into());
                    JobStatus::Failed
                }
            };
        }
    }
}

/// Re-arm after a schedule change: forget the last run so the new schedule
/// starts from now.
pub(crate) fn rearm(job: &mut ScheduledJob, now: TimestampMs) {
    if job.status != JobStatus::Paused {
        arm_new(job, now);
    } else {
        job.state.next_run_at_ms = None;
    }
}

pub(crate) fn to_row(job: &ScheduledJob) -> StateRow {
    StateRow {
        state: job.state.clone(),
        status: job.status,
        created_at_ms: job.created_at_ms,
        updated_at_ms: job.updated_at_ms,
    }
}

/// Startup reconciliation: attach existing state rows to config entries, arm
/// entries that have no state yet, and drop orphan rows.
fn reconcile(db: &StateDb, entries: Vec<JobEntry>) -> Result<HashMap<String, ScheduledJob>> {
    let states = db.load_states()?;
    let now = now_ms();

    let mut map = HashMap::new();
    for entry in entries {
        let id = entry.id.clone();
        if map.contains_key(&id) {
            tracing::warn!(job_id = %id, "duplicate job id in config file; keeping the first");
            continue;
        }
        let job = match states.get(&id) {
            Some(row) => entry.into_job(
                row.state.clone(),
                row.status,
                row.created_at_ms,
                row.updated_at_ms,
            ),
            None => {
                let mut job = entry.into_job(JobState::default(), JobStatus::Pending, now, now);
                arm_new(&mut job, now);
                db.upsert_state(&job.id, &to_row(&job))?;
                job
            }
        };
        map.insert(id, job);
    }

    let keep: HashSet<String> = map.keys().cloned().collect();
    let removed = db.remove_orphans(&keep)?;
    if removed > 0 {
        tracing::info!(removed, "removed orphan state rows");
    }
    tracing::info!(count = map.len(), "reconciled scheduled jobs");
    Ok(map)
}
