//! Job registry — CRUD operations that enforce the scheduling invariants
//! and recompute arming on every mutation.
//!
//! Validation failures surface synchronously and touch nothing; every
//! successful mutation pokes the timer so a sooner `next_run_at_ms` shortens
//! the current sleep immediately.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::calc::now_ms;
use crate::error::{Error, Result};
use crate::events::{EventBus, SchedulerEvent};
use crate::model::{JobCreate, JobPatch, JobState, JobStatus, ScheduledJob};
use crate::store::{arm_new, rearm, SchedulerStore};
use crate::validation::{validate_payload, validate_schedule};

pub struct JobRegistry {
    store: Arc<SchedulerStore>,
    bus: EventBus,
    wake: Arc<Notify>,
    manual_tx: mpsc::UnboundedSender<String>,
}

impl JobRegistry {
    pub fn new(
        store: Arc<SchedulerStore>,
        bus: EventBus,
        wake: Arc<Notify>,
        manual_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            store,
            bus,
            wake,
            manual_tx,
        }
    }

    /// Create a job: assign an id when absent, arm it (or mark it completed
    /// when its one-shot instant already passed), persist to both artifacts.
    pub async fn create(&self, spec: JobCreate) -> Result<ScheduledJob> {
        if self.store.is_degraded() {
            return Err(Error::Degraded(
                "state writes are failing; not accepting new jobs".into(),
            ));
        }
        validate_schedule(&spec.schedule)?;
        validate_payload(&spec.payload)?;
        for entry in &spec.on_complete {
            if entry.next_job_id.is_empty() {
                return Err(Error::validation("on_complete", "next_job_id is required"));
            }
        }

        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.store.contains(&id).await {
            return Err(Error::DuplicateJob(id));
        }

        let now = now_ms();
        let mut job = ScheduledJob {
            id,
            user_id: spec.user_id,
            agent_id: spec.agent_id,
            name: spec.name,
            description: spec.description,
            enabled: spec.enabled,
            schedule: spec.schedule,
            payload: spec.payload,
            target: spec.target,
            max_retries: spec.max_retries,
            retry_delay_ms: spec.retry_delay_ms,
            on_complete: spec.on_complete,
            state: JobState::default(),
            status: JobStatus::Pending,
            created_at_ms: now,
            updated_at_ms: now,
            extra: Default::default(),
        };
        arm_new(&mut job, now);

        let job = self.store.insert(job).await?;
        tracing::info!(job_id = %job.id, name = %job.name, status = ?job.status, "job created");
        self.bus.publish(SchedulerEvent::JobCreated {
            job: Box::new(job.clone()),
        });
        self.wake.notify_one();
        Ok(job)
    }

    /// Apply a partial update. A schedule change re-arms from now with the
    /// last run forgotten.
    pub async fn patch(&self, id: &str, patch: JobPatch) -> Result<ScheduledJob> {
        if let Some(schedule) = &patch.schedule {
            validate_schedule(schedule)?;
        }
        if let Some(payload) = &patch.payload {
            validate_payload(payload)?;
        }

        let now = now_ms();
        let job = self
            .store
            .update_definition(id, |job| {
                let schedule_changed = patch.apply(job);
                if schedule_changed {
                    job.state.last_run_at_ms = None;
                    rearm(job, now);
                }
            })
            .await?;

        tracing::info!(job_id = %id, "job patched");
        self.bus.publish(SchedulerEvent::JobUpdated {
            job: Box::new(job.clone()),
        });
        self.wake.notify_one();
        Ok(job)
    }

    /// Pause an active job. Idempotent.
    pub async fn pause(&self, id: &str) -> Result<ScheduledJob> {
        let job = self
            .store
            .update_runtime(id, |job| {
                if job.status == JobStatus::Active {
                    job.status = JobStatus::Paused;
                    job.updated_at_ms = now_ms();
                }
            })
            .await?;
        if job.status != JobStatus::Paused {
            return Err(Error::validation(
                "status",
                format!("cannot pause a {} job", job.status.as_str()),
            ));
        }
        tracing::info!(job_id = %id, "job paused");
        self.bus.publish(SchedulerEvent::JobUpdated {
            job: Box::new(job.clone()),
        });
        Ok(job)
    }

    /// Resume a paused job, recomputing its next fire from now. Idempotent.
    pub async fn resume(&self, id: &str) -> Result<ScheduledJob> {
        let now = now_ms();
        let job = self
            .store
            .update_runtime(id, |job| {
                if job.status == JobStatus::Paused {
                    job.status = JobStatus::Active;
                    job.updated_at_ms = now;
                    let last = job.state.last_run_at_ms;
                    match crate::calc::next_fire_ms(&job.schedule, now, last) {
                        Some(next) => job.state.next_run_at_ms = Some(next),
                        None => {
                            job.state.next_run_at_ms = None;
                            job.status = JobStatus::Completed;
                        }
                    }
                }
            })
            .await?;
        if job.status == JobStatus::Paused {
            return Err(Error::validation("status", "job did not resume"));
        }
        tracing::info!(job_id = %id, status = ?job.status, "job resumed");
        self.bus.publish(SchedulerEvent::JobUpdated {
            job: Box::new(job.clone()),
        });
        self.wake.notify_one();
        Ok(job)
    }

    /// Enqueue an immediate execution that does not consume the schedule.
    pub async fn run_once(&self, id: &str) -> Result<()> {
        if !self.store.contains(id).await {
            return Err(Error::JobNotFound(id.into()));
        }
        self.manual_tx
            .send(id.to_string())
            .map_err(|_| Error::NotRunning)?;
        Ok(())
    }

    /// Delete a job, cascading to its state and run history.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.store.delete(id).await?;
        if removed {
            tracing::info!(job_id = %id, "job deleted");
            self.bus
                .publish(SchedulerEvent::JobDeleted { job_id: id.into() });
            self.wake.notify_one();
        }
        Ok(removed)
    }
}
