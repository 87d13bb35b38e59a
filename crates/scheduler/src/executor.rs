//! Job executor — dispatches due jobs to their payload handler, records run
//! history, applies the retry policy, and triggers task chains.
//!
//! Chains are walked iteratively with a bounded depth so an accidental cycle
//! cannot recurse forever. A chained execution never touches the target
//! job's own `next_run_at_ms`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::calc::{next_fire_ms, now_ms};
use crate::callbacks::Collaborators;
use crate::error::{Error, Result};
use crate::events::{EventBus, SchedulerEvent};
use crate::model::{
    truncate_result, AgentTurnPayload, HttpMethod, JobRun, JobStatus, Payload, RunStatus,
    ScheduledJob, SessionTargetKind, SystemEventPayload, WebhookPayload,
};
use crate::store::SchedulerStore;

/// Maximum chained executions following one scheduled run.
const CHAIN_DEPTH_LIMIT: usize = 8;

/// Why a job is being executed; decides how the run is finalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunReason {
    /// Selected by the timer; consumes the schedule and may retry.
    Scheduled,
    /// `run_once` — history and counters only, the schedule is untouched.
    Manual,
    /// Triggered by another job's `on_complete` chain.
    Chained,
}

pub struct Executor {
    store: Arc<SchedulerStore>,
    collab: Collaborators,
    bus: EventBus,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        store: Arc<SchedulerStore>,
        collab: Collaborators,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            collab,
            bus,
            http: reqwest::Client::new(),
            cancel,
        }
    }

    /// Execute a job and any task chains it triggers. Returns the job's own
    /// run record.
    pub async fn execute(&self, job: &ScheduledJob, reason: RunReason) -> JobRun {
        let first = self.run_job(job, reason).await;

        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        enqueue_chains(job, &first, 1, &mut queue);

        while let Some((next_id, depth)) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                break;
            }
            if depth > CHAIN_DEPTH_LIMIT {
                tracing::warn!(job_id = %next_id, depth, "chain depth limit reached; dropping");
                continue;
            }
            let Some(next_job) = self.store.get(&next_id).await else {
                tracing::warn!(job_id = %next_id, "chain target does not exist");
                continue;
            };
            tracing::info!(job_id = %next_id, depth, "triggering chained job");
            let run = self.run_job(&next_job, RunReason::Chained).await;
            enqueue_chains(&next_job, &run, depth + 1, &mut queue);
        }

        first
    }

    /// One run: dispatch, record, finalize state, notify on failure.
    async fn run_job(&self, job: &ScheduledJob, reason: RunReason) -> JobRun {
        let started_at = now_ms();
        let mut run = JobRun::new(&job.id, started_at);
        self.bus.publish(SchedulerEvent::RunStarted {
            job_id: job.id.clone(),
            run_id: run.id.clone(),
        });

        // Shutdown interrupts the external call but not the bookkeeping: the
        // run is recorded as skipped and fires again after restart.
        let outcome = if self.cancel.is_cancelled() {
            None
        } else {
            tokio::select! {
                _ = self.cancel.cancelled() => None,
                outcome = self.dispatch(job) => Some(outcome),
            }
        };
        match outcome {
            None => {
                run.status = RunStatus::Skipped;
                run.error = Some("scheduler shutting down".into());
            }
            Some(Ok(result)) => {
                run.status = RunStatus::Ok;
                run.result = Some(truncate_result(&result));
            }
            Some(Err(Error::Timeout(secs))) => {
                run.status = RunStatus::Timeout;
                run.error = Some(format!("timed out after {secs}s"));
            }
            Some(Err(e)) => {
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
            }
        }
        run.finished_at_ms = now_ms();
        run.duration_ms = run.finished_at_ms - run.started_at_ms;

        self.store.save_run(&run);
        self.finalize(job, &run, reason).await;

        match run.status {
            RunStatus::Ok => {
                tracing::info!(job_id = %job.id, run_id = %run.id,
                    duration_ms = run.duration_ms, "run completed");
                self.report_to_main(job, &run).await;
            }
            RunStatus::Skipped => {}
            _ => {
                tracing::warn!(job_id = %job.id, run_id = %run.id,
                    error = run.error.as_deref().unwrap_or(""), "run failed");
                self.notify_failure(job, &run).await;
            }
        }

        self.bus.publish(SchedulerEvent::RunFinished {
            job_id: job.id.clone(),
            run_id: run.id.clone(),
            status: run.status,
        });
        run
    }

    // ── Dispatch ────────────────────────────────────────────────────

    async fn dispatch(&self, job: &ScheduledJob) -> Result<String> {
        match job.target.kind {
            SessionTargetKind::Main => self.inject_main(job).await,
            SessionTargetKind::Isolated => match &job.payload {
                Payload::SystemEvent(p) => self.send_system_event(p).await,
                Payload::AgentTurn(p) => self.run_agent_turn(job, p).await,
                Payload::Webhook(p) => self.call_webhook(job, p).await,
                Payload::TaskChain(_) => Err(Error::validation(
                    "payload",
                    "task_chain is only valid inside on_complete",
                )),
            },
        }
    }

    /// Inject a `scheduled_task` envelope into the user's main session. The
    /// agent itself is not run here; that is the session's business.
    async fn inject_main(&self, job: &ScheduledJob) -> Result<String> {
        let sink = self
            .collab
            .system_events
            .as_ref()
            .ok_or(Error::MissingCollaborator("on_system_event"))?;

        let envelope = serde_json::json!({
            "type": "scheduled_task",
            "job_id": job.id,
            "job_name": job.name,
            "payload": serde_json::to_value(&job.payload)?,
            "timestamp_ms": now_ms(),
        });
        sink.on_system_event(&job.user_id, envelope).await?;

        if job.target.trigger_heartbeat {
            if let Some(heartbeat) = &self.collab.heartbeat {
                if let Err(e) = heartbeat.run_heartbeat(&job.user_id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "heartbeat failed after injection");
                }
            }
        }
        Ok("Injected to main session".to_string())
    }

    async fn send_system_event(&self, payload: &SystemEventPayload) -> Result<String> {
        let notifier = self
            .collab
            .notifier
            .as_ref()
            .ok_or(Error::MissingCollaborator("notification_sender"))?;
        let message = format!("⏰ 提醒：{}", payload.message);
        notifier
            .send(&payload.channel, &payload.chat_id, &message)
            .await?;
        Ok(format!("notified {}:{}", payload.channel, payload.chat_id))
    }

    async fn run_agent_turn(&self, job: &ScheduledJob, payload: &AgentTurnPayload) -> Result<String> {
        let runner = self
            .collab
            .agent_runner
            .as_ref()
            .ok_or(Error::MissingCollaborator("agent_runner"))?;

        let mut context = serde_json::Map::new();
        context.insert("job_id".into(), job.id.clone().into());
        context.insert("scheduled".into(), true.into());
        context.insert("original_prompt".into(), job.description.clone().into());
        for (k, v) in &payload.context {
            context.insert(k.clone(), v.clone());
        }

        let secs = payload.timeout_seconds;
        let result = tokio::time::timeout(
            Duration::from_secs(secs),
            runner.run(&payload.prompt, serde_json::Value::Object(context)),
        )
        .await
        .map_err(|_| Error::Timeout(secs))??;

        if !payload.notify_chat_id.is_empty() {
            if let Some(notifier) = &self.collab.notifier {
                let message = format!(
                    "✅ 定时任务「{}」完成：\n{}",
                    job.name,
                    truncate_result(&result)
                );
                if let Err(e) = notifier
                    .send(&payload.notify_channel, &payload.notify_chat_id, &message)
                    .await
                {
                    tracing::warn!(job_id = %job.id, error = %e, "success notification failed");
                }
            }
        }
        Ok(result)
    }

    async fn call_webhook(&self, job: &ScheduledJob, payload: &WebhookPayload) -> Result<String> {
        let mut request = match payload.method {
            HttpMethod::Get => self.http.get(&payload.url),
            HttpMethod::Post => self.http.post(&payload.url),
            HttpMethod::Put => self.http.put(&payload.url),
        };
        request = request.timeout(Duration::from_secs(payload.timeout_seconds));
        for (k, v) in &payload.headers {
            request = request.header(k, v);
        }
        if payload.method != HttpMethod::Get {
            let mut body = serde_json::Map::new();
            body.insert("job_id".into(), job.id.clone().into());
            body.insert("name".into(), job.name.clone().into());
            body.insert("timestamp".into(), chrono::Utc::now().to_rfc3339().into());
            for (k, v) in &payload.body {
                body.insert(k.clone(), v.clone());
            }
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(payload.timeout_seconds)
            } else {
                Error::Http(e.to_string())
            }
        })?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(Error::Http(format!("webhook returned {status}")));
        }
        Ok(format!("HTTP {status}"))
    }

    // ── Finalization ────────────────────────────────────────────────

    /// Update the job's persisted state after a run. Retries re-arm from now
    /// with `retry_delay_ms`; a job past its retry budget turns `failed`;
    /// finished one-shots turn `completed`.
    async fn finalize(&self, job: &ScheduledJob, run: &JobRun, reason: RunReason) {
        if run.status == RunStatus::Skipped {
            // The payload never ran; the job stays armed as-is.
            return;
        }
        let consumes_schedule = reason == RunReason::Scheduled;
        self.store
            .update_state(&job.id, |job| {
                let now = now_ms();
                job.state.last_run_at_ms = Some(run.started_at_ms);
                job.state.last_status = Some(run.status);
                job.state.run_count += 1;
                job.updated_at_ms = now;

                match run.status {
                    RunStatus::Ok => {
                        job.state.consecutive_failures = 0;
                        job.state.last_error = None;
                        if consumes_schedule {
                            match next_fire_ms(&job.schedule, now, Some(run.started_at_ms)) {
                                Some(next) => job.state.next_run_at_ms = Some(next),
                                None => {
                                    job.state.next_run_at_ms = None;
                                    job.status = JobStatus::Completed;
                                }
                            }
                        }
                    }
                    RunStatus::Failed | RunStatus::Timeout => {
                        job.state.failure_count += 1;
                        job.state.consecutive_failures += 1;
                        job.state.last_error = run.error.clone();

                        if job.state.consecutive_failures > job.max_retries {
                            job.status = JobStatus::Failed;
                            job.state.next_run_at_ms = None;
                        } else if consumes_schedule {
                            if job.target.kind == SessionTargetKind::Isolated {
                                // Retry slot.
                                job.state.next_run_at_ms = Some(now + job.retry_delay_ms);
                            } else {
                                // Main injections follow the normal schedule.
                                match next_fire_ms(&job.schedule, now, Some(run.started_at_ms)) {
                                    Some(next) => job.state.next_run_at_ms = Some(next),
                                    None => {
                                        job.state.next_run_at_ms = None;
                                        job.status = JobStatus::Failed;
                                    }
                                }
                            }
                        }
                    }
                    RunStatus::Skipped => {}
                }
            })
            .await;
    }

    // ── Reporting ───────────────────────────────────────────────────

    async fn report_to_main(&self, job: &ScheduledJob, run: &JobRun) {
        if job.target.kind != SessionTargetKind::Isolated || !job.target.report_to_main {
            return;
        }
        let Some(reporter) = &self.collab.main_reporter else {
            return;
        };
        let result = run.result.as_deref().unwrap_or("");
        if let Err(e) = reporter.report_to_main(&job.user_id, &job.id, result).await {
            tracing::warn!(job_id = %job.id, error = %e, "report to main session failed");
        }
    }

    /// Best-effort failure notification to the job's notify target; its own
    /// failure is logged, never re-fails the run.
    async fn notify_failure(&self, job: &ScheduledJob, run: &JobRun) {
        let Some((channel, chat_id)) = notify_target(&job.payload) else {
            return;
        };
        let Some(notifier) = &self.collab.notifier else {
            return;
        };
        let excerpt = truncate_result(run.error.as_deref().unwrap_or("unknown error"));
        let message = format!("❌ 定时任务「{}」失败：{}", job.name, excerpt);
        if let Err(e) = notifier.send(channel, chat_id, &message).await {
            tracing::warn!(job_id = %job.id, error = %e, "failure notification failed");
        }
    }
}

/// Where failure notifications for this payload go, if anywhere.
fn notify_target(payload: &Payload) -> Option<(&str, &str)> {
    match payload {
        Payload::SystemEvent(p) => Some((&p.channel, &p.chat_id)),
        Payload::AgentTurn(p) if !p.notify_chat_id.is_empty() => {
            Some((&p.notify_channel, &p.notify_chat_id))
        }
        _ => None,
    }
}

/// Queue chain entries whose `on_status` matches the finished run.
fn enqueue_chains(
    job: &ScheduledJob,
    run: &JobRun,
    depth: usize,
    queue: &mut VecDeque<(String, usize)>,
) {
    if run.status == RunStatus::Skipped {
        return;
    }
    for entry in &job.on_complete {
        if entry.on_status.contains(&run.status) {
            queue.push_back((entry.next_job_id.clone(), depth));
        }
    }
}
