//! Job data model — schedules, payloads, runtime state, and request structs.
//!
//! `Schedule` and `Payload` are internally tagged on a `kind` field; the tag
//! is the wire discriminator in both the YAML config file and API JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calc::now_ms;

/// Epoch timestamp in milliseconds.
pub type TimestampMs = i64;

pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";
pub const DEFAULT_AGENT_ID: &str = "main";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: i64 = 60_000;

/// Stored run results are truncated to this many characters.
pub const MAX_RESULT_CHARS: usize = 500;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle status of a job. Only `active` jobs are ever selected by the
/// timer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Outcome of a single run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Failed,
    Skipped,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

/// When a job fires.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// One-shot absolute instant.
    At { at_ms: TimestampMs },
    /// Fixed spacing measured from the last run.
    Every { interval_ms: i64 },
    /// 5-field cron expression (minute hour dom month dow), evaluated in
    /// `timezone`.
    Cron {
        expression: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session target
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which session context a run lands in.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionTargetKind {
    /// Inject a system-event envelope into the user's live session.
    Main,
    /// Run the payload out-of-band in a fresh context.
    #[default]
    Isolated,
}

fn default_true() -> bool {
    true
}

/// Session target plus delivery flags.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTarget {
    #[serde(default)]
    pub kind: SessionTargetKind,
    /// Wake the main session's agent after injecting (main targets only).
    #[serde(default = "default_true")]
    pub trigger_heartbeat: bool,
    /// Forward the run result to the main session (isolated targets only).
    #[serde(default = "default_true")]
    pub report_to_main: bool,
}

impl Default for SessionTarget {
    fn default() -> Self {
        Self {
            kind: SessionTargetKind::Isolated,
            trigger_heartbeat: true,
            report_to_main: true,
        }
    }
}

impl SessionTarget {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Fire-and-forget notification through the `NotificationSender`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemEventPayload {
    pub message: String,
    pub channel: String,
    pub chat_id: String,
}

fn default_agent_timeout() -> u64 {
    300
}

/// Run the agent with a prompt, optionally notifying a chat on completion.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentTurnPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub context: JsonMap,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notify_channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notify_chat_id: String,
    #[serde(default = "default_agent_timeout")]
    pub timeout_seconds: u64,
}

impl Default for AgentTurnPayload {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            agent_id: String::new(),
            context: JsonMap::new(),
            notify_channel: String::new(),
            notify_chat_id: String::new(),
            timeout_seconds: default_agent_timeout(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
}

fn default_webhook_timeout() -> u64 {
    30
}

/// Outbound HTTP request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub body: JsonMap,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
}

fn default_on_status() -> Vec<RunStatus> {
    vec![RunStatus::Ok]
}

/// Follow-on trigger, used only inside `on_complete`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskChainPayload {
    pub next_job_id: String,
    /// Run statuses of the finished run that fire the chain.
    #[serde(default = "default_on_status")]
    pub on_status: Vec<RunStatus>,
}

/// What a job does when it fires.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    SystemEvent(SystemEventPayload),
    AgentTurn(AgentTurnPayload),
    Webhook(WebhookPayload),
    TaskChain(TaskChainPayload),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SystemEvent(_) => "system_event",
            Self::AgentTurn(_) => "agent_turn",
            Self::Webhook(_) => "webhook",
            Self::TaskChain(_) => "task_chain",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutable state owned by the scheduler, persisted to the state DB only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct JobState {
    pub next_run_at_ms: Option<TimestampMs>,
    pub last_run_at_ms: Option<TimestampMs>,
    pub last_status: Option<RunStatus>,
    pub run_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScheduledJob
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_agent_id() -> String {
    DEFAULT_AGENT_ID.to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> i64 {
    DEFAULT_RETRY_DELAY_MS
}

/// The unit of scheduling. Definition fields live in the config file;
/// `state`, `status`, and the timestamps live in the state DB.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: Schedule,
    pub payload: Payload,
    #[serde(default)]
    pub target: SessionTarget,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: i64,
    #[serde(default)]
    pub on_complete: Vec<TaskChainPayload>,
    #[serde(default)]
    pub state: JobState,
    pub status: JobStatus,
    pub created_at_ms: TimestampMs,
    pub updated_at_ms: TimestampMs,
    /// Unknown config-file keys, preserved across rewrites. Not part of the
    /// API surface.
    #[serde(skip)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ScheduledJob {
    /// True when the timer may select this job.
    pub fn is_armed(&self) -> bool {
        self.enabled && self.status == JobStatus::Active && self.state.next_run_at_ms.is_some()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append-only record of one run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobRun {
    pub id: String,
    pub job_id: String,
    pub started_at_ms: TimestampMs,
    pub finished_at_ms: TimestampMs,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl JobRun {
    pub fn new(job_id: &str, started_at_ms: TimestampMs) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            started_at_ms,
            finished_at_ms: started_at_ms,
            status: RunStatus::Skipped,
            result: None,
            error: None,
            duration_ms: 0,
        }
    }
}

/// Truncate a result string to [`MAX_RESULT_CHARS`] on a char boundary.
pub fn truncate_result(s: &str) -> String {
    if s.chars().count() <= MAX_RESULT_CHARS {
        s.to_string()
    } else {
        s.chars().take(MAX_RESULT_CHARS).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests, filters, stats
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Request to create a new job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobCreate {
    /// Assigned by the registry when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schedule: Schedule,
    pub payload: Payload,
    #[serde(default)]
    pub target: SessionTarget,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: i64,
    #[serde(default)]
    pub on_complete: Vec<TaskChainPayload>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl JobCreate {
    pub fn new(schedule: Schedule, payload: Payload) -> Self {
        Self {
            id: None,
            user_id: String::new(),
            agent_id: default_agent_id(),
            name: String::new(),
            description: String::new(),
            schedule,
            payload,
            target: SessionTarget::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            on_complete: Vec::new(),
            enabled: true,
        }
    }
}

/// Partial update; only provided fields are applied.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schedule: Option<Schedule>,
    pub payload: Option<Payload>,
    pub target: Option<SessionTarget>,
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<i64>,
    pub on_complete: Option<Vec<TaskChainPayload>>,
}

impl JobPatch {
    /// Apply the provided fields to `job` and bump `updated_at_ms`.
    /// Returns true when the schedule changed.
    pub fn apply(&self, job: &mut ScheduledJob) -> bool {
        let mut schedule_changed = false;
        if let Some(name) = &self.name {
            job.name = name.clone();
        }
        if let Some(description) = &self.description {
            job.description = description.clone();
        }
        if let Some(schedule) = &self.schedule {
            schedule_changed = *schedule != job.schedule;
            job.schedule = schedule.clone();
        }
        if let Some(payload) = &self.payload {
            job.payload = payload.clone();
        }
        if let Some(target) = self.target {
            job.target = target;
        }
        if let Some(enabled) = self.enabled {
            job.enabled = enabled;
        }
        if let Some(max_retries) = self.max_retries {
            job.max_retries = max_retries;
        }
        if let Some(retry_delay_ms) = self.retry_delay_ms {
            job.retry_delay_ms = retry_delay_ms;
        }
        if let Some(on_complete) = &self.on_complete {
            job.on_complete = on_complete.clone();
        }
        job.updated_at_ms = now_ms();
        schedule_changed
    }
}

/// Filter for job listings.
#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    pub user_id: Option<String>,
    pub status: Option<JobStatus>,
    pub include_disabled: bool,
}

/// Filter for run history queries.
#[derive(Clone, Debug)]
pub struct RunFilter {
    pub job_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            job_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Aggregate run statistics for one job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct JobStats {
    pub job_id: String,
    pub total_runs: u64,
    pub ok_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub timeout_count: u64,
    pub avg_duration_ms: Option<i64>,
    pub last_run_at_ms: Option<TimestampMs>,
}

/// Engine status snapshot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs_total: usize,
    pub jobs_active: usize,
    pub jobs_paused: usize,
    pub next_run_at_ms: Option<TimestampMs>,
}
