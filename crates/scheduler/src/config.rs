//! The human-editable job config file (`scheduler.yaml`).
//!
//! Holds job *definitions* only; runtime state lives in the state DB. The
//! file is read on startup / reload and rewritten atomically (temp file +
//! rename) on Create/Patch/Delete — never on per-run state changes. Unknown
//! per-job keys survive a read→write round-trip.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    JobState, JobStatus, Payload, Schedule, ScheduledJob, SessionTarget, TaskChainPayload,
    DEFAULT_AGENT_ID, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS,
};

pub const CONFIG_FILE_NAME: &str = "scheduler.yaml";

const BANNER: &str = "\
# Scheduled jobs. This file is yours to edit: add, change, or remove jobs
# and reload the scheduler (or restart it) to apply. Runtime state such as
# run counts lives in scheduler_state.db and is managed by the program.
";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// On-disk job shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_true() -> bool {
    true
}

fn default_agent_id() -> String {
    DEFAULT_AGENT_ID.to_string()
}

fn is_main_agent(agent_id: &str) -> bool {
    agent_id == DEFAULT_AGENT_ID
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn is_default_max_retries(v: &u32) -> bool {
    *v == DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> i64 {
    DEFAULT_RETRY_DELAY_MS
}

fn is_default_retry_delay(v: &i64) -> bool {
    *v == DEFAULT_RETRY_DELAY_MS
}

/// One job as written in the config file. Default-valued fields are omitted
/// on write; unknown keys are kept in `extra`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default = "default_agent_id", skip_serializing_if = "is_main_agent")]
    pub agent_id: String,
    pub schedule: Schedule,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "SessionTarget::is_default")]
    pub target: SessionTarget,
    #[serde(
        default = "default_max_retries",
        skip_serializing_if = "is_default_max_retries"
    )]
    pub max_retries: u32,
    #[serde(
        default = "default_retry_delay_ms",
        skip_serializing_if = "is_default_retry_delay"
    )]
    pub retry_delay_ms: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<TaskChainPayload>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl JobEntry {
    /// Extract the definition part of a runtime job.
    pub fn from_job(job: &ScheduledJob) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            description: job.description.clone(),
            enabled: job.enabled,
            user_id: job.user_id.clone(),
            agent_id: job.agent_id.clone(),
            schedule: job.schedule.clone(),
            payload: job.payload.clone(),
            target: job.target,
            max_retries: job.max_retries,
            retry_delay_ms: job.retry_delay_ms,
            on_complete: job.on_complete.clone(),
            extra: job.extra.clone(),
        }
    }

    /// Build a runtime job from this definition plus persisted state.
    pub fn into_job(
        self,
        state: JobState,
        status: JobStatus,
        created_at_ms: i64,
        updated_at_ms: i64,
    ) -> ScheduledJob {
        ScheduledJob {
            id: self.id,
            user_id: self.user_id,
            agent_id: self.agent_id,
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            schedule: self.schedule,
            payload: self.payload,
            target: self.target,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            on_complete: self.on_complete,
            state,
            status,
            created_at_ms,
            updated_at_ms,
            extra: self.extra,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct ConfigDoc {
    #[serde(default)]
    jobs: Vec<JobEntry>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ConfigFile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reader/writer for the config file. The writer is unique (only the job
/// registry rewrites the file); readers may race with a rewrite and still
/// see either the old or the new complete file thanks to the rename.
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(CONFIG_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all job entries. A missing file is an empty job set; a parse
    /// failure is an error so the caller can poison writes instead of
    /// clobbering the user's file.
    pub fn load(&self) -> Result<Vec<JobEntry>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: ConfigDoc = serde_yaml::from_str(&text)?;
        Ok(doc.jobs)
    }

    /// Atomically rewrite the file: write to a temp file in the same
    /// directory, then rename over the target.
    pub fn save(&self, entries: &[JobEntry]) -> Result<()> {
        let doc = ConfigDoc {
            jobs: entries.to_vec(),
        };
        let yaml = serde_yaml::to_string(&doc)?;

        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(BANNER.as_bytes())?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| crate::error::Error::Io(e.error))?;
        Ok(())
    }
}
