//! Persistent single-node scheduled-job engine for agent daemons.
//!
//! Jobs are declared once (one-shot, fixed-interval, or cron), survive
//! process restarts, and execute through pluggable collaborators: an agent
//! runner, a notification sender, and main-session hooks. Definitions live
//! in a human-editable YAML file; runtime state and run history live in an
//! embedded SQLite database.

pub mod calc;
pub mod callbacks;
pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod humanize;
pub mod model;
pub mod registry;
pub mod runner;
pub mod service;
pub mod store;
pub mod validation;

pub use callbacks::{
    AgentRunner, Collaborators, HeartbeatRunner, MainReporter, NotificationSender,
    SystemEventSink,
};
pub use error::{Error, Result};
pub use events::SchedulerEvent;
pub use model::{
    AgentTurnPayload, HttpMethod, JobCreate, JobFilter, JobPatch, JobRun, JobState, JobStats,
    JobStatus, Payload, RunFilter, RunStatus, Schedule, ScheduledJob, SchedulerStatus,
    SessionTarget, SessionTargetKind, SystemEventPayload, TaskChainPayload, WebhookPayload,
};
pub use service::{SchedulerConfig, SchedulerService};
