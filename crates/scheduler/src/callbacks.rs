//! Collaborator seams — everything the engine calls but does not implement.
//!
//! All collaborators are optional at construction. A job whose payload needs
//! a missing collaborator fails at run time with a "collaborator not
//! configured" error, never at startup.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Runs an agent turn out-of-band and returns its textual result.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, prompt: &str, context: serde_json::Value) -> Result<String>;
}

/// Fans a message out to a chat channel.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, channel: &str, chat_id: &str, message: &str) -> Result<()>;
}

/// Injects a system-event envelope into the user's live main session.
#[async_trait]
pub trait SystemEventSink: Send + Sync {
    async fn on_system_event(&self, user_id: &str, envelope: serde_json::Value) -> Result<()>;
}

/// Wakes the main session's agent after an injection.
#[async_trait]
pub trait HeartbeatRunner: Send + Sync {
    async fn run_heartbeat(&self, user_id: &str) -> Result<()>;
}

/// Forwards an isolated run's result back to the main session.
#[async_trait]
pub trait MainReporter: Send + Sync {
    async fn report_to_main(&self, user_id: &str, job_id: &str, result: &str) -> Result<()>;
}

/// The collaborator set injected at construction.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub agent_runner: Option<Arc<dyn AgentRunner>>,
    pub notifier: Option<Arc<dyn NotificationSender>>,
    pub system_events: Option<Arc<dyn SystemEventSink>>,
    pub heartbeat: Option<Arc<dyn HeartbeatRunner>>,
    pub main_reporter: Option<Arc<dyn MainReporter>>,
}

impl Collaborators {
    pub fn with_agent_runner(mut self, runner: Arc<dyn AgentRunner>) -> Self {
        self.agent_runner = Some(runner);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSender>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_system_events(mut self, sink: Arc<dyn SystemEventSink>) -> Self {
        self.system_events = Some(sink);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn HeartbeatRunner>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_main_reporter(mut self, reporter: Arc<dyn MainReporter>) -> Self {
        self.main_reporter = Some(reporter);
        self
    }
}
