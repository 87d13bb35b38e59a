//! End-to-end tests for the running scheduler service: a real timer loop,
//! real persistence, and mock collaborators. Timing assertions use generous
//! margins so they hold on slow CI machines.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use agentd_scheduler::{
    AgentRunner, AgentTurnPayload, Collaborators, JobCreate, JobPatch, JobStatus,
    NotificationSender, Payload, RunFilter, RunStatus, Schedule, SchedulerConfig,
    SchedulerService, SystemEventPayload, TaskChainPayload,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock collaborators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send(
        &self,
        channel: &str,
        chat_id: &str,
        message: &str,
    ) -> agentd_scheduler::Result<()> {
        self.sent
            .lock()
            .push((channel.into(), chat_id.into(), message.into()));
        Ok(())
    }
}

struct EchoAgent;

#[async_trait]
impl AgentRunner for EchoAgent {
    async fn run(
        &self,
        prompt: &str,
        _context: serde_json::Value,
    ) -> agentd_scheduler::Result<String> {
        Ok(format!("{prompt}!"))
    }
}

struct FailingAgent;

#[async_trait]
impl AgentRunner for FailingAgent {
    async fn run(
        &self,
        _prompt: &str,
        _context: serde_json::Value,
    ) -> agentd_scheduler::Result<String> {
        Err(agentd_scheduler::Error::Other("permanently broken".into()))
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn service(dir: &std::path::Path, collab: Collaborators) -> SchedulerService {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });

    let mut config = SchedulerConfig::new(dir);
    // Keep re-planning snappy for tests.
    config.max_tick = Duration::from_millis(200);
    SchedulerService::new(config, collab).unwrap()
}

fn reminder_spec(interval_ms: i64, message: &str) -> JobCreate {
    let mut spec = JobCreate::new(
        Schedule::Every { interval_ms },
        Payload::SystemEvent(SystemEventPayload {
            message: message.into(),
            channel: "telegram".into(),
            chat_id: "42".into(),
        }),
    );
    spec.name = "reminder".into();
    spec
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(flavor = "multi_thread")]
async fn interval_job_fires_repeatedly_with_reminder_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let svc = service(
        dir.path(),
        Collaborators::default().with_notifier(notifier.clone()),
    );
    svc.start();

    svc.create(reminder_spec(100, "喝水")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(650)).await;
    svc.shutdown().await;

    let sent = notifier.sent.lock();
    assert!(
        sent.len() >= 2,
        "expected at least 2 notifications, got {}",
        sent.len()
    );
    for (channel, chat_id, message) in sent.iter() {
        assert_eq!(channel, "telegram");
        assert_eq!(chat_id, "42");
        assert_eq!(message, "⏰ 提醒：喝水");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn at_in_past_completes_immediately_with_no_runs() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path(), Collaborators::default());
    svc.start();

    let mut spec = reminder_spec(0, "late");
    spec.schedule = Schedule::At {
        at_ms: now_ms() - 1_000,
    };
    let job = svc.create(spec).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.state.next_run_at_ms, None);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let (_, total) = svc
        .runs(&RunFilter {
            job_id: Some(job.id.clone()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(total, 0);
    svc.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn chain_triggers_follow_on_job_without_rearming_it() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let collab = Collaborators::default()
        .with_agent_runner(Arc::new(EchoAgent))
        .with_notifier(notifier.clone());
    let svc = service(dir.path(), collab);
    svc.start();

    // Job B: far-future one-shot.
    let far_future = now_ms() + 10_000_000;
    let mut b_spec = reminder_spec(0, "done");
    b_spec.id = Some("B".into());
    b_spec.schedule = Schedule::At { at_ms: far_future };
    let b = svc.create(b_spec).await.unwrap();
    assert_eq!(b.state.next_run_at_ms, Some(far_future));

    // Job A: fires shortly, chains to B on ok.
    let mut a_spec = JobCreate::new(
        Schedule::At {
            at_ms: now_ms() + 50,
        },
        Payload::AgentTurn(AgentTurnPayload {
            prompt: "x".into(),
            ..Default::default()
        }),
    );
    a_spec.id = Some("A".into());
    a_spec.on_complete = vec![TaskChainPayload {
        next_job_id: "B".into(),
        on_status: vec![RunStatus::Ok],
    }];
    svc.create(a_spec).await.unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    svc.shutdown().await;

    // A completed its one-shot; B ran exactly once via the chain.
    let a = svc.get("A").await.unwrap();
    assert_eq!(a.status, JobStatus::Completed);

    let (b_runs, b_total) = svc
        .runs(&RunFilter {
            job_id: Some("B".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(b_total, 1, "chain fired B exactly once");
    assert_eq!(b_runs[0].status, RunStatus::Ok);
    assert_eq!(notifier.sent.lock().last().unwrap().2, "⏰ 提醒：done");

    let b = svc.get("B").await.unwrap();
    assert_eq!(b.state.next_run_at_ms, Some(far_future), "B keeps its own arming");
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_job_retries_then_turns_failed() {
    let dir = tempfile::tempdir().unwrap();
    let collab = Collaborators::default().with_agent_runner(Arc::new(FailingAgent));
    let svc = service(dir.path(), collab);
    svc.start();

    let mut spec = JobCreate::new(
        Schedule::Every { interval_ms: 100 },
        Payload::AgentTurn(AgentTurnPayload {
            prompt: "x".into(),
            ..Default::default()
        }),
    );
    spec.id = Some("doomed".into());
    spec.max_retries = 1;
    spec.retry_delay_ms = 100;
    svc.create(spec).await.unwrap();

    // Wait until the retry budget is exhausted.
    let mut status = JobStatus::Active;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        status = svc.get("doomed").await.unwrap().status;
        if status == JobStatus::Failed {
            break;
        }
    }
    svc.shutdown().await;

    assert_eq!(status, JobStatus::Failed);
    let job = svc.get("doomed").await.unwrap();
    assert_eq!(job.state.consecutive_failures, 2);
    assert_eq!(job.state.next_run_at_ms, None);

    let (runs, total) = svc
        .runs(&RunFilter {
            job_id: Some("doomed".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(total, 2, "1 initial + 1 retry");
    assert!(runs.iter().all(|r| r.status == RunStatus::Failed));
}

#[tokio::test(flavor = "multi_thread")]
async fn run_once_executes_without_consuming_the_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let svc = service(
        dir.path(),
        Collaborators::default().with_notifier(notifier.clone()),
    );
    svc.start();

    let mut spec = reminder_spec(3_600_000, "hourly");
    spec.id = Some("hourly".into());
    let job = svc.create(spec).await.unwrap();
    let armed_next = job.state.next_run_at_ms;

    svc.run_once("hourly").await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    svc.shutdown().await;

    assert_eq!(notifier.sent.lock().len(), 1);
    let job = svc.get("hourly").await.unwrap();
    assert_eq!(job.state.run_count, 1);
    assert_eq!(job.state.next_run_at_ms, armed_next, "schedule untouched");

    let (_, total) = svc
        .runs(&RunFilter {
            job_id: Some("hourly".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(total, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn hot_reload_picks_up_hand_edited_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let svc = service(
        dir.path(),
        Collaborators::default().with_notifier(notifier.clone()),
    );
    svc.start();

    let mut spec = reminder_spec(100, "original");
    spec.id = Some("orig".into());
    svc.create(spec).await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;

    let runs_before = svc.get("orig").await.unwrap().state.run_count;
    assert!(runs_before >= 1);

    // Hand-append job Z to the config file, as a user would.
    let config_path = dir.path().join("scheduler.yaml");
    let mut text = std::fs::read_to_string(&config_path).unwrap();
    text.push_str(
        r#"- id: Z
  name: added by hand
  schedule:
    kind: every
    interval_ms: 100
  payload:
    kind: system_event
    message: from Z
    channel: telegram
    chat_id: '7'
"#,
    );
    std::fs::write(&config_path, text).unwrap();

    let count = svc.reload_config().await.unwrap();
    assert_eq!(count, 2);

    let z = svc.get("Z").await.unwrap();
    assert_eq!(z.status, JobStatus::Active);
    assert!(z.state.next_run_at_ms.is_some(), "Z is armed");

    // Existing job kept its counters.
    assert!(svc.get("orig").await.unwrap().state.run_count >= runs_before);

    tokio::time::sleep(Duration::from_millis(350)).await;
    svc.shutdown().await;

    let z_sent = notifier
        .sent
        .lock()
        .iter()
        .filter(|(_, chat, _)| chat == "7")
        .count();
    assert!(z_sent >= 1, "hand-added job is firing");
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_preserves_schedule_state() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());

    {
        let svc = service(
            dir.path(),
            Collaborators::default().with_notifier(notifier.clone()),
        );
        svc.start();
        let mut spec = reminder_spec(100, "persist me");
        spec.id = Some("p".into());
        svc.create(spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        svc.shutdown().await;
    }

    // Fresh process: the job is still there with its history.
    let svc = service(
        dir.path(),
        Collaborators::default().with_notifier(notifier.clone()),
    );
    let job = svc.get("p").await.unwrap();
    assert!(job.state.run_count >= 1, "run_count survived the restart");
    assert_eq!(job.status, JobStatus::Active);

    let (_, total) = svc
        .runs(&RunFilter {
            job_id: Some("p".into()),
            ..Default::default()
        })
        .unwrap();
    assert!(total >= 1, "run history survived the restart");
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_stops_firing_and_resume_rearms() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let svc = service(
        dir.path(),
        Collaborators::default().with_notifier(notifier.clone()),
    );
    svc.start();

    let mut spec = reminder_spec(100, "pausable");
    spec.id = Some("p".into());
    svc.create(spec).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    svc.pause("p").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent_while_paused = notifier.sent.lock().len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        notifier.sent.lock().len(),
        sent_while_paused,
        "no notifications while paused"
    );

    let resumed = svc.resume("p").await.unwrap();
    assert_eq!(resumed.status, JobStatus::Active);
    assert!(resumed.state.next_run_at_ms.is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    svc.shutdown().await;
    assert!(
        notifier.sent.lock().len() > sent_while_paused,
        "firing resumed"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_counts_and_next_fire() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path(), Collaborators::default());

    let status = svc.status().await;
    assert!(!status.running);
    assert_eq!(status.jobs_total, 0);

    svc.start();
    let mut spec = reminder_spec(60_000, "a");
    spec.id = Some("a".into());
    svc.create(spec).await.unwrap();
    let mut spec = reminder_spec(60_000, "b");
    spec.id = Some("b".into());
    svc.create(spec).await.unwrap();
    svc.pause("b").await.unwrap();

    let status = svc.status().await;
    assert!(status.running);
    assert_eq!(status.jobs_total, 2);
    assert_eq!(status.jobs_active, 1);
    assert_eq!(status.jobs_paused, 1);
    assert!(status.next_run_at_ms.is_some());

    svc.shutdown().await;
    assert!(!svc.status().await.running);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_removes_job_state_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let svc = service(
        dir.path(),
        Collaborators::default().with_notifier(notifier.clone()),
    );
    svc.start();

    let mut spec = reminder_spec(100, "to delete");
    spec.id = Some("d".into());
    svc.create(spec).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(svc.delete("d").await.unwrap());
    svc.shutdown().await;

    assert!(svc.get("d").await.is_none());
    let (runs, total) = svc
        .runs(&RunFilter {
            job_id: Some("d".into()),
            ..Default::default()
        })
        .unwrap();
    assert!(runs.is_empty());
    assert_eq!(total, 0);

    // And the config file no longer mentions it.
    let text = std::fs::read_to_string(dir.path().join("scheduler.yaml")).unwrap();
    assert!(!text.contains("to delete"));
}

#[tokio::test(flavor = "multi_thread")]
async fn patch_reschedules_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path(), Collaborators::default());
    svc.start();

    let mut spec = reminder_spec(3_600_000, "slow");
    spec.id = Some("p".into());
    let job = svc.create(spec).await.unwrap();
    let old_next = job.state.next_run_at_ms.unwrap();

    let patched = svc
        .patch(
            "p",
            JobPatch {
                name: Some("renamed".into()),
                schedule: Some(Schedule::Every { interval_ms: 1_000 }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(patched.state.next_run_at_ms.unwrap() < old_next);
    assert_eq!(patched.name, "renamed");

    svc.shutdown().await;
    let text = std::fs::read_to_string(dir.path().join("scheduler.yaml")).unwrap();
    assert!(text.contains("renamed"));
    assert!(text.contains("interval_ms: 1000"));
}
