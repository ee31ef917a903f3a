//! End-to-end healing scenarios through the public API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use healer::dedup::{AlertDeduplicator, AlertKey, STATUS_CHANGE};
use healer::monitor::diff;
use healer::orchestrator::is_healing_candidate;
use healer::{
    classify_verdict, ChangeMonitor, Collaborators, HealLog, HealingOrchestrator,
    HealingSettings, HealthProbe, Outcome, ProbeReport, RemediationClient, RepairParams,
    ServerRecord, ServerStatus, StatusStore, StepState, Verdict,
};
use notify::{Alert, ChannelError, Notifier, NotifyChannel};
use tempfile::TempDir;

#[derive(Default)]
struct Inbox {
    subjects: Mutex<Vec<String>>,
}

#[async_trait]
impl NotifyChannel for Inbox {
    fn name(&self) -> &'static str {
        "inbox"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, alert: &Alert) -> Result<String, ChannelError> {
        self.subjects.lock().unwrap().push(alert.subject.clone());
        Ok("queued".to_string())
    }
}

struct ScriptedRemote {
    audio: Outcome,
    container: Outcome,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemediationClient for ScriptedRemote {
    async fn repair_audio(&self, address: &str) -> Outcome {
        self.calls.lock().unwrap().push(format!("restart-pulse {address}"));
        self.audio.clone()
    }

    async fn repair_container(&self, address: &str, _params: &RepairParams) -> Outcome {
        self.calls.lock().unwrap().push(format!("save {address}"));
        self.container.clone()
    }
}

struct ScriptedProbe {
    outputs: Mutex<VecDeque<&'static str>>,
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check_single(&self, _address: &str) -> ProbeReport {
        let output = self.outputs.lock().unwrap().pop_front().unwrap_or("");
        ProbeReport::from_output(output)
    }
}

struct Fleet {
    _dir: TempDir,
    store: Arc<StatusStore>,
    orchestrator: Arc<HealingOrchestrator>,
    inbox: Arc<Inbox>,
    calls: Arc<Mutex<Vec<String>>>,
}

async fn fleet(
    servers: Vec<ServerRecord>,
    audio: Outcome,
    container: Outcome,
    probe_outputs: &[&'static str],
) -> Fleet {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StatusStore::new(dir.path().join("status.json")));
    store.save(&servers).await.unwrap();

    let inbox = Arc::new(Inbox::default());
    let notifier = Arc::new(Notifier::with_channels(vec![
        inbox.clone() as Arc<dyn NotifyChannel>
    ]));
    let dedup = Arc::new(AlertDeduplicator::load(dir.path().join("alert_history.json")).await);
    let calls = Arc::new(Mutex::new(Vec::new()));

    let orchestrator = Arc::new(HealingOrchestrator::new(
        Collaborators {
            store: store.clone(),
            probe: Arc::new(ScriptedProbe {
                outputs: Mutex::new(probe_outputs.iter().copied().collect()),
            }),
            remediation: Arc::new(ScriptedRemote {
                audio,
                container,
                calls: calls.clone(),
            }),
            notifier: notifier.clone(),
            dedup: dedup.clone(),
            monitor: ChangeMonitor::new(notifier, dedup, Duration::from_secs(60)),
            heal_log: HealLog::new(dir.path().join("heal_logs")),
        },
        HealingSettings::default(),
    ));

    Fleet {
        _dir: dir,
        store,
        orchestrator,
        inbox,
        calls,
    }
}

#[tokio::test(start_paused = true)]
async fn failed_server_is_healed_on_first_attempt() {
    let servers = vec![ServerRecord::new("pa-store-1", "10.0.0.1", ServerStatus::Fail)];
    let f = fleet(
        servers.clone(),
        Outcome::ok("PulseAudio restarted"),
        Outcome::ok("Saved"),
        &["VERIFICATION: SUCCESS\n✅ OK"],
    )
    .await;

    f.orchestrator.run_auto_heal(&servers).await.unwrap();

    let record = f.store.get("10.0.0.1").await.unwrap().unwrap();
    assert_eq!(record.status, ServerStatus::Ok);
    assert_eq!(record.attempts.first.audio, StepState::Done);
    assert_eq!(record.attempts.first.container, StepState::Done);
    assert_eq!(
        *f.calls.lock().unwrap(),
        vec!["restart-pulse 10.0.0.1", "save 10.0.0.1"]
    );
    assert_eq!(
        *f.inbox.subjects.lock().unwrap(),
        vec!["Server Recovered: pa-store-1"]
    );

    let heal_log = std::fs::read_to_string(f._dir.path().join("heal_logs/10-0-0-1.log")).unwrap();
    assert!(heal_log.contains("FIRST-VERIFICATION: Server is now HEALTHY"));
}

#[tokio::test(start_paused = true)]
async fn audio_timeout_stops_the_sequence() {
    let servers = vec![ServerRecord::new("pa-store-1", "10.0.0.1", ServerStatus::Fail)];
    let f = fleet(
        servers.clone(),
        Outcome::failed("API call failed: timeout"),
        Outcome::ok("Saved"),
        &[],
    )
    .await;

    f.orchestrator.run_auto_heal(&servers).await.unwrap();

    let record = f.store.get("10.0.0.1").await.unwrap().unwrap();
    assert_eq!(record.status, ServerStatus::Fail);
    assert_eq!(record.attempts.first.audio, StepState::Failed);
    assert_eq!(record.attempts.first.container, StepState::NotAttempted);
    assert_eq!(*f.calls.lock().unwrap(), vec!["restart-pulse 10.0.0.1"]);

    let persisted = std::fs::read_to_string(f.store.path()).unwrap();
    assert!(persisted.contains("\"audio\": \"Failed\""));
    assert!(persisted.contains("\"container\": \"NotAttempted\""));
}

#[tokio::test(start_paused = true)]
async fn infrastructure_fault_is_never_healed() {
    let output = "10.0.0.1: IO Error - firewall blocked port 22";
    assert_eq!(classify_verdict(output), Verdict::NeedsManualIntervention);

    let servers = vec![ServerRecord::new("pa-store-1", "10.0.0.1", ServerStatus::Fail).with_log(output)];
    assert!(!is_healing_candidate(&servers[0]));

    let f = fleet(servers, Outcome::ok("ok"), Outcome::ok("ok"), &[]).await;
    let report = f.orchestrator.run_auto_heal(&[]).await.unwrap();

    assert!(report.healed.is_empty() && report.still_failing.is_empty());
    assert_eq!(report.skipped_io, vec!["10.0.0.1"]);
    assert!(f.calls.lock().unwrap().is_empty());
    assert_eq!(
        *f.inbox.subjects.lock().unwrap(),
        vec!["IO Error - Healing Skipped"]
    );
}

#[tokio::test(start_paused = true)]
async fn second_attempt_heals_what_the_first_missed() {
    let servers = vec![ServerRecord::new("pa-store-1", "10.0.0.1", ServerStatus::Error)];
    let f = fleet(
        servers.clone(),
        Outcome::ok("restarted"),
        Outcome::ok("saved"),
        &["❌ pulse not running", "✅ OK"],
    )
    .await;

    let first = f.orchestrator.run_auto_heal(&servers).await.unwrap();
    assert_eq!(first.still_failing, vec!["10.0.0.1"]);
    assert!(f.inbox.subjects.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(10 * 60 + 180)).await;

    let record = f.store.get("10.0.0.1").await.unwrap().unwrap();
    assert_eq!(record.status, ServerStatus::Ok);
    assert_eq!(record.attempts.first.audio, StepState::Failed);
    assert_eq!(record.attempts.second.audio, StepState::Done);
    assert_eq!(f.calls.lock().unwrap().len(), 4);
    assert_eq!(
        *f.inbox.subjects.lock().unwrap(),
        vec!["Server Recovered: pa-store-1"]
    );
}

#[tokio::test]
async fn status_flapping_inside_cooldown_alerts_once() {
    let dir = TempDir::new().unwrap();
    let dedup = AlertDeduplicator::load(dir.path().join("alert_history.json")).await;
    let key = AlertKey::new("10.0.0.1", STATUS_CHANGE).with_detail("fail");

    let ok = vec![ServerRecord::new("pa", "10.0.0.1", ServerStatus::Ok)];
    let failed = vec![ServerRecord::new("pa", "10.0.0.1", ServerStatus::Fail)];
    assert_eq!(diff(&ok, &failed).len(), 1);

    assert!(dedup.try_acquire(&key, Duration::from_secs(60)).await);
    assert!(!dedup.try_acquire(&key, Duration::from_secs(60)).await);
    assert!(dedup.should_send(&key, Duration::ZERO).await);

    let reloaded = AlertDeduplicator::load(dir.path().join("alert_history.json")).await;
    assert!(!reloaded.should_send(&key, Duration::from_secs(60)).await);
}
