//! Multi-attempt healing of failed servers.
//!
//! A healing cycle picks every server whose status is `fail`/`error` and whose
//! diagnostics do not carry an infrastructure fault, then runs the per-server
//! sequence for each of them strictly one after another:
//!
//! ```text
//! repair_audio ──fail──▶ audio=Failed (stop)
//!      │ ok
//!   settle
//!      │
//! repair_container ──fail──▶ container=Failed (stop)
//!      │ ok
//!   settle
//!      │
//! check_single ──▶ Healthy: status=ok, both Done
//!              └─▶ otherwise: both Failed, status unchanged
//! ```
//!
//! The record is persisted after every step that can fail and after the
//! verification. Only one cycle runs at a time. The first attempt schedules a
//! single second attempt; starting a new first attempt replaces any second
//! attempt that has not fired yet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use notify::{Alert, Notifier};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dedup::{AlertDeduplicator, AlertKey, IO_ERROR_SKIP_HEALING};
use crate::error::{HealerError, Result};
use crate::heal_log::HealLog;
use crate::monitor::{diff, ChangeMonitor};
use crate::phase::{HealPhase, PhaseEvent};
use crate::probe::{has_io_fault, HealthProbe};
use crate::remediation::{RemediationClient, RepairParams};
use crate::scanner::FleetScanner;
use crate::store::{merge_scan, StatusStore};
use crate::types::{
    AttemptStage, FleetSnapshot, HealingKind, ServerRecord, ServerStatus, StepState, Verdict,
};

/// Timing and policy knobs for healing.
#[derive(Debug, Clone)]
pub struct HealingSettings {
    /// Wait after each successful repair step
    pub settle: Duration,
    /// Delay between the start of the first attempt and the second attempt
    pub second_attempt_delay: Duration,
    /// Extra wait before the final probe of a manual heal
    pub manual_verify_wait: Duration,
    /// Cooldown for "healing skipped" alerts
    pub io_error_cooldown: Duration,
    /// When false, scans still alert but never start a healing cycle
    pub auto_heal: bool,
    /// Tuning parameters sent with the container restart
    pub params: RepairParams,
}

impl Default for HealingSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(60),
            second_attempt_delay: Duration::from_secs(10 * 60),
            manual_verify_wait: Duration::from_secs(60),
            io_error_cooldown: Duration::from_secs(60 * 60),
            auto_heal: true,
            params: RepairParams::default(),
        }
    }
}

/// Everything the orchestrator talks to.
pub struct Collaborators {
    pub store: Arc<StatusStore>,
    pub probe: Arc<dyn HealthProbe>,
    pub remediation: Arc<dyn RemediationClient>,
    pub notifier: Arc<Notifier>,
    pub dedup: Arc<AlertDeduplicator>,
    pub monitor: ChangeMonitor,
    pub heal_log: HealLog,
}

/// Summary of one healing cycle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub stage: Option<AttemptStage>,
    pub healed: Vec<String>,
    pub still_failing: Vec<String>,
    /// Servers left alone because they need manual intervention
    pub skipped_io: Vec<String>,
    pub persist_failures: usize,
    pub alerts_sent: usize,
}

/// Result of an operator-requested heal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualHealReport {
    pub address: String,
    pub phase: HealPhase,
    pub status: ServerStatus,
    pub healthy: bool,
    pub message: String,
    pub verification: String,
    /// Checkpoints that could not be written to the status store
    pub persist_failures: usize,
}

/// Result of a fleet refresh.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub servers: usize,
    pub transitions: usize,
    pub alerts_sent: usize,
    /// Fleet as it was before the scan
    #[serde(skip)]
    pub previous: FleetSnapshot,
}

struct PendingAttempt {
    handle: JoinHandle<()>,
    /// Set by whichever side gets there first: the timer firing or a cancel
    claimed: Arc<AtomicBool>,
}

/// Whether a record carries an infrastructure fault and must not be healed.
#[must_use]
pub fn needs_manual_intervention(record: &ServerRecord) -> bool {
    record.status == ServerStatus::FailIoError
        || has_io_fault(&record.log)
}

/// Whether a record is eligible for an automated healing stage.
#[must_use]
pub fn is_healing_candidate(record: &ServerRecord) -> bool {
    record.status.is_failing() && !needs_manual_intervention(record)
}

fn advance(phase: HealPhase, event: PhaseEvent) -> HealPhase {
    phase.advance(event).unwrap_or_else(|| {
        warn!(%phase, ?event, "Ignoring invalid heal phase transition");
        phase
    })
}

const fn outcome_word(success: bool) -> &'static str {
    if success {
        "SUCCESS"
    } else {
        "FAILED"
    }
}

/// Drives first, second and manual healing attempts.
pub struct HealingOrchestrator {
    store: Arc<StatusStore>,
    probe: Arc<dyn HealthProbe>,
    remediation: Arc<dyn RemediationClient>,
    notifier: Arc<Notifier>,
    dedup: Arc<AlertDeduplicator>,
    monitor: ChangeMonitor,
    heal_log: HealLog,
    settings: HealingSettings,
    cycle_lock: Mutex<()>,
    second_attempt: StdMutex<Option<PendingAttempt>>,
}

impl HealingOrchestrator {
    #[must_use]
    pub fn new(collaborators: Collaborators, settings: HealingSettings) -> Self {
        let Collaborators {
            store,
            probe,
            remediation,
            notifier,
            dedup,
            monitor,
            heal_log,
        } = collaborators;

        Self {
            store,
            probe,
            remediation,
            notifier,
            dedup,
            monitor,
            heal_log,
            settings,
            cycle_lock: Mutex::new(()),
            second_attempt: StdMutex::new(None),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    #[must_use]
    pub fn probe(&self) -> &Arc<dyn HealthProbe> {
        &self.probe
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    #[must_use]
    pub fn dedup(&self) -> &Arc<AlertDeduplicator> {
        &self.dedup
    }

    #[must_use]
    pub fn settings(&self) -> &HealingSettings {
        &self.settings
    }

    /// Run a fleet scan, merge it into the store and alert on transitions.
    ///
    /// Holds the cycle lock for the whole scan, so no healing checkpoint can
    /// land between the pre-scan read and the merge.
    pub async fn refresh(&self, scanner: &dyn FleetScanner) -> Result<RefreshOutcome> {
        let _cycle = self.cycle_lock.lock().await;
        let previous = match self.store.load().await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(error = %e, "Failed to read previous status, diffing against an empty fleet");
                Vec::new()
            }
        };

        scanner.scan().await?;

        let current = self
            .store
            .update(|servers| {
                let scanned = std::mem::take(servers);
                *servers = merge_scan(&previous, scanned);
            })
            .await?;

        let transitions = diff(&previous, &current).len();
        let alerts_sent = self.monitor.dispatch(&previous, &current).await;
        info!(
            servers = current.len(),
            transitions, alerts_sent, "Fleet refreshed"
        );

        Ok(RefreshOutcome {
            servers: current.len(),
            transitions,
            alerts_sent,
            previous,
        })
    }

    /// Refresh the fleet, then start automated healing in the background.
    pub async fn refresh_and_heal(
        self: &Arc<Self>,
        scanner: &dyn FleetScanner,
    ) -> Result<RefreshOutcome> {
        let outcome = self.refresh(scanner).await?;

        let this = Arc::clone(self);
        let previous = outcome.previous.clone();
        tokio::spawn(async move {
            match this.run_auto_heal(&previous).await {
                Ok(report) => info!(
                    healed = report.healed.len(),
                    still_failing = report.still_failing.len(),
                    skipped_io = report.skipped_io.len(),
                    "First healing attempt finished"
                ),
                Err(e) => error!(error = %e, "Automated healing failed"),
            }
        });

        Ok(outcome)
    }

    /// Start the first automated attempt and schedule the second.
    ///
    /// `previous` is the fleet as it was before the scan that triggered this
    /// cycle; it decides whether an infrastructure fault is newly reported.
    pub async fn run_auto_heal(self: &Arc<Self>, previous: &[ServerRecord]) -> Result<CycleReport> {
        if !self.settings.auto_heal {
            info!("Auto-healing disabled");
            return Ok(CycleReport::default());
        }

        let fleet = self.store.load().await?;
        let skipped_io = self.alert_io_faults(previous, &fleet).await;

        let candidates: Vec<String> = fleet
            .iter()
            .filter(|s| is_healing_candidate(s))
            .map(|s| s.address.clone())
            .collect();
        info!(
            candidates = candidates.len(),
            skipped_io = skipped_io.len(),
            "Starting first healing attempt"
        );

        self.schedule_second_attempt();

        let mut report = self.perform_cycle(&candidates, AttemptStage::First).await;
        report.skipped_io = skipped_io;
        Ok(report)
    }

    /// Re-read the store and heal whatever is still failing.
    pub async fn run_second_attempt(&self) -> CycleReport {
        info!("Starting second healing attempt");

        let fleet = match self.store.load().await {
            Ok(servers) => servers,
            Err(e) => {
                error!(error = %e, "Failed to read status for second attempt");
                return CycleReport::default();
            }
        };

        let candidates: Vec<String> = fleet
            .iter()
            .filter(|s| is_healing_candidate(s))
            .map(|s| s.address.clone())
            .collect();

        if candidates.is_empty() {
            info!("No failed servers left for the second attempt");
            return CycleReport {
                stage: Some(AttemptStage::Second),
                ..CycleReport::default()
            };
        }

        let report = self.perform_cycle(&candidates, AttemptStage::Second).await;
        info!(
            healed = report.healed.len(),
            still_failing = report.still_failing.len(),
            "Second healing attempt finished"
        );
        report
    }

    /// Heal one server on demand.
    ///
    /// Runs the same sequence as the automated stages, waits once more, probes
    /// again and always resolves the status to `ok` or `fail`.
    pub async fn heal_manual(&self, address: &str) -> Result<ManualHealReport> {
        let _cycle = self.cycle_lock.lock().await;

        let before = self.store.load().await?;
        let mut record = before
            .iter()
            .find(|s| s.address == address)
            .cloned()
            .ok_or_else(|| HealerError::UnknownServer(address.to_string()))?;

        info!(address = %address, name = %record.name, "Manual healing requested");
        let mut persist_failures = 0;
        let phase = self
            .heal_server(&mut record, AttemptStage::Manual, &mut persist_failures)
            .await;

        debug!(
            address = %address,
            wait_secs = self.settings.manual_verify_wait.as_secs(),
            "Waiting before final verification"
        );
        tokio::time::sleep(self.settings.manual_verify_wait).await;

        let verification = self.probe.check_single(address).await;
        let healthy = verification.verdict == Verdict::Healthy;
        let now = Utc::now();

        let step = record.stage_mut(AttemptStage::Manual);
        for state in [&mut step.audio, &mut step.container] {
            *state = match *state {
                StepState::NotAttempted => StepState::NotAttempted,
                _ if healthy => StepState::Done,
                StepState::InProgress => StepState::Failed,
                other => other,
            };
        }

        record.status = if healthy {
            ServerStatus::Ok
        } else {
            ServerStatus::Fail
        };
        record.last_heal_time = Some(now);
        let message = if healthy {
            record.log = format!(
                "Manual healing completed successfully at {}. Verification: Server is healthy.",
                now.to_rfc3339()
            );
            "Manual healing completed successfully - server is now healthy"
        } else {
            record.log = format!(
                "Manual healing completed at {} but server verification failed.",
                now.to_rfc3339()
            );
            "Manual healing completed but server still has issues"
        };

        self.heal_log
            .append(address, &format!("MANUAL-RESULT: {message}"))
            .await;
        self.checkpoint(&record, &mut persist_failures).await;
        self.dispatch_changes(&before).await;

        if persist_failures > 0 {
            warn!(address = %address, persist_failures, "Manual heal result not fully persisted");
        }
        info!(address = %address, status = %record.status, %phase, "Manual healing completed");
        Ok(ManualHealReport {
            address: address.to_string(),
            phase,
            status: record.status,
            healthy,
            message: message.to_string(),
            verification: verification.summary,
            persist_failures,
        })
    }

    /// Whether a second attempt is scheduled and has not fired yet.
    #[must_use]
    pub fn has_pending_second_attempt(&self) -> bool {
        self.second_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|p| !p.claimed.load(Ordering::SeqCst))
    }

    /// Wait for the scheduled second attempt, if any, to finish.
    pub async fn wait_for_second_attempt(&self) {
        let pending = self
            .second_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(pending) = pending {
            if let Err(e) = pending.handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Second healing attempt panicked");
                }
            }
        }
    }

    fn schedule_second_attempt(self: &Arc<Self>) {
        let delay = self.settings.second_attempt_delay;
        let claimed = Arc::new(AtomicBool::new(false));

        let handle = {
            let this = Arc::clone(self);
            let claimed = Arc::clone(&claimed);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if claimed.swap(true, Ordering::SeqCst) {
                    return;
                }
                this.run_second_attempt().await;
            })
        };

        let replaced = self
            .second_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(PendingAttempt { handle, claimed });

        if let Some(previous) = replaced {
            if !previous.claimed.swap(true, Ordering::SeqCst) {
                previous.handle.abort();
                info!("Cancelled pending second healing attempt");
            }
        }
        info!(
            delay_secs = delay.as_secs(),
            "Scheduled second healing attempt"
        );
    }

    async fn alert_io_faults(&self, previous: &[ServerRecord], fleet: &[ServerRecord]) -> Vec<String> {
        let mut skipped = Vec::new();

        for server in fleet.iter().filter(|s| needs_manual_intervention(s)) {
            skipped.push(server.address.clone());

            let newly_reported = previous
                .iter()
                .find(|old| old.address == server.address)
                .map_or(true, |old| {
                    !needs_manual_intervention(old) || old.status != server.status
                });
            if !newly_reported {
                debug!(address = %server.address, "Infrastructure fault already reported");
                continue;
            }

            let key = AlertKey::new(&server.address, IO_ERROR_SKIP_HEALING);
            if !self
                .dedup
                .try_acquire(&key, self.settings.io_error_cooldown)
                .await
            {
                continue;
            }

            warn!(
                address = %server.address,
                status = %server.status,
                "Skipping healing, manual intervention required"
            );
            let alert = Alert::new(
                "IO Error - Healing Skipped",
                format!(
                    "Server with IO/Firewall issue detected - auto-healing skipped:\n\n\
                     Server: {} ({})\n\
                     Status: {}\n\
                     Issue: IO Error detected in logs\n\
                     ACTION REQUIRED: Manual intervention needed to resolve firewall/connectivity issue.",
                    server.name, server.address, server.status
                ),
            )
            .with_server(server.context());
            self.notifier.notify(alert).await;
        }

        skipped
    }

    async fn perform_cycle(&self, addresses: &[String], stage: AttemptStage) -> CycleReport {
        let _cycle = self.cycle_lock.lock().await;
        let mut report = CycleReport {
            stage: Some(stage),
            ..CycleReport::default()
        };

        let before = match self.store.load().await {
            Ok(servers) => servers,
            Err(e) => {
                error!(error = %e, %stage, "Failed to read status, skipping healing cycle");
                return report;
            }
        };

        for address in addresses {
            let Some(mut record) = before.iter().find(|s| &s.address == address).cloned() else {
                warn!(address = %address, "Server not found in status");
                continue;
            };
            if !is_healing_candidate(&record) {
                debug!(address = %address, status = %record.status, "No longer eligible for healing");
                continue;
            }

            let phase = self
                .heal_server(&mut record, stage, &mut report.persist_failures)
                .await;
            if phase.is_healed() {
                report.healed.push(address.clone());
            } else {
                report.still_failing.push(address.clone());
            }
        }

        report.alerts_sent = self.dispatch_changes(&before).await;
        report
    }

    /// Run the per-server sequence for one stage. Never cancelled midway.
    async fn heal_server(
        &self,
        record: &mut ServerRecord,
        stage: AttemptStage,
        persist_failures: &mut usize,
    ) -> HealPhase {
        let address = record.address.clone();
        let label = stage.label();
        info!(address = %address, name = %record.name, %stage, "Healing server");

        let mut phase = advance(HealPhase::Idle, PhaseEvent::Start);

        let audio = self.remediation.repair_audio(&address).await;
        {
            let step = record.stage_mut(stage);
            step.heal_time = Some(Utc::now());
            step.heal_details = Some(audio.detail.clone());
            step.audio = if audio.success {
                StepState::InProgress
            } else {
                StepState::Failed
            };
        }
        self.heal_log
            .append(
                &address,
                &format!("{label}-HEAL: PulseAudio restart - {}", outcome_word(audio.success)),
            )
            .await;
        self.checkpoint(record, persist_failures).await;

        if !audio.success {
            return advance(phase, PhaseEvent::AudioFailed);
        }
        phase = advance(phase, PhaseEvent::AudioSucceeded);

        debug!(address = %address, settle_secs = self.settings.settle.as_secs(), "Waiting for audio to settle");
        tokio::time::sleep(self.settings.settle).await;
        phase = advance(phase, PhaseEvent::Settled);

        let container = self
            .remediation
            .repair_container(&address, &self.settings.params)
            .await;
        {
            let step = record.stage_mut(stage);
            step.save_time = Some(Utc::now());
            step.save_details = Some(container.detail.clone());
            step.container = if container.success {
                StepState::InProgress
            } else {
                StepState::Failed
            };
        }
        self.heal_log
            .append(
                &address,
                &format!(
                    "{label}-CONTAINER: PA container restart - {}",
                    outcome_word(container.success)
                ),
            )
            .await;
        self.checkpoint(record, persist_failures).await;

        if !container.success {
            return advance(phase, PhaseEvent::ContainerFailed);
        }
        phase = advance(phase, PhaseEvent::ContainerSucceeded);

        debug!(address = %address, settle_secs = self.settings.settle.as_secs(), "Waiting before verification");
        tokio::time::sleep(self.settings.settle).await;

        let verification = self.probe.check_single(&address).await;
        let healthy = verification.verdict == Verdict::Healthy;
        {
            let step = record.stage_mut(stage);
            let state = if healthy {
                StepState::Done
            } else {
                StepState::Failed
            };
            step.audio = state;
            step.container = state;
        }

        if healthy {
            record.status = ServerStatus::Ok;
            record.log = format!("Auto-healed successfully: {}", verification.summary);
            self.heal_log
                .append(
                    &address,
                    &format!("{label}-VERIFICATION: Server is now HEALTHY - Status updated to OK"),
                )
                .await;
            phase = advance(phase, PhaseEvent::Healthy);
            if let Some(kind) = HealingKind::of(record) {
                info!(address = %address, kind = kind.description(), "Server healed");
            }
        } else {
            record.log = format!("Healing attempted but still failing: {}", verification.summary);
            self.heal_log
                .append(&address, &format!("{label}-VERIFICATION: Server still UNHEALTHY"))
                .await;
            phase = advance(phase, PhaseEvent::Unhealthy);
        }

        self.checkpoint(record, persist_failures).await;
        phase
    }

    async fn checkpoint(&self, record: &ServerRecord, persist_failures: &mut usize) {
        if let Err(e) = self.store.upsert(record).await {
            *persist_failures += 1;
            warn!(
                address = %record.address,
                error = %e,
                "Failed to persist server status, continuing in memory"
            );
        }
    }

    async fn dispatch_changes(&self, before: &[ServerRecord]) -> usize {
        match self.store.load().await {
            Ok(after) => self.monitor.dispatch(before, &after).await,
            Err(e) => {
                warn!(error = %e, "Failed to read status after healing, skipping change alerts");
                0
            }
        }
    }
}
