//! Fleet data model: server records, attempt stages and probe verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical health state of a server.
///
/// This is the only field that decides healing eligibility and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Ok,
    Fail,
    Error,
    /// Infrastructure (IO/firewall) fault; needs manual intervention
    FailIoError,
    /// Anything the scan script reported that we do not recognise
    #[serde(other)]
    Unknown,
}

impl ServerStatus {
    /// Whether this status makes a server a healing candidate.
    #[must_use]
    pub fn is_failing(&self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::FailIoError => "fail_io_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one remediation sub-step (audio restart or container restart).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    #[default]
    NotAttempted,
    InProgress,
    Done,
    Failed,
}

impl StepState {
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::NotAttempted => "Not Attempted",
            Self::InProgress => "In-Progress",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    /// Parse the display names used by older status files.
    fn from_legacy(value: &str) -> Self {
        match value {
            "Done" | "Completed" => Self::Done,
            "In-Progress" | "In Progress" => Self::InProgress,
            "Failed" => Self::Failed,
            _ => Self::NotAttempted,
        }
    }
}

/// A named healing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStage {
    First,
    Second,
    Manual,
}

impl AttemptStage {
    /// Prefix of this stage's keys in the flat status layout.
    const fn legacy_prefix(&self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Second => "second",
            Self::Manual => "manual",
        }
    }

    /// Upper-case label used in heal logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::First => "FIRST",
            Self::Second => "SECOND",
            Self::Manual => "MANUAL",
        }
    }
}

impl std::fmt::Display for AttemptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Sub-step state and diagnostics for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StageRecord {
    /// Audio subsystem restart
    pub audio: StepState,
    pub heal_time: Option<DateTime<Utc>>,
    pub heal_details: Option<String>,
    /// Container restart/save
    pub container: StepState,
    pub save_time: Option<DateTime<Utc>>,
    pub save_details: Option<String>,
}

/// Attempt state for every stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attempts {
    pub first: StageRecord,
    pub second: StageRecord,
    pub manual: StageRecord,
}

impl Attempts {
    #[must_use]
    pub fn stage(&self, stage: AttemptStage) -> &StageRecord {
        match stage {
            AttemptStage::First => &self.first,
            AttemptStage::Second => &self.second,
            AttemptStage::Manual => &self.manual,
        }
    }

    pub fn stage_mut(&mut self, stage: AttemptStage) -> &mut StageRecord {
        match stage {
            AttemptStage::First => &mut self.first,
            AttemptStage::Second => &mut self.second,
            AttemptStage::Manual => &mut self.manual,
        }
    }

    /// True when no stage has recorded any activity.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        *self == Self::default()
    }
}

/// One monitored server. Identity is the network address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub name: String,
    #[serde(rename = "ip")]
    pub address: String,
    pub status: ServerStatus,
    #[serde(default)]
    pub log: String,
    #[serde(default, skip_serializing_if = "Attempts::is_pristine")]
    pub attempts: Attempts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heal_time: Option<DateTime<Utc>>,
    /// Fields written by the scan script that we carry through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServerRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>, status: ServerStatus) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            status,
            log: String::new(),
            attempts: Attempts::default(),
            last_heal_time: None,
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }

    #[must_use]
    pub fn stage(&self, stage: AttemptStage) -> &StageRecord {
        self.attempts.stage(stage)
    }

    pub fn stage_mut(&mut self, stage: AttemptStage) -> &mut StageRecord {
        self.attempts.stage_mut(stage)
    }

    /// Move flat per-stage keys (`firstPulseAudio`, `manualHealTime`, ...)
    /// out of `extra` into `attempts`.
    ///
    /// A stage that already has structured state keeps it; its flat keys are
    /// dropped. Returns true if any flat key carried a value.
    pub fn migrate_legacy_steps(&mut self) -> bool {
        let mut migrated = false;
        for stage in [AttemptStage::First, AttemptStage::Second, AttemptStage::Manual] {
            let prefix = stage.legacy_prefix();
            let mut take = |suffix: &str| {
                self.extra
                    .remove(&format!("{prefix}{suffix}"))
                    .filter(|v| !v.is_null())
            };
            let audio = take("PulseAudio");
            let container = take("Container");
            let heal_time = take("HealTime");
            let heal_details = take("HealDetails");
            let save_time = take("SaveTime");
            let save_details = take("SaveDetails");

            let found = [
                &audio,
                &container,
                &heal_time,
                &heal_details,
                &save_time,
                &save_details,
            ]
            .iter()
            .any(|v| v.is_some());
            if !found {
                continue;
            }
            migrated = true;

            let record = self.attempts.stage_mut(stage);
            if *record != StageRecord::default() {
                continue;
            }
            let state = |v: Option<serde_json::Value>| {
                v.as_ref()
                    .and_then(serde_json::Value::as_str)
                    .map_or(StepState::NotAttempted, StepState::from_legacy)
            };
            let time = |v: Option<serde_json::Value>| -> Option<DateTime<Utc>> {
                v.and_then(|v| serde_json::from_value(v).ok())
            };
            let text = |v: Option<serde_json::Value>| {
                v.map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
            };

            record.audio = state(audio);
            record.container = state(container);
            record.heal_time = time(heal_time);
            record.heal_details = text(heal_details);
            record.save_time = time(save_time);
            record.save_details = text(save_details);
        }
        migrated
    }

    /// Alert context for this server.
    #[must_use]
    pub fn context(&self) -> notify::ServerContext {
        notify::ServerContext {
            name: self.name.clone(),
            address: self.address.clone(),
            status: self.status.to_string(),
        }
    }
}

/// Ordered fleet state captured at one instant. Never mutated after capture.
pub type FleetSnapshot = Vec<ServerRecord>;

/// Tri-state health classification produced by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Healthy,
    Unhealthy,
    NeedsManualIntervention,
}

/// Which healing pass most recently finished for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealingKind {
    Manual,
    Second,
    First,
}

impl HealingKind {
    /// Derive the most significant completed pass from a record.
    #[must_use]
    pub fn of(record: &ServerRecord) -> Option<Self> {
        let done = |stage: &StageRecord| {
            stage.audio == StepState::Done || stage.container == StepState::Done
        };
        if done(&record.attempts.manual) {
            Some(Self::Manual)
        } else if done(&record.attempts.second) {
            Some(Self::Second)
        } else if done(&record.attempts.first) {
            Some(Self::First)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Manual => "Manual Healing",
            Self::Second => "Second Auto-Healing Attempt",
            Self::First => "First Auto-Healing Attempt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_eligibility() {
        assert!(ServerStatus::Fail.is_failing());
        assert!(ServerStatus::Error.is_failing());
        assert!(!ServerStatus::Ok.is_failing());
        assert!(!ServerStatus::FailIoError.is_failing());
    }

    #[test]
    fn test_record_reads_scan_script_layout() {
        let json = r#"{
            "name": "pa-store-12",
            "ip": "10.0.0.12",
            "status": "fail_io_error",
            "log": "io error on /dev/snd",
            "timestamp": "2026-01-01T00:00:00Z"
        }"#;

        let record: ServerRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.address, "10.0.0.12");
        assert_eq!(record.status, ServerStatus::FailIoError);
        assert!(record.attempts.is_pristine());
        assert!(record.extra.contains_key("timestamp"));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["ip"], "10.0.0.12");
        assert_eq!(back["timestamp"], "2026-01-01T00:00:00Z");
        assert!(back.get("attempts").is_none());
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let record: ServerRecord =
            serde_json::from_str(r#"{"name":"a","ip":"1.1.1.1","status":"weird"}"#).unwrap();
        assert_eq!(record.status, ServerStatus::Unknown);
    }

    #[test]
    fn test_step_state_serialization() {
        let mut record = ServerRecord::new("pa", "10.0.0.1", ServerStatus::Fail);
        record.stage_mut(AttemptStage::First).audio = StepState::Done;

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["attempts"]["first"]["audio"], "Done");
        assert_eq!(value["attempts"]["first"]["container"], "NotAttempted");
    }

    #[test]
    fn test_flat_stage_keys_are_migrated() {
        let json = r#"{
            "name": "pa-store-3",
            "ip": "10.0.0.3",
            "status": "ok",
            "firstPulseAudio": "Failed",
            "firstContainer": "Not Attempted",
            "firstHealTime": "2025-06-01T10:00:00Z",
            "firstHealDetails": "API call failed: timeout",
            "manualPulseAudio": "Completed",
            "manualContainer": "Completed",
            "secondHealTimer": null,
            "timestamp": "2025-06-01T10:05:00Z"
        }"#;

        let mut record: ServerRecord = serde_json::from_str(json).unwrap();
        assert!(record.migrate_legacy_steps());

        assert_eq!(record.attempts.first.audio, StepState::Failed);
        assert_eq!(record.attempts.first.container, StepState::NotAttempted);
        assert!(record.attempts.first.heal_time.is_some());
        assert_eq!(
            record.attempts.first.heal_details.as_deref(),
            Some("API call failed: timeout")
        );
        assert_eq!(record.attempts.manual.audio, StepState::Done);
        assert!(record.attempts.second == StageRecord::default());

        let back = serde_json::to_value(&record).unwrap();
        assert!(back.get("firstPulseAudio").is_none());
        assert!(back.get("manualContainer").is_none());
        assert_eq!(back["timestamp"], "2025-06-01T10:05:00Z");
        assert_eq!(back["attempts"]["manual"]["audio"], "Done");

        assert!(!record.migrate_legacy_steps());
    }

    #[test]
    fn test_structured_state_wins_over_flat_keys() {
        let mut record = ServerRecord::new("pa", "10.0.0.1", ServerStatus::Fail);
        record.stage_mut(AttemptStage::First).audio = StepState::Done;
        record
            .extra
            .insert("firstPulseAudio".to_string(), serde_json::json!("Failed"));

        assert!(record.migrate_legacy_steps());
        assert_eq!(record.attempts.first.audio, StepState::Done);
        assert!(record.extra.is_empty());
    }

    #[test]
    fn test_healing_kind_prefers_latest_pass() {
        let mut record = ServerRecord::new("pa", "10.0.0.1", ServerStatus::Ok);
        assert_eq!(HealingKind::of(&record), None);

        record.stage_mut(AttemptStage::First).audio = StepState::Done;
        assert_eq!(HealingKind::of(&record), Some(HealingKind::First));

        record.stage_mut(AttemptStage::Manual).container = StepState::Done;
        assert_eq!(HealingKind::of(&record), Some(HealingKind::Manual));
        assert_eq!(
            HealingKind::of(&record).map(|k| k.description()),
            Some("Manual Healing")
        );
    }
}
