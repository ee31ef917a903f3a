//! Self-healing monitor for a fleet of PA audio servers.
//!
//! A fleet scan records each server's health in the status store. Status
//! transitions raise deduplicated email alerts. Failed servers go through an
//! automated repair sequence (audio restart, container restart, verification)
//! up to twice, and operators can trigger a manual heal at any time.
//!
//! Components, leaves first:
//! - [`dedup`]: keyed cooldown ledger for alerts
//! - [`probe`]: check script wrapper and verdict classification
//! - [`remediation`]: per-server repair API client
//! - [`store`]: durable fleet status
//! - [`monitor`]: snapshot diffing and status-change alerts
//! - [`orchestrator`]: the healing state machine and attempt scheduling
//! - [`scheduler`]: periodic auto-refresh
//! - [`server`]: HTTP control surface

pub mod config;
pub mod dedup;
pub mod error;
pub mod heal_log;
pub mod monitor;
pub mod orchestrator;
pub mod phase;
pub mod probe;
pub mod remediation;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;

pub use config::HealerConfig;
pub use dedup::{AlertDeduplicator, AlertKey};
pub use error::{HealerError, Result};
pub use heal_log::HealLog;
pub use monitor::{ChangeMonitor, Transition};
pub use orchestrator::{
    Collaborators, CycleReport, HealingOrchestrator, HealingSettings, ManualHealReport,
};
pub use phase::HealPhase;
pub use probe::{classify_verdict, HealthProbe, ProbeReport, ScriptProbe};
pub use remediation::{HttpRemediationClient, Outcome, RemediationClient, RepairParams};
pub use scanner::{FleetScanner, ScriptFleetScanner};
pub use store::StatusStore;
pub use types::{AttemptStage, ServerRecord, ServerStatus, StepState, Verdict};
