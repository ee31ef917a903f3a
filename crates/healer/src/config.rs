//! Monitor configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then `PA_*`
//! environment variables. Command-line flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::EmailConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::orchestrator::HealingSettings;
use crate::remediation::{RemediationConfig, RepairParams};

/// Full runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    /// Directory holding the status file, alert ledger and heal logs
    pub data_dir: PathBuf,
    pub status_file: String,
    pub alert_history_file: String,
    pub heal_log_dir: String,

    /// Fleet check script (`<script>` for a scan, `<script> single <ip>` for one server)
    pub check_script: PathBuf,
    pub probe_timeout_secs: u64,
    pub scan_timeout_secs: u64,

    /// Port of the per-server repair API
    pub remote_port: u16,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub repair: RepairParams,

    pub settle_secs: u64,
    pub second_attempt_delay_secs: u64,
    pub manual_verify_secs: u64,
    pub status_change_cooldown_mins: u64,
    pub io_error_cooldown_mins: u64,

    pub scan_interval_mins: u64,
    pub scan_settle_secs: u64,
    pub initial_scan_delay_secs: u64,

    /// Alert when a server disappears from the scan
    pub alert_on_removed: bool,
    pub auto_heal: bool,

    pub email: EmailConfig,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            status_file: "status.json".to_string(),
            alert_history_file: "alert_history.json".to_string(),
            heal_log_dir: "heal_logs".to_string(),
            check_script: PathBuf::from("/home/serveradmin/pa/check.sh"),
            probe_timeout_secs: 120,
            scan_timeout_secs: 30 * 60,
            remote_port: 3000,
            connect_timeout_secs: 30,
            request_timeout_secs: 60,
            repair: RepairParams::default(),
            settle_secs: 60,
            second_attempt_delay_secs: 10 * 60,
            manual_verify_secs: 60,
            status_change_cooldown_mins: 1,
            io_error_cooldown_mins: 60,
            scan_interval_mins: 30,
            scan_settle_secs: 5,
            initial_scan_delay_secs: 15,
            alert_on_removed: false,
            auto_heal: true,
            email: EmailConfig::default(),
        }
    }
}

impl HealerConfig {
    /// Load defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.scan_interval_mins >= 1,
            "scan_interval_mins must be at least 1, got {}",
            self.scan_interval_mins
        );
        Ok(())
    }

    /// Parse a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `PA_*` overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = &lookup;
        override_with(lookup, "PA_DATA_DIR", &mut self.data_dir);
        override_with(lookup, "PA_CHECK_SCRIPT", &mut self.check_script);
        override_with(lookup, "PA_REMOTE_PORT", &mut self.remote_port);
        override_with(lookup, "PA_SCAN_INTERVAL_MINS", &mut self.scan_interval_mins);
        override_with(lookup, "PA_AUTO_HEAL", &mut self.auto_heal);
        override_with(lookup, "PA_ALERT_ON_REMOVED", &mut self.alert_on_removed);
        override_with(lookup, "PA_SMTP_HOST", &mut self.email.smtp_host);
        override_with(lookup, "PA_SMTP_PORT", &mut self.email.smtp_port);
        override_with(lookup, "PA_ALERT_FROM", &mut self.email.from);
        override_with(lookup, "PA_ALERT_TO", &mut self.email.to);

        if let Some(user) = lookup("PA_SMTP_USER") {
            self.email.username = Some(user);
        }
        if let Some(password) = lookup("PA_SMTP_PASSWORD") {
            self.email.password = Some(password);
        }
    }

    #[must_use]
    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join(&self.status_file)
    }

    #[must_use]
    pub fn alert_history_path(&self) -> PathBuf {
        self.data_dir.join(&self.alert_history_file)
    }

    #[must_use]
    pub fn heal_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.heal_log_dir)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    #[must_use]
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        minutes(self.scan_interval_mins)
    }

    #[must_use]
    pub fn scan_settle(&self) -> Duration {
        Duration::from_secs(self.scan_settle_secs)
    }

    #[must_use]
    pub fn initial_scan_delay(&self) -> Duration {
        Duration::from_secs(self.initial_scan_delay_secs)
    }

    #[must_use]
    pub fn status_change_cooldown(&self) -> Duration {
        minutes(self.status_change_cooldown_mins)
    }

    #[must_use]
    pub fn remediation(&self) -> RemediationConfig {
        RemediationConfig {
            port: self.remote_port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            total_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    #[must_use]
    pub fn healing(&self) -> HealingSettings {
        HealingSettings {
            settle: Duration::from_secs(self.settle_secs),
            second_attempt_delay: Duration::from_secs(self.second_attempt_delay_secs),
            manual_verify_wait: Duration::from_secs(self.manual_verify_secs),
            io_error_cooldown: minutes(self.io_error_cooldown_mins),
            auto_heal: self.auto_heal,
            params: self.repair.clone(),
        }
    }
}

/// Convert whole minutes to a duration, saturating on overflow.
#[must_use]
pub fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

fn override_with<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, target: &mut T) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(variable = name, value = %raw, "Ignoring unparseable environment override"),
    }
}
