//! Health probe: runs the external check script and classifies its output.
//!
//! The check script is a black box. Its free-text output is reduced to a
//! [`Verdict`] by [`classify_verdict`], an ordered rule list:
//!
//! 1. infrastructure-fault phrase (`io error`, any case) short-circuits to
//!    [`Verdict::NeedsManualIntervention`]
//! 2. success markers give [`Verdict::Healthy`]
//! 3. failure markers give [`Verdict::Unhealthy`]
//! 4. anything else is [`Verdict::Unhealthy`]

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::error::{HealerError, Result};
use crate::types::{ServerStatus, Verdict};

/// Infrastructure fault signature, matched case-insensitively.
pub const IO_FAULT_PHRASE: &str = "io error";

/// Exit code the check script uses to flag an IO/firewall fault.
pub const IO_FAULT_EXIT_CODE: i32 = 2;

/// Phrases that mark a healthy server. Matched case-insensitively.
const SUCCESS_MARKERS: &[&str] = &["✅ ok", "verification: success", "server is healthy"];

/// Phrases that mark an unreachable or unhealthy server.
const FAILURE_MARKERS: &[&str] = &[
    "server not reachable",
    "not reachable",
    "ssh connection timeout",
    "authentication failed",
    "connection refused",
];

/// Maximum characters of raw probe output kept for diagnostics.
const OUTPUT_LIMIT: usize = 1000;

/// Whether `text` carries the infrastructure fault signature.
#[must_use]
pub fn has_io_fault(text: &str) -> bool {
    text.to_lowercase().contains(IO_FAULT_PHRASE)
}

/// Ordered classification rules; the first rule with a matching marker wins.
const VERDICT_RULES: &[(&[&str], Verdict)] = &[
    (&[IO_FAULT_PHRASE], Verdict::NeedsManualIntervention),
    (SUCCESS_MARKERS, Verdict::Healthy),
    (FAILURE_MARKERS, Verdict::Unhealthy),
];

/// Classify free-text probe output. Unmatched output is unhealthy.
#[must_use]
pub fn classify_verdict(text: &str) -> Verdict {
    let lower = text.to_lowercase();
    VERDICT_RULES
        .iter()
        .find(|(markers, _)| markers.iter().any(|m| lower.contains(m)))
        .map_or(Verdict::Unhealthy, |(_, verdict)| *verdict)
}

/// Map probe output to the canonical status the dashboard shows.
#[must_use]
pub fn classify_status(text: &str) -> ServerStatus {
    match classify_verdict(text) {
        Verdict::NeedsManualIntervention => ServerStatus::FailIoError,
        Verdict::Healthy => ServerStatus::Ok,
        Verdict::Unhealthy => {
            let lower = text.to_lowercase();
            if FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
                ServerStatus::Error
            } else {
                ServerStatus::Fail
            }
        }
    }
}

/// Result of probing one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub verdict: Verdict,
    /// Raw output, truncated
    pub output: String,
    /// One-line human-readable explanation
    pub summary: String,
}

impl ProbeReport {
    /// Build a report from raw probe output.
    #[must_use]
    pub fn from_output(output: &str) -> Self {
        let verdict = classify_verdict(output);
        let summary = match verdict {
            Verdict::Healthy => format!(
                "Server verified as healthy: {}",
                find_line(output, &["✅", "VERIFICATION"]).unwrap_or("Server is running normally")
            ),
            Verdict::NeedsManualIntervention => format!(
                "IO/firewall fault detected: {}",
                find_line(output, &["io error", "IO error", "IO ERROR"]).unwrap_or("io error")
            ),
            Verdict::Unhealthy => format!(
                "Server still has issues: {}",
                find_line(output, &["❌", "FAIL"])
                    .unwrap_or("Verification completed but server not healthy")
            ),
        };
        Self {
            verdict,
            output: truncate(output, OUTPUT_LIMIT),
            summary,
        }
    }

    /// An unhealthy report for a probe that could not produce output.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            verdict: Verdict::Unhealthy,
            output: String::new(),
            summary: format!("Verification command failed: {reason}"),
        }
    }

    /// Canonical status implied by this report.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        if self.output.is_empty() {
            match self.verdict {
                Verdict::Healthy => ServerStatus::Ok,
                Verdict::NeedsManualIntervention => ServerStatus::FailIoError,
                Verdict::Unhealthy => ServerStatus::Error,
            }
        } else {
            classify_status(&self.output)
        }
    }
}

fn find_line<'a>(output: &'a str, needles: &[&str]) -> Option<&'a str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| needles.iter().any(|n| line.contains(n)))
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Black-box health check for one server.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe a single server. Never fails: probe errors are `Unhealthy`.
    async fn check_single(&self, address: &str) -> ProbeReport;
}

/// Probe backed by the check shell script.
#[derive(Debug, Clone)]
pub struct ScriptProbe {
    script: PathBuf,
    timeout: Duration,
}

impl ScriptProbe {
    #[must_use]
    pub fn new(script: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            script: script.into(),
            timeout,
        }
    }

    /// Run the script over the whole fleet. The script rewrites the status
    /// file itself; only success or failure is reported here.
    pub async fn run_fleet_scan(&self, timeout: Duration) -> Result<()> {
        let output = self.run(&[], timeout).await?;
        if output.status.success() {
            debug!("Fleet scan completed");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(HealerError::Probe(format!(
                "check script exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<std::process::Output> {
        let mut command = Command::new("bash");
        command
            .arg(&self.script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(HealerError::Probe(format!(
                "failed to run {}: {e}",
                self.script.display()
            ))),
            Err(_) => Err(HealerError::Probe(format!(
                "timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl HealthProbe for ScriptProbe {
    async fn check_single(&self, address: &str) -> ProbeReport {
        debug!(address = %address, "Probing server");

        let output = match self.run(&["single", address], self.timeout).await {
            Ok(output) => output,
            Err(e) => {
                error!(address = %address, error = %e, "Probe failed");
                return ProbeReport::failed(e.to_string());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);

        if output.status.code() == Some(IO_FAULT_EXIT_CODE) {
            warn!(address = %address, "Probe flagged IO/firewall fault");
            return ProbeReport {
                verdict: Verdict::NeedsManualIntervention,
                output: truncate(&stdout, OUTPUT_LIMIT),
                summary: "IO/firewall fault reported by check script".to_string(),
            };
        }

        if stdout.trim().is_empty() {
            warn!(address = %address, status = %output.status, "Probe returned no output");
            return ProbeReport::failed("no output received from check command");
        }

        let report = ProbeReport::from_output(&stdout);
        debug!(address = %address, verdict = ?report.verdict, "Probe classified");
        report
    }
}
