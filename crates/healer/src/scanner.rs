//! Fleet-wide scans.
//!
//! A scan runs the check script over every server; the script rewrites the
//! status file itself. The scanner then waits a short settle delay so the
//! file is complete before anyone reads it.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::probe::ScriptProbe;

/// Refreshes the persisted fleet from the monitored servers.
#[async_trait]
pub trait FleetScanner: Send + Sync {
    async fn scan(&self) -> Result<()>;
}

/// Scanner backed by the check script in fleet mode.
#[derive(Debug, Clone)]
pub struct ScriptFleetScanner {
    probe: ScriptProbe,
    timeout: Duration,
    settle: Duration,
}

impl ScriptFleetScanner {
    #[must_use]
    pub fn new(probe: ScriptProbe, timeout: Duration, settle: Duration) -> Self {
        Self {
            probe,
            timeout,
            settle,
        }
    }
}

#[async_trait]
impl FleetScanner for ScriptFleetScanner {
    async fn scan(&self) -> Result<()> {
        info!("Running fleet scan");
        self.probe.run_fleet_scan(self.timeout).await?;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }
}
