//! Periodic fleet refresh.
//!
//! [`RefreshScheduler`] owns the single ticker task. Re-arming it (a new
//! interval) aborts the old task before the new one starts, so at most one
//! ticker ever runs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::orchestrator::HealingOrchestrator;
use crate::scanner::FleetScanner;

/// Shortest period the ticker accepts.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Longest period or initial delay the ticker accepts.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Work performed on every tick.
#[async_trait]
pub trait RefreshJob: Send + Sync {
    async fn run(&self);
}

/// Scan the fleet, alert on changes and start healing.
pub struct RefreshAndHeal {
    pub orchestrator: Arc<HealingOrchestrator>,
    pub scanner: Arc<dyn FleetScanner>,
}

#[async_trait]
impl RefreshJob for RefreshAndHeal {
    async fn run(&self) {
        match self.orchestrator.refresh_and_heal(self.scanner.as_ref()).await {
            Ok(outcome) => info!(
                servers = outcome.servers,
                transitions = outcome.transitions,
                "Auto-refresh completed"
            ),
            Err(e) => error!(error = %e, "Auto-refresh failed"),
        }
    }
}

struct Ticker {
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

/// Re-armable periodic runner for a [`RefreshJob`].
pub struct RefreshScheduler {
    job: Arc<dyn RefreshJob>,
    ticker: Mutex<Ticker>,
}

impl RefreshScheduler {
    /// `interval` is clamped to [`MIN_INTERVAL`]..=[`MAX_INTERVAL`].
    #[must_use]
    pub fn new(job: Arc<dyn RefreshJob>, interval: Duration) -> Self {
        Self {
            job,
            ticker: Mutex::new(Ticker {
                interval: clamp_interval(interval),
                handle: None,
            }),
        }
    }

    /// Start ticking; the first run happens after `initial_delay`.
    pub fn start(&self, initial_delay: Duration) {
        let mut ticker = self.lock();
        let interval = ticker.interval;
        self.arm(&mut ticker, initial_delay, interval);
    }

    /// Change the interval and restart the ticker from now.
    pub fn set_interval(&self, interval: Duration) {
        let interval = clamp_interval(interval);
        let mut ticker = self.lock();
        ticker.interval = interval;
        self.arm(&mut ticker, interval, interval);
        info!(minutes = interval.as_secs() / 60, "Auto-refresh interval updated");
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.lock().interval
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop ticking. A run already in progress is aborted at its next await.
    pub fn stop(&self) {
        if let Some(handle) = self.lock().handle.take() {
            handle.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ticker> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(&self, ticker: &mut Ticker, first: Duration, period: Duration) {
        if let Some(old) = ticker.handle.take() {
            old.abort();
        }

        let first = first.min(MAX_INTERVAL);
        let job = Arc::clone(&self.job);
        ticker.handle = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + first, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                job.run().await;
            }
        }));
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    let clamped = interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
    if clamped != interval {
        warn!(
            requested_secs = interval.as_secs(),
            used_secs = clamped.as_secs(),
            "Refresh interval out of range, clamped"
        );
    }
    clamped
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
