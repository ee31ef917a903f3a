//! Snapshot diffing and status-change alerts.
//!
//! Only a change of `status` for an address present in both snapshots is a
//! transition. Newly discovered servers are silent; disappeared servers are
//! logged and alerted only when `alert_on_removed` is set.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use notify::{Alert, Notifier};
use tracing::{debug, info};

use crate::dedup::{AlertDeduplicator, AlertKey, SERVER_REMOVED, STATUS_CHANGE};
use crate::types::{ServerRecord, ServerStatus};

/// A change in one server's canonical status between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub address: String,
    pub name: String,
    pub from: ServerStatus,
    pub to: ServerStatus,
}

/// Status transitions from `old` to `new`, in `new` order.
#[must_use]
pub fn diff(old: &[ServerRecord], new: &[ServerRecord]) -> Vec<Transition> {
    new.iter()
        .filter_map(|current| {
            let prior = old.iter().find(|o| o.address == current.address)?;
            (prior.status != current.status).then(|| Transition {
                address: current.address.clone(),
                name: current.name.clone(),
                from: prior.status,
                to: current.status,
            })
        })
        .collect()
}

/// Records present in `old` but missing from `new`.
#[must_use]
pub fn removed<'a>(old: &'a [ServerRecord], new: &[ServerRecord]) -> Vec<&'a ServerRecord> {
    old.iter()
        .filter(|o| !new.iter().any(|n| n.address == o.address))
        .collect()
}

fn local_time() -> String {
    Local::now().format("%d/%m/%Y, %H:%M:%S").to_string()
}

/// Alert for a transition, or `None` when the target status is not alerted.
#[must_use]
pub fn transition_alert(transition: &Transition, server: &ServerRecord) -> Option<Alert> {
    let Transition {
        address,
        name,
        from,
        to,
    } = transition;

    let (subject, body, status) = match to {
        ServerStatus::Fail | ServerStatus::Error => (
            format!("Server Failure: {name}"),
            format!(
                "Server {name} ({address}) is now FAILING\n\n\
                 Previous Status: {from}\n\
                 Current Status: {to}\n\
                 Failure Time: {}",
                local_time()
            ),
            "fail",
        ),
        ServerStatus::Ok => (
            format!("Server Recovered: {name}"),
            format!(
                "Server {name} ({address}) has RECOVERED and is now healthy!\n\n\
                 Previous Status: {from}\n\
                 Current Status: {to}\n\
                 Recovery Time: {}",
                local_time()
            ),
            "ok",
        ),
        ServerStatus::FailIoError | ServerStatus::Unknown => return None,
    };

    Some(
        Alert::new(subject, body)
            .with_server(server.context())
            .with_status(status),
    )
}

/// Turns snapshot differences into deduplicated alerts.
pub struct ChangeMonitor {
    notifier: Arc<Notifier>,
    dedup: Arc<AlertDeduplicator>,
    cooldown: Duration,
    alert_on_removed: bool,
}

impl ChangeMonitor {
    #[must_use]
    pub fn new(notifier: Arc<Notifier>, dedup: Arc<AlertDeduplicator>, cooldown: Duration) -> Self {
        Self {
            notifier,
            dedup,
            cooldown,
            alert_on_removed: false,
        }
    }

    #[must_use]
    pub fn with_removed_alerts(mut self, enabled: bool) -> Self {
        self.alert_on_removed = enabled;
        self
    }

    /// Diff two snapshots and send an alert for each genuine transition.
    ///
    /// Returns the number of alerts handed to the notifier.
    pub async fn dispatch(&self, old: &[ServerRecord], new: &[ServerRecord]) -> usize {
        let transitions = diff(old, new);
        debug!(
            old = old.len(),
            new = new.len(),
            transitions = transitions.len(),
            "Compared fleet snapshots"
        );

        let mut sent = 0;
        for transition in &transitions {
            info!(
                address = %transition.address,
                from = %transition.from,
                to = %transition.to,
                "Status change detected"
            );

            let Some(server) = new.iter().find(|s| s.address == transition.address) else {
                continue;
            };
            let Some(alert) = transition_alert(transition, server) else {
                debug!(address = %transition.address, to = %transition.to, "No alert for this status");
                continue;
            };

            let key = AlertKey::new(&transition.address, STATUS_CHANGE)
                .with_detail(transition.to.as_str());
            if !self.dedup.try_acquire(&key, self.cooldown).await {
                continue;
            }

            self.notifier.notify(alert).await;
            sent += 1;
        }

        for gone in removed(old, new) {
            info!(address = %gone.address, name = %gone.name, "Server removed from monitoring");
            if !self.alert_on_removed {
                continue;
            }
            let key = AlertKey::new(&gone.address, SERVER_REMOVED);
            if self.dedup.try_acquire(&key, self.cooldown).await {
                let alert = Alert::new(
                    format!("Server Removed: {}", gone.name),
                    format!(
                        "Server {} ({}) is no longer reported by the fleet scan.\n\n\
                         Last Status: {}",
                        gone.name, gone.address, gone.status
                    ),
                )
                .with_server(gone.context());
                self.notifier.notify(alert).await;
                sent += 1;
            }
        }

        sent
    }
}
