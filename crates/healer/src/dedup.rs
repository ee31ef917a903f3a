//! Alert deduplication ledger.
//!
//! Every alert is identified by an [`AlertKey`] `(address, class, detail)`.
//! The ledger remembers when each key was last sent and suppresses repeats
//! inside a cooldown window. The ledger is persisted after every update and
//! reloaded on start-up; entries never expire on their own.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{read_json, write_json_atomic};

/// Alert class for ordinary status transitions.
pub const STATUS_CHANGE: &str = "status_change";

/// Alert class for servers skipped because of an IO/firewall fault.
pub const IO_ERROR_SKIP_HEALING: &str = "io_error_skip_healing";

/// Alert class for servers that disappeared from the scan.
pub const SERVER_REMOVED: &str = "server_removed";

/// Separator between encoded key components.
const KEY_SEPARATOR: char = '|';

/// Identity of an alert for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub address: String,
    pub class: String,
    pub detail: String,
}

impl AlertKey {
    #[must_use]
    pub fn new(address: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            class: class.into(),
            detail: String::new(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Decode a ledger key produced by [`AlertKey::to_string`].
    #[must_use]
    pub fn parse(encoded: &str) -> Option<Self> {
        let mut parts = encoded.split(KEY_SEPARATOR);
        let address = unescape(parts.next()?)?;
        let class = unescape(parts.next()?)?;
        let detail = unescape(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            address,
            class,
            detail,
        })
    }
}

impl fmt::Display for AlertKey {
    /// Components are percent-escaped so distinct triples never share a key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            escape(&self.address),
            escape(&self.class),
            escape(&self.detail)
        )
    }
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(component: &str) -> Option<String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let code = rest.get(idx + 1..idx + 3)?;
        match code {
            "25" => out.push('%'),
            "7C" => out.push('|'),
            _ => return None,
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Some(out)
}

/// One ledger entry as exposed to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertHistoryEntry {
    pub key: String,
    pub ip: String,
    pub alert_type: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

/// Keyed cooldown ledger deciding whether a notification may be sent now.
pub struct AlertDeduplicator {
    path: PathBuf,
    /// Encoded key -> last-sent epoch milliseconds
    entries: Mutex<BTreeMap<String, i64>>,
}

impl AlertDeduplicator {
    /// Load the ledger from `path`.
    ///
    /// A missing or unreadable ledger starts empty; an unreadable one is
    /// logged and will be overwritten on the next send.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_json::<BTreeMap<String, i64>>(&path).await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Failed to load alert history, starting empty");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), entries = entries.len(), "Alert history loaded");
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Whether `key` may be sent now given `cooldown`.
    pub async fn should_send(&self, key: &AlertKey, cooldown: Duration) -> bool {
        self.should_send_at(key, cooldown, Utc::now()).await
    }

    /// Whether `key` may be sent at `now` given `cooldown`.
    pub async fn should_send_at(
        &self,
        key: &AlertKey,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let entries = self.entries.lock().await;
        cooldown_elapsed(entries.get(&key.to_string()).copied(), cooldown, now)
    }

    /// Stamp `key` as sent now and persist the ledger.
    pub async fn record_sent(&self, key: &AlertKey) -> Result<()> {
        self.record_sent_at(key, Utc::now()).await
    }

    /// Stamp `key` as sent at `now` and persist the ledger.
    pub async fn record_sent_at(&self, key: &AlertKey, now: DateTime<Utc>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), now.timestamp_millis());
        write_json_atomic(&self.path, &*entries).await
    }

    /// Check the cooldown and, if it has elapsed, stamp the key in one step.
    ///
    /// Concurrent callers racing on the same key see exactly one `true`.
    /// A persistence failure is logged; the in-memory stamp still applies.
    pub async fn try_acquire(&self, key: &AlertKey, cooldown: Duration) -> bool {
        let now = Utc::now();
        let encoded = key.to_string();
        let mut entries = self.entries.lock().await;

        if !cooldown_elapsed(entries.get(&encoded).copied(), cooldown, now) {
            debug!(key = %encoded, "Alert suppressed by cooldown");
            return false;
        }

        entries.insert(encoded, now.timestamp_millis());
        if let Err(e) = write_json_atomic(&self.path, &*entries).await {
            warn!(error = %e, "Failed to persist alert history");
        }
        true
    }

    /// All ledger entries, newest first.
    pub async fn history(&self) -> Vec<AlertHistoryEntry> {
        let entries = self.entries.lock().await;
        let mut history: Vec<AlertHistoryEntry> = entries
            .iter()
            .map(|(encoded, millis)| {
                let key = AlertKey::parse(encoded)
                    .unwrap_or_else(|| AlertKey::new(encoded.clone(), String::new()));
                AlertHistoryEntry {
                    key: encoded.clone(),
                    ip: key.address,
                    alert_type: key.class,
                    details: key.detail,
                    timestamp: Utc
                        .timestamp_millis_opt(*millis)
                        .single()
                        .unwrap_or_default(),
                }
            })
            .collect();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        history
    }
}

fn cooldown_elapsed(last_sent_ms: Option<i64>, cooldown: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = last_sent_ms else {
        return true;
    };
    let elapsed_ms = now.timestamp_millis().saturating_sub(last);
    let cooldown_ms = i64::try_from(cooldown.as_millis()).unwrap_or(i64::MAX);
    elapsed_ms >= cooldown_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINUTE: Duration = Duration::from_secs(60);

    async fn ledger(dir: &TempDir) -> AlertDeduplicator {
        AlertDeduplicator::load(dir.path().join("alert_history.json")).await
    }

    #[test]
    fn test_key_components_do_not_collide() {
        let a = AlertKey::new("10.0.0.1_x", "status").with_detail("");
        let b = AlertKey::new("10.0.0.1", "x_status").with_detail("");
        let c = AlertKey::new("10.0.0.1|x", "status");
        let d = AlertKey::new("10.0.0.1", "x|status");
        assert_ne!(a.to_string(), b.to_string());
        assert_ne!(c.to_string(), d.to_string());
    }

    #[test]
    fn test_key_parse_round_trips() {
        let key = AlertKey::new("10.0.0.1", STATUS_CHANGE).with_detail("fail|100%");
        assert_eq!(AlertKey::parse(&key.to_string()), Some(key));
        assert_eq!(AlertKey::parse("legacy_key_format"), None);
    }

    #[test]
    fn test_detail_defaults_to_empty() {
        let key = AlertKey::new("10.0.0.1", IO_ERROR_SKIP_HEALING);
        assert_eq!(key.detail, "");
        assert_eq!(key.to_string(), "10.0.0.1|io_error_skip_healing|");
    }

    #[tokio::test]
    async fn test_first_send_always_allowed() {
        let dir = TempDir::new().unwrap();
        let dedup = ledger(&dir).await;
        let key = AlertKey::new("10.0.0.1", STATUS_CHANGE).with_detail("fail");
        assert!(dedup.should_send(&key, Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn test_cooldown_window() {
        let dir = TempDir::new().unwrap();
        let dedup = ledger(&dir).await;
        let key = AlertKey::new("10.0.0.1", STATUS_CHANGE).with_detail("fail");
        let sent = Utc::now();

        dedup.record_sent_at(&key, sent).await.unwrap();

        assert!(!dedup.should_send_at(&key, MINUTE, sent).await);
        assert!(
            !dedup
                .should_send_at(&key, MINUTE, sent + chrono::Duration::seconds(59))
                .await
        );
        assert!(
            dedup
                .should_send_at(&key, MINUTE, sent + chrono::Duration::seconds(60))
                .await
        );
    }

    #[tokio::test]
    async fn test_zero_cooldown_always_allows() {
        let dir = TempDir::new().unwrap();
        let dedup = ledger(&dir).await;
        let key = AlertKey::new("10.0.0.1", STATUS_CHANGE);
        let now = Utc::now();
        dedup.record_sent_at(&key, now).await.unwrap();
        assert!(dedup.should_send_at(&key, Duration::ZERO, now).await);
    }

    #[tokio::test]
    async fn test_huge_cooldown_blocks_until_elapsed() {
        let dir = TempDir::new().unwrap();
        let dedup = ledger(&dir).await;
        let key = AlertKey::new("10.0.0.1", IO_ERROR_SKIP_HEALING);
        let now = Utc::now();
        let week = Duration::from_secs(7 * 24 * 3600);

        dedup.record_sent_at(&key, now).await.unwrap();
        assert!(
            !dedup
                .should_send_at(&key, week, now + chrono::Duration::days(6))
                .await
        );
        assert!(
            dedup
                .should_send_at(&key, week, now + chrono::Duration::days(7))
                .await
        );
        assert!(!dedup.should_send_at(&key, Duration::MAX, now).await);
    }

    #[tokio::test]
    async fn test_ledger_survives_restart() {
        let dir = TempDir::new().unwrap();
        let key = AlertKey::new("10.0.0.1", STATUS_CHANGE).with_detail("ok");
        {
            let dedup = ledger(&dir).await;
            dedup.record_sent(&key).await.unwrap();
        }

        let reloaded = ledger(&dir).await;
        assert!(!reloaded.should_send(&key, MINUTE).await);
        let history = reloaded.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].ip, "10.0.0.1");
        assert_eq!(history[0].alert_type, STATUS_CHANGE);
        assert_eq!(history[0].details, "ok");
    }

    #[tokio::test]
    async fn test_try_acquire_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let dedup = std::sync::Arc::new(ledger(&dir).await);
        let key = AlertKey::new("10.0.0.1", STATUS_CHANGE).with_detail("ok");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                let key = key.clone();
                tokio::spawn(async move { dedup.try_acquire(&key, MINUTE).await })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let dedup = ledger(&dir).await;
        let now = Utc::now();
        let older = AlertKey::new("10.0.0.1", STATUS_CHANGE).with_detail("fail");
        let newer = AlertKey::new("10.0.0.2", STATUS_CHANGE).with_detail("ok");

        dedup
            .record_sent_at(&older, now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        dedup.record_sent_at(&newer, now).await.unwrap();

        let history = dedup.history().await;
        assert_eq!(history[0].ip, "10.0.0.2");
        assert_eq!(history[1].ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_corrupt_ledger_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("alert_history.json"), "{broken").unwrap();
        let dedup = ledger(&dir).await;
        assert!(dedup.history().await.is_empty());
    }
}
