//! Durable fleet status.
//!
//! The status file is a JSON array of [`ServerRecord`]s. Every save rewrites
//! the whole document through a temporary file and a rename, so readers never
//! see a half-written file.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{HealerError, Result};
use crate::types::{FleetSnapshot, ServerRecord};

/// Authoritative mapping from server address to its record.
pub struct StatusStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StatusStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current fleet. A missing file is an empty fleet.
    ///
    /// Records still using the flat per-stage keys are migrated on read, so
    /// the next write drops them.
    pub async fn load(&self) -> Result<FleetSnapshot> {
        let mut servers: FleetSnapshot = read_json(&self.path).await?.unwrap_or_default();
        for record in &mut servers {
            if record.migrate_legacy_steps() {
                debug!(address = %record.address, "Migrated flat healing fields");
            }
        }
        Ok(servers)
    }

    /// Find a single server by address.
    pub async fn get(&self, address: &str) -> Result<Option<ServerRecord>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .find(|s| s.address == address))
    }

    /// Replace the persisted fleet with `servers`.
    pub async fn save(&self, servers: &[ServerRecord]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_json_atomic(&self.path, servers).await?;
        debug!(path = %self.path.display(), count = servers.len(), "Server status saved");
        Ok(())
    }

    /// Load, modify and rewrite the fleet as one step.
    pub async fn update<F>(&self, apply: F) -> Result<FleetSnapshot>
    where
        F: FnOnce(&mut FleetSnapshot) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut servers = self.load().await?;
        apply(&mut servers);
        write_json_atomic(&self.path, &servers).await?;
        Ok(servers)
    }

    /// Replace the record with the same address, appending it if absent.
    pub async fn upsert(&self, record: &ServerRecord) -> Result<()> {
        self.update(|servers| {
            match servers.iter_mut().find(|s| s.address == record.address) {
                Some(slot) => *slot = record.clone(),
                None => servers.push(record.clone()),
            }
        })
        .await?;
        Ok(())
    }
}

/// Combine a fresh scan with the previous fleet.
///
/// Scan order and scan-reported fields win; attempt history and the last heal
/// time are carried over for servers the scan did not annotate itself.
#[must_use]
pub fn merge_scan(previous: &[ServerRecord], scanned: FleetSnapshot) -> FleetSnapshot {
    scanned
        .into_iter()
        .map(|mut record| {
            match previous.iter().find(|p| p.address == record.address) {
                Some(prior) => {
                    if record.attempts.is_pristine() {
                        record.attempts = prior.attempts.clone();
                    }
                    if record.last_heal_time.is_none() {
                        record.last_heal_time = prior.last_heal_time;
                    }
                }
                None => {
                    info!(address = %record.address, name = %record.name, "Discovered new server");
                }
            }
            record
        })
        .collect()
}

/// Read a JSON document, returning `None` if the file does not exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| HealerError::json(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HealerError::io(path, e)),
    }
}

/// Pretty-print `value` to `path` via a sibling temp file and rename.
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).map_err(|e| HealerError::json(path, e))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| HealerError::io(parent, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, body)
        .await
        .map_err(|e| HealerError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| HealerError::io(path, e))?;
    Ok(())
}
