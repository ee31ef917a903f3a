//! Per-server heal log files.
//!
//! Each server gets `<dir>/<address with dots replaced by dashes>.log`; every
//! line is `[<rfc3339>] <message>`. Write failures are logged and swallowed.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Append-only heal history, one file per server.
#[derive(Debug, Clone)]
pub struct HealLog {
    dir: PathBuf,
}

impl HealLog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the log file for `address`.
    #[must_use]
    pub fn path_for(&self, address: &str) -> PathBuf {
        self.dir.join(format!("{}.log", address.replace('.', "-")))
    }

    /// Append one timestamped line for `address`.
    pub async fn append(&self, address: &str, message: &str) {
        info!(address = %address, "{message}");

        let path = self.path_for(address);
        let line = format!("[{}] {message}\n", Utc::now().to_rfc3339());
        if let Err(e) = append_line(&self.dir, &path, &line).await {
            warn!(path = %path.display(), error = %e, "Failed to write heal log");
        }
    }
}

async fn append_line(dir: &Path, path: &Path, line: &str) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_appends_timestamped_lines() {
        let dir = TempDir::new().unwrap();
        let log = HealLog::new(dir.path().join("heal_logs"));

        log.append("10.0.0.1", "FIRST-HEAL: PulseAudio restart - SUCCESS")
            .await;
        log.append("10.0.0.1", "FIRST-CONTAINER: PA container restart - FAILED")
            .await;

        let path = dir.path().join("heal_logs/10-0-0-1.log");
        assert_eq!(log.path_for("10.0.0.1"), path);

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] FIRST-HEAL: PulseAudio restart - SUCCESS"));
        assert!(lines[1].contains("FIRST-CONTAINER"));
    }

    #[tokio::test]
    async fn test_unwritable_dir_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let log = HealLog::new(blocker.join("heal_logs"));
        log.append("10.0.0.1", "ignored").await;
    }
}
