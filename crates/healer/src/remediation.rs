//! Client for the per-server repair API.
//!
//! Each PA server exposes a small HTTP API on a fixed port:
//! - `POST /restart-pulse` restarts the audio subsystem
//! - `POST /save` rewrites the volume settings and restarts the PA container
//!
//! Calls are independent and never retried here; retry policy belongs to the
//! orchestrator.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Result of one repair call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub detail: String,
}

impl Outcome {
    #[must_use]
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// Tuning parameters re-applied by the container restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairParams {
    pub volume_normal: String,
    pub volume_call: String,
    pub call_audio_volume: String,
}

impl Default for RepairParams {
    fn default() -> Self {
        Self {
            volume_normal: "50".to_string(),
            volume_call: "30".to_string(),
            call_audio_volume: "70".to_string(),
        }
    }
}

impl RepairParams {
    /// Form fields in the shape the repair API expects.
    #[must_use]
    pub fn form_fields(&self) -> [(&'static str, &str); 3] {
        [
            ("VOLUME_NORMAL", self.volume_normal.as_str()),
            ("VOLUME_CALL", self.volume_call.as_str()),
            ("CALL_AUDIO_VOLUME", self.call_audio_volume.as_str()),
        ]
    }
}

/// Black-box remote repair actions for one server.
#[async_trait]
pub trait RemediationClient: Send + Sync {
    /// Restart the audio subsystem.
    async fn repair_audio(&self, address: &str) -> Outcome;

    /// Restart the PA container with the given tuning parameters.
    async fn repair_container(&self, address: &str, params: &RepairParams) -> Outcome;
}

/// Connection settings for [`HttpRemediationClient`].
#[derive(Debug, Clone)]
pub struct RemediationConfig {
    pub port: u16,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            connect_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
        }
    }
}

/// HTTP implementation of the repair API.
#[derive(Debug, Clone)]
pub struct HttpRemediationClient {
    client: reqwest::Client,
    port: u16,
}

impl HttpRemediationClient {
    /// Create a client with explicit connect and total timeouts.
    pub fn new(config: &RemediationConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()?;
        Ok(Self {
            client,
            port: config.port,
        })
    }

    fn url(&self, address: &str, endpoint: &str) -> String {
        format!("http://{address}:{}{endpoint}", self.port)
    }

    async fn post(&self, address: &str, endpoint: &str, form: Option<&[(&str, &str)]>) -> Outcome {
        let url = self.url(address, endpoint);
        debug!(url = %url, "Calling remote API");

        let mut request = self.client.post(&url);
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(address = %address, endpoint, error = %e, "Remote API call failed");
                return Outcome::failed(format!("API call failed: {e}"));
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            debug!(address = %address, endpoint, "Remote API call completed");
            if body.trim().is_empty() {
                Outcome::ok("Success (no response body)")
            } else {
                Outcome::ok(body)
            }
        } else {
            warn!(address = %address, endpoint, %status, "Remote API returned error status");
            Outcome::failed(format!("API call failed with status {status}: {body}"))
        }
    }
}

#[async_trait]
impl RemediationClient for HttpRemediationClient {
    async fn repair_audio(&self, address: &str) -> Outcome {
        self.post(address, "/restart-pulse", None).await
    }

    async fn repair_container(&self, address: &str, params: &RepairParams) -> Outcome {
        let fields = params.form_fields();
        self.post(address, "/save", Some(&fields)).await
    }
}
