//! Operator alert delivery for the PA monitoring platform.
//!
//! Alerts are rendered as HTML and delivered by email to a fixed operator
//! address. Delivery is never retried and never fails loudly: callers always
//! get a [`DeliveryReport`] back, so a broken mail relay cannot abort a
//! healing cycle.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{Alert, EmailConfig, Notifier};
//!
//! # async fn run() {
//! let notifier = Notifier::from_email_config(&EmailConfig::default());
//! let report = notifier
//!     .notify(Alert::new("Server Failure: pa-01", "pa-01 is now FAILING"))
//!     .await;
//! if !report.success {
//!     eprintln!("alert not delivered: {:?}", report.error);
//! }
//! # }
//! ```
//!
//! # Configuration
//!
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alert;
pub mod channels;
pub mod error;

pub use alert::{Alert, ServerContext, Severity};
pub use channels::email::{EmailChannel, EmailConfig};
pub use channels::NotifyChannel;
pub use error::ChannelError;

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Outcome of a single [`Notifier::notify`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryReport {
    fn delivered(receipt: String) -> Self {
        Self {
            success: true,
            receipt: Some(receipt),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            receipt: None,
            error: Some(error.into()),
        }
    }
}

/// Central notification dispatcher.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Create a notifier that delivers by email.
    ///
    /// An invalid email configuration is logged and yields a notifier with
    /// no channels; every send then reports failure.
    #[must_use]
    pub fn from_email_config(config: &EmailConfig) -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        match EmailChannel::new(config) {
            Ok(channel) => {
                info!(
                    smtp_host = %config.smtp_host,
                    smtp_port = config.smtp_port,
                    "Email notifications enabled"
                );
                Self::with_channels(vec![Arc::new(channel)])
            }
            Err(e) => {
                warn!(error = %e, "Email channel misconfigured, alerts will not be delivered");
                Self::with_channels(vec![])
            }
        }
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Check every enabled channel against its backend.
    ///
    /// Returns true only if at least one channel is configured and all of
    /// them respond. Each unreachable channel is logged.
    pub async fn verify_channels(&self) -> bool {
        if !self.has_channels() {
            warn!("No notification channels configured, alerts will not be delivered");
            return false;
        }

        let mut all_ok = true;
        for channel in self.channels.iter().filter(|c| c.enabled()) {
            if channel.verify().await {
                info!(channel = channel.name(), "Notification channel ready");
            } else {
                warn!(channel = channel.name(), "Notification channel unreachable");
                all_ok = false;
            }
        }
        all_ok
    }

    /// Deliver an alert to every enabled channel and wait for the result.
    ///
    /// The report is successful only if every enabled channel accepted the
    /// alert. Errors are logged and folded into the report, never returned.
    pub async fn notify(&self, alert: Alert) -> DeliveryReport {
        if self.disabled {
            debug!(subject = %alert.subject, "Notifications disabled, skipping alert");
            return DeliveryReport::failed("notifications disabled");
        }

        let mut receipts = Vec::new();
        let mut errors = Vec::new();

        for channel in &self.channels {
            let channel_name = channel.name();
            if !channel.enabled() {
                debug!(channel = channel_name, "Channel disabled, skipping");
                continue;
            }

            match channel.send(&alert).await {
                Ok(receipt) => {
                    info!(
                        channel = channel_name,
                        subject = %alert.subject,
                        severity = alert.severity().as_str(),
                        "Alert sent"
                    );
                    receipts.push(receipt);
                }
                Err(e) => {
                    error!(
                        channel = channel_name,
                        subject = %alert.subject,
                        error = %e,
                        "Failed to send alert"
                    );
                    errors.push(format!("{channel_name}: {e}"));
                }
            }
        }

        if !errors.is_empty() {
            DeliveryReport::failed(errors.join("; "))
        } else if receipts.is_empty() {
            warn!(subject = %alert.subject, "No notification channels configured");
            DeliveryReport::failed("no notification channels configured")
        } else {
            DeliveryReport::delivered(receipts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingChannel {
        fail: bool,
        sent: Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NotifyChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn verify(&self) -> bool {
            !self.fail
        }

        async fn send(&self, alert: &Alert) -> Result<String, ChannelError> {
            self.sent.lock().unwrap().push(alert.subject.clone());
            if self.fail {
                Err(ChannelError::Other("relay refused".to_string()))
            } else {
                Ok("250".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_disabled_notifier() {
        let notifier = Notifier::disabled();
        assert!(!notifier.has_channels());
        assert!(!notifier.verify_channels().await);
    }

    #[tokio::test]
    async fn test_verify_channels_reports_unreachable_backend() {
        let healthy =
            Notifier::with_channels(vec![RecordingChannel::new(false) as Arc<dyn NotifyChannel>]);
        assert!(healthy.verify_channels().await);

        let broken = Notifier::with_channels(vec![
            RecordingChannel::new(false) as Arc<dyn NotifyChannel>,
            RecordingChannel::new(true) as Arc<dyn NotifyChannel>,
        ]);
        assert!(!broken.verify_channels().await);
    }

    #[tokio::test]
    async fn test_notify_reports_success() {
        let channel = RecordingChannel::new(false);
        let notifier = Notifier::with_channels(vec![channel.clone() as Arc<dyn NotifyChannel>]);

        let report = notifier.notify(Alert::new("Test Alert", "body")).await;

        assert!(report.success);
        assert_eq!(report.receipt.as_deref(), Some("250"));
        assert_eq!(channel.sent.lock().unwrap().as_slice(), ["Test Alert"]);
    }

    #[tokio::test]
    async fn test_notify_folds_failure_into_report() {
        let channel = RecordingChannel::new(true);
        let notifier = Notifier::with_channels(vec![channel.clone() as Arc<dyn NotifyChannel>]);

        let report = notifier.notify(Alert::new("Test Alert", "body")).await;

        assert!(!report.success);
        assert!(report.error.unwrap().contains("relay refused"));
        // No retry of the send itself
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notify_without_channels_fails() {
        let notifier = Notifier::with_channels(vec![]);
        let report = notifier.notify(Alert::new("Test Alert", "body")).await;
        assert!(!report.success);
    }
}
