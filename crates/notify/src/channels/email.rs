//! SMTP email notification channel.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alert::Alert;
use crate::error::ChannelError;
use crate::NotifyChannel;

/// SMTP settings for the operator mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    /// Optional SMTP login; internal relays usually accept anonymous mail
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: String,
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: 25,
            username: None,
            password: None,
            from: "pa-monitoring@localhost".to_string(),
            to: "operator@localhost".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Email channel delivering HTML alerts to a fixed operator address.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailChannel {
    /// Create a channel from configuration.
    ///
    /// # Errors
    /// Returns an error if either mailbox cannot be parsed.
    pub fn new(config: &EmailConfig) -> Result<Self, ChannelError> {
        let from = parse_mailbox(&config.from)?;
        let to = parse_mailbox(&config.to)?;

        // Plain relay on the internal network; no STARTTLS negotiation.
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.smtp_host.as_str())
                .port(config.smtp_port)
                .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        debug!(
            host = %config.smtp_host,
            port = config.smtp_port,
            "Email channel configured"
        );

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    /// Build the MIME message for an alert.
    ///
    /// # Errors
    /// Returns an error if the message cannot be assembled.
    pub fn build_message(&self, alert: &Alert) -> Result<Message, ChannelError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(alert.full_subject())
            .header(ContentType::TEXT_HTML)
            .body(alert.render_html())?;
        Ok(message)
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, ChannelError> {
    address.parse().map_err(|source| ChannelError::Address {
        address: address.to_string(),
        source,
    })
}

#[async_trait]
impl NotifyChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, alert: &Alert) -> Result<String, ChannelError> {
        let message = self.build_message(alert)?;
        let response = self.transport.send(message).await?;
        Ok(format!("{}", response.code()))
    }

    async fn verify(&self) -> bool {
        match self.transport.test_connection().await {
            Ok(reachable) => reachable,
            Err(e) => {
                debug!(error = %e, "SMTP connection test failed");
                false
            }
        }
    }
}
