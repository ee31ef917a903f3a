//! Notification channel implementations.

pub mod email;

use async_trait::async_trait;

use crate::alert::Alert;
use crate::error::ChannelError;

/// Trait for notification channels.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Deliver an alert, returning a channel-specific receipt on success.
    async fn send(&self, alert: &Alert) -> Result<String, ChannelError>;

    /// Check that the channel can reach its backend.
    async fn verify(&self) -> bool {
        true
    }
}
