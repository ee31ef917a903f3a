//! Error types for the notification system.

use thiserror::Error;

/// Errors that can occur when sending notifications.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A configured mailbox could not be parsed
    #[error("Invalid mailbox '{address}': {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    /// The message could not be assembled
    #[error("Failed to build message: {0}")]
    Message(#[from] lettre::error::Error),

    /// SMTP transport failed
    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}
