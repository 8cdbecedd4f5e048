//! Error types for the device client
//!
//! Each layer owns its error enum: [`crate::auth::AuthError`] for credentials,
//! [`crate::transport::TransportError`] for the protocol library, and
//! [`ClientError`] for everything surfaced by the session and the facade.

use crate::auth::AuthError;
use crate::feature::Feature;
use crate::session::ConnectionState;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for device client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        reason: String,
        #[source]
        source: Option<TransportError>,
    },

    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Subscription for feature '{feature}' failed: {reason}")]
    SubscriptionFailed { feature: Feature, reason: String },

    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] TransportError),

    #[error("Channel '{channel}' is full (capacity {capacity})")]
    Backpressure { channel: String, capacity: usize },

    #[error("Channel '{0}' is closed")]
    ChannelClosed(String),

    #[error("Channel '{0}' already has an active consumer")]
    ConsumerActive(String),

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),
}

impl ClientError {
    /// Create a connection error from a transport failure
    pub fn connection_failed(source: TransportError) -> Self {
        Self::ConnectionFailed {
            reason: sanitize_error_message(&source.to_string()),
            source: Some(source),
        }
    }

    /// Create a connection error without an underlying transport error
    pub fn connection_aborted<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a not-connected error for the given state
    pub fn not_connected(state: ConnectionState) -> Self {
        Self::NotConnected { state }
    }

    /// Create a subscription error for a feature
    pub fn subscription_failed<S: Into<String>>(feature: Feature, reason: S) -> Self {
        Self::SubscriptionFailed {
            feature,
            reason: sanitize_error_message(&reason.into()),
        }
    }

    /// Whether the caller may reasonably retry the operation with a fresh credential
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::Backpressure { .. })
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(sig|sharedaccesskey|password|token)=[^&;\s]+").expect("valid secret pattern")
});

static SIGNATURE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"SharedAccessSignature\s+sr=\S+").expect("valid signature pattern")
});

const MAX_ERROR_LEN: usize = 500;

/// Redact credential material from text that is about to be logged or surfaced
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SIGNATURE_PATTERN
        .replace_all(message, "SharedAccessSignature ***")
        .to_string();
    sanitized = SECRET_PATTERN
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for device client operations
pub type ClientResult<T> = Result<T, ClientError>;
