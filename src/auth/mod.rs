//! Authentication providers
//!
//! An [`AuthenticationProvider`] turns explicit configuration (a connection
//! string or a shared access signature) into a [`Credential`] that the
//! transport session uses to open a connection. Providers never read the
//! environment themselves; that stays with the caller.

pub mod connection_string;
pub mod sas;

pub use connection_string::ConnectionStringProvider;
pub use sas::{SasToken, SharedAccessSignatureProvider};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Credential construction and renewal errors
#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("Credential source is empty")]
    Empty,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Duplicate field: {0}")]
    DuplicateField(String),
    #[error("Malformed credential: {0}")]
    Malformed(String),
    #[error("Shared access key signing is not supported; provide a SharedAccessSignature")]
    SigningUnsupported,
    #[error("Credential expired at {expiry}")]
    Expired { expiry: DateTime<Utc> },
}

/// Identity of the device (or module) a credential authenticates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub gateway_hostname: Option<String>,
}

impl DeviceIdentity {
    pub fn new(hostname: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            module_id: None,
            gateway_hostname: None,
        }
    }

    pub fn with_module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    /// MQTT client identifier: `{device_id}` or `{device_id}/{module_id}`
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        }
    }

    /// Host the transport connects to; a configured gateway wins over the hub
    pub fn connect_host(&self) -> &str {
        match self.gateway_hostname.as_deref() {
            Some(gateway) if !gateway.is_empty() => gateway,
            _ => &self.hostname,
        }
    }
}

/// Authentication material for one connection attempt
///
/// Immutable once issued. Renewal replaces the whole value inside the
/// provider; sessions that already hold a credential keep using theirs.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    identity: DeviceIdentity,
    token: SasToken,
}

impl Credential {
    pub fn new(identity: DeviceIdentity, token: SasToken) -> Self {
        Self { identity, token }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The raw token, used as the MQTT password
    pub fn password(&self) -> &str {
        self.token.as_str()
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.token.expiry()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry().is_some_and(|expiry| expiry <= now)
    }

    /// True when the token expires within `margin` of `now`
    pub fn needs_renewal_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expiry().is_some_and(|expiry| expiry - margin <= now)
    }

    pub fn needs_renewal(&self, margin: Duration) -> bool {
        self.needs_renewal_at(Utc::now(), margin)
    }
}

/// Source of credentials for the transport session
///
/// `get_credential` is called on every connect, so a provider that has been
/// renewed hands out the fresh token on the next connection attempt.
pub trait AuthenticationProvider: Send + Sync {
    fn get_credential(&self) -> Result<Credential, AuthError>;

    /// Identity this provider authenticates, without checking expiry
    fn identity(&self) -> DeviceIdentity;
}

/// Reject credentials whose token has already expired
pub(crate) fn ensure_fresh(credential: Credential) -> Result<Credential, AuthError> {
    match credential.expiry() {
        Some(expiry) if credential.is_expired_at(Utc::now()) => Err(AuthError::Expired { expiry }),
        _ => Ok(credential),
    }
}
