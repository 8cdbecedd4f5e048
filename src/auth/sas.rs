//! Shared access signature tokens
//!
//! Tokens look like `SharedAccessSignature sr={uri}&sig={sig}&se={expiry}[&skn={policy}]`.
//! The fields are url-encoded; `se` is an expiry in unix seconds.

use super::{ensure_fresh, AuthError, AuthenticationProvider, Credential, DeviceIdentity};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::RwLock;
use tracing::info;

const SAS_PREFIX: &str = "SharedAccessSignature ";

/// A parsed, still-opaque shared access signature
#[derive(Debug, Clone, PartialEq)]
pub struct SasToken {
    raw: String,
    resource_uri: String,
    expiry: Option<DateTime<Utc>>,
}

impl SasToken {
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AuthError::Empty);
        }
        let fields = raw.strip_prefix(SAS_PREFIX).ok_or_else(|| {
            AuthError::Malformed("token must start with 'SharedAccessSignature '".to_string())
        })?;

        let mut resource_uri = None;
        let mut signature = None;
        let mut expiry = None;
        for (key, value) in url::form_urlencoded::parse(fields.as_bytes()) {
            let slot = match &*key {
                "sr" => &mut resource_uri,
                "sig" => &mut signature,
                "se" => &mut expiry,
                "skn" => continue,
                other => {
                    return Err(AuthError::Malformed(format!(
                        "unexpected token field '{other}'"
                    )))
                }
            };
            if slot.replace(value.into_owned()).is_some() {
                return Err(AuthError::DuplicateField(key.into_owned()));
            }
        }

        let resource_uri = resource_uri.ok_or(AuthError::MissingField("sr"))?;
        if signature.as_deref().map_or(true, str::is_empty) {
            return Err(AuthError::MissingField("sig"));
        }
        let expiry = expiry.map(|se| parse_expiry(&se)).transpose()?;

        Ok(Self {
            raw: raw.to_string(),
            resource_uri,
            expiry,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The url-decoded `sr` field
    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    /// Derive the device identity from `{host}/devices/{device}[/modules/{module}]`
    pub fn identity(&self) -> Result<DeviceIdentity, AuthError> {
        let parts: Vec<&str> = self.resource_uri.split('/').collect();
        match parts.as_slice() {
            [host, "devices", device] if !host.is_empty() && !device.is_empty() => {
                Ok(DeviceIdentity::new(*host, *device))
            }
            [host, "devices", device, "modules", module]
                if !host.is_empty() && !device.is_empty() && !module.is_empty() =>
            {
                Ok(DeviceIdentity::new(*host, *device).with_module(*module))
            }
            _ => Err(AuthError::Malformed(format!(
                "resource uri '{}' does not name a device",
                self.resource_uri
            ))),
        }
    }
}

fn parse_expiry(se: &str) -> Result<DateTime<Utc>, AuthError> {
    let seconds: i64 = se
        .parse()
        .map_err(|_| AuthError::Malformed(format!("expiry '{se}' is not a unix timestamp")))?;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| AuthError::Malformed(format!("expiry '{se}' is out of range")))
}

/// Provider backed by a pre-generated shared access signature
#[derive(Debug)]
pub struct SharedAccessSignatureProvider {
    current: RwLock<Credential>,
}

impl SharedAccessSignatureProvider {
    pub fn new(sas: &str) -> Result<Self, AuthError> {
        Ok(Self {
            current: RwLock::new(Self::credential_from(sas)?),
        })
    }

    fn credential_from(sas: &str) -> Result<Credential, AuthError> {
        let token = SasToken::parse(sas)?;
        let identity = token.identity()?;
        Ok(Credential::new(identity, token))
    }

    /// Replace the current credential with a freshly issued token for the same device
    pub fn renew(&self, sas: &str) -> Result<(), AuthError> {
        let renewed = Self::credential_from(sas)?;
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if renewed.identity() != current.identity() {
            return Err(AuthError::Malformed(
                "renewed token targets a different device".to_string(),
            ));
        }
        info!(
            device_id = %renewed.identity().device_id,
            expiry = ?renewed.expiry(),
            "Shared access signature renewed"
        );
        *current = renewed;
        Ok(())
    }
}

impl AuthenticationProvider for SharedAccessSignatureProvider {
    fn get_credential(&self) -> Result<Credential, AuthError> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        ensure_fresh(current.clone())
    }

    fn identity(&self) -> DeviceIdentity {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        current.identity().clone()
    }
}
