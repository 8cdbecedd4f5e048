//! Connection string parsing
//!
//! `HostName=...;DeviceId=...;[ModuleId=...;][GatewayHostName=...;]SharedAccessSignature=...`

use super::{ensure_fresh, AuthError, AuthenticationProvider, Credential, DeviceIdentity, SasToken};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

const HOST_NAME: &str = "HostName";
const DEVICE_ID: &str = "DeviceId";
const MODULE_ID: &str = "ModuleId";
const GATEWAY_HOST_NAME: &str = "GatewayHostName";
const SHARED_ACCESS_KEY: &str = "SharedAccessKey";
const SHARED_ACCESS_KEY_NAME: &str = "SharedAccessKeyName";
const SHARED_ACCESS_SIGNATURE: &str = "SharedAccessSignature";

const KNOWN_KEYS: [&str; 7] = [
    HOST_NAME,
    DEVICE_ID,
    MODULE_ID,
    GATEWAY_HOST_NAME,
    SHARED_ACCESS_KEY,
    SHARED_ACCESS_KEY_NAME,
    SHARED_ACCESS_SIGNATURE,
];

/// Split a connection string into its key/value pairs
fn parse_pairs(connection_string: &str) -> Result<HashMap<&str, &str>, AuthError> {
    let trimmed = connection_string.trim();
    if trimmed.is_empty() {
        return Err(AuthError::Empty);
    }

    let mut pairs = HashMap::new();
    for segment in trimmed.strip_suffix(';').unwrap_or(trimmed).split(';') {
        let (key, value) = segment.split_once('=').ok_or_else(|| {
            AuthError::Malformed(format!("segment '{}' is not key=value", segment.trim()))
        })?;
        let key = key.trim();
        if !KNOWN_KEYS.contains(&key) {
            return Err(AuthError::Malformed(format!("unknown key '{key}'")));
        }
        if pairs.insert(key, value.trim()).is_some() {
            return Err(AuthError::DuplicateField(key.to_string()));
        }
    }
    Ok(pairs)
}

fn required<'a>(pairs: &HashMap<&str, &'a str>, key: &'static str) -> Result<&'a str, AuthError> {
    match pairs.get(key) {
        Some(value) if !value.is_empty() => Ok(*value),
        _ => Err(AuthError::MissingField(key)),
    }
}

fn optional(pairs: &HashMap<&str, &str>, key: &str) -> Option<String> {
    pairs
        .get(key)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

/// Parse a device or module connection string into a credential
pub fn parse_connection_string(connection_string: &str) -> Result<Credential, AuthError> {
    let pairs = parse_pairs(connection_string)?;

    let identity = DeviceIdentity {
        hostname: required(&pairs, HOST_NAME)?.to_string(),
        device_id: required(&pairs, DEVICE_ID)?.to_string(),
        module_id: optional(&pairs, MODULE_ID),
        gateway_hostname: optional(&pairs, GATEWAY_HOST_NAME),
    };

    let token = match (
        optional(&pairs, SHARED_ACCESS_SIGNATURE),
        optional(&pairs, SHARED_ACCESS_KEY),
    ) {
        (Some(signature), _) => SasToken::parse(&signature)?,
        (None, Some(_)) => return Err(AuthError::SigningUnsupported),
        (None, None) => return Err(AuthError::MissingField(SHARED_ACCESS_SIGNATURE)),
    };

    debug!(
        hostname = %identity.hostname,
        client_id = %identity.client_id(),
        "Parsed connection string"
    );
    Ok(Credential::new(identity, token))
}

/// Provider built from a connection string carrying a shared access signature
#[derive(Debug)]
pub struct ConnectionStringProvider {
    current: RwLock<Credential>,
}

impl ConnectionStringProvider {
    pub fn new(connection_string: &str) -> Result<Self, AuthError> {
        Ok(Self {
            current: RwLock::new(parse_connection_string(connection_string)?),
        })
    }

    /// Swap in a new signature; the identity from the connection string is kept
    ///
    /// The token must be issued for the same hub and device (or module).
    pub fn renew(&self, sas: &str) -> Result<(), AuthError> {
        let token = SasToken::parse(sas)?;
        let target = token.identity()?;
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let identity = current.identity();
        if !target.hostname.eq_ignore_ascii_case(&identity.hostname)
            || target.client_id() != identity.client_id()
        {
            return Err(AuthError::Malformed(
                "renewed token targets a different device".to_string(),
            ));
        }
        let renewed = Credential::new(current.identity().clone(), token);
        info!(
            client_id = %renewed.identity().client_id(),
            expiry = ?renewed.expiry(),
            "Connection string signature renewed"
        );
        *current = renewed;
        Ok(())
    }
}

impl AuthenticationProvider for ConnectionStringProvider {
    fn get_credential(&self) -> Result<Credential, AuthError> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        ensure_fresh(current.clone())
    }

    fn identity(&self) -> DeviceIdentity {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        current.identity().clone()
    }
}
