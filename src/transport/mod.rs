//! Transport layer between the session and the broker
//!
//! The [`Transport`] trait is the seam the session drives: connect with a set
//! of parameters and an event sink, then subscribe, unsubscribe and publish on
//! plain topics. [`mqtt::MqttTransport`] implements it on top of `rumqttc`;
//! [`crate::testing::MockTransport`] stands in for the broker in tests.

use crate::auth::Credential;
use crate::config::MqttSection;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::MqttTransport;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// Everything a transport needs to open one authenticated connection
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl ConnectParams {
    /// Build hub connection parameters from a credential
    pub fn from_credential(credential: &Credential, config: &MqttSection) -> Self {
        let identity = credential.identity();
        let client_id = identity.client_id();
        Self {
            host: identity.connect_host().to_string(),
            port: config.port,
            username: format!(
                "{}/{}/?api-version={}",
                identity.hostname, client_id, config.api_version
            ),
            client_id,
            password: credential.password().to_string(),
        }
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A publish received from the broker, before any hub-specific decoding
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub topic: String,
    pub payload: Bytes,
}

/// Events a connected transport reports to its session, in receipt order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Delivery(RawDelivery),
    /// The established connection dropped without a local disconnect
    ConnectionLost(String),
}

/// Transport abstraction driven by the session
///
/// `connect` resolves once the broker has acknowledged the connection. From
/// then on the transport reports deliveries and connection loss on `events`,
/// and drops the sender when the connection ends for any reason. Subscribe
/// and publish resolve once the request has been accepted by the transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        params: ConnectParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Close the connection; a no-op when nothing is connected
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::connection_string::parse_connection_string;

    const SAS: &str = "SharedAccessSignature sr=hub%2Fdevices%2Fdev&sig=secret&se=4102444800";

    #[test]
    fn test_connect_params_for_device() {
        let credential = parse_connection_string(&format!(
            "HostName=hub.azure-devices.net;DeviceId=dev;SharedAccessSignature={SAS}"
        ))
        .unwrap();
        let params = ConnectParams::from_credential(&credential, &MqttSection::default());

        assert_eq!(params.host, "hub.azure-devices.net");
        assert_eq!(params.port, 8883);
        assert_eq!(params.client_id, "dev");
        assert_eq!(
            params.username,
            "hub.azure-devices.net/dev/?api-version=2018-06-30"
        );
        assert_eq!(params.password, SAS);
    }

    #[test]
    fn test_connect_params_for_module_behind_gateway() {
        let credential = parse_connection_string(&format!(
            "HostName=hub.azure-devices.net;DeviceId=edge;ModuleId=filter;GatewayHostName=gw.local;SharedAccessSignature={SAS}"
        ))
        .unwrap();
        let params = ConnectParams::from_credential(&credential, &MqttSection::default());

        assert_eq!(params.host, "gw.local");
        assert_eq!(params.client_id, "edge/filter");
        assert_eq!(
            params.username,
            "hub.azure-devices.net/edge/filter/?api-version=2018-06-30"
        );
    }

    #[test]
    fn test_debug_hides_password() {
        let credential = parse_connection_string(&format!(
            "HostName=hub;DeviceId=dev;SharedAccessSignature={SAS}"
        ))
        .unwrap();
        let params = ConnectParams::from_credential(&credential, &MqttSection::default());
        let debug = format!("{params:?}");

        assert!(!debug.contains("secret"));
        assert!(debug.contains("***"));
    }
}
