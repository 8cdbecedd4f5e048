//! IoT Hub device client
//!
//! A session-managed MQTT client that authenticates a device (or module) to an
//! IoT hub and hands cloud-to-device messages to the application through
//! explicit, closable channels.
//!
//! # Overview
//!
//! - [`auth`]: credential providers for connection strings and shared access signatures
//! - [`session`]: one authenticated connection and its state machine
//! - [`feature`]: opt-in message classes and the registry tracking them
//! - [`channel`]: single-consumer message queues with end-of-stream
//! - [`client`]: the [`DeviceClient`] facade tying them together
//! - [`transport`]: the MQTT transport over `rumqttc`
//!
//! # Quick Start
//!
//! ```rust
//! use iothub_device::protocol::{InboundMessage, OutboundMessage};
//!
//! // Cloud-to-device properties arrive url-encoded on the topic
//! let message = InboundMessage::from_property_bag("hello", "%24.mid=42&k=v");
//! assert_eq!(message.message_id.as_deref(), Some("42"));
//! assert_eq!(message.custom_properties["k"], "v");
//!
//! // Telemetry properties travel the same way
//! let event = OutboundMessage::new("23.5").with_property("unit", "C");
//! assert_eq!(
//!     event.encode_topic("devices/dev/messages/events/"),
//!     "devices/dev/messages/events/unit=C"
//! );
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod feature;
pub mod inbox;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use auth::{
    AuthError, AuthenticationProvider, ConnectionStringProvider, Credential, DeviceIdentity,
    SharedAccessSignatureProvider,
};
pub use channel::{ChannelPolicy, MessageChannel, MessageStream};
pub use client::DeviceClient;
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, ClientResult};
pub use feature::Feature;
pub use protocol::{InboundMessage, OutboundMessage};
pub use session::ConnectionState;
pub use transport::{MqttTransport, Transport, TransportError};
