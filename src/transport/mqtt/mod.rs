//! rumqttc implementation of the transport
//!
//! Split the same way as the rest of the transport code: pure functions
//! separate from I/O.
//!
//! - [`connection`] - option handling and link state
//! - [`message_handler`] - routing decisions for polled events
//! - [`client`] - the event loop task and the [`crate::transport::Transport`] impl

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, LinkState};
pub use message_handler::{EventRoute, MessageHandler};
