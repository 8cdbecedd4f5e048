//! Pure connection configuration for the MQTT transport
//!
//! Turns [`ConnectParams`] plus the `[mqtt]` config section into rumqttc
//! options, and defines the link state the event loop reports while a
//! connection attempt is pending.

use crate::config::MqttSection;
use crate::transport::{ConnectParams, TransportError};
use rumqttc::{MqttOptions, Transport as RumqttcTransport};

/// State of the underlying MQTT link as seen by the event loop task
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Waiting for ConnAck
    Connecting,
    Connected,
    /// Link is gone, with the reason
    Disconnected(String),
}

/// Pure function to configure MQTT options for one connection attempt
pub fn configure_mqtt_options(
    params: &ConnectParams,
    config: &MqttSection,
) -> Result<MqttOptions, TransportError> {
    // rumqttc panics on these, so reject them up front
    if params.client_id.is_empty() || params.client_id.starts_with(' ') {
        return Err(TransportError::ConnectionFailed(format!(
            "invalid client id '{}'",
            params.client_id
        )));
    }
    if params.host.is_empty() {
        return Err(TransportError::ConnectionFailed(
            "host must not be empty".to_string(),
        ));
    }

    let mut mqtt_options = MqttOptions::new(&params.client_id, &params.host, params.port);

    if config.use_tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options.set_credentials(&params.username, &params.password);
    mqtt_options.set_keep_alive(config.keep_alive());
    mqtt_options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

    // Subscriptions are tracked per session; a fresh broker session keeps the
    // hub from pushing deliveries for features that are not enabled yet
    mqtt_options.set_clean_session(true);

    Ok(mqtt_options)
}
