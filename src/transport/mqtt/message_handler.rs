//! Pure routing decisions for rumqttc events
//!
//! The event loop task maps every polled event to an [`EventRoute`] and acts
//! on the route; nothing here performs I/O.

use crate::transport::RawDelivery;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// What the event loop should do with a polled event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    ConnectionRefused(String),
    MessageReceived(RawDelivery),
    SubscriptionConfirmed { packet_id: u16, failures: usize },
    /// The broker closed the connection
    Disconnected,
    /// Our own DISCONNECT went out; the loop is done
    DisconnectRequested,
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(format!("{code:?}")),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(RawDelivery {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                }),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    failures: suback
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectRequested,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}
