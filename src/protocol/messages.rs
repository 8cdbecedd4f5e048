//! Message types exchanged with the hub
//!
//! The hub carries message properties in the topic's property bag as
//! url-encoded `key=value` pairs. Keys starting with `$.` are system
//! properties; everything else is a custom property.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;

const MESSAGE_ID: &str = "$.mid";
const CORRELATION_ID: &str = "$.cid";
const USER_ID: &str = "$.uid";
const TO: &str = "$.to";
const CONTENT_TYPE: &str = "$.ct";
const CONTENT_ENCODING: &str = "$.ce";
const EXPIRY: &str = "$.exp";
const OUTPUT_NAME: &str = "$.on";

/// A message delivered by the hub to this device
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct InboundMessage {
    pub payload: Bytes,
    pub custom_properties: HashMap<String, String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub to: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Set for module input messages
    pub input_name: Option<String>,
}

impl InboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Build a message from a payload and the topic's property bag
    pub fn from_property_bag(payload: impl Into<Bytes>, property_bag: &str) -> Self {
        let mut message = Self::new(payload);
        for (key, value) in url::form_urlencoded::parse(property_bag.as_bytes()) {
            let value = value.into_owned();
            match key.as_ref() {
                MESSAGE_ID => message.message_id = Some(value),
                CORRELATION_ID => message.correlation_id = Some(value),
                USER_ID => message.user_id = Some(value),
                TO => message.to = Some(value),
                CONTENT_TYPE => message.content_type = Some(value),
                CONTENT_ENCODING => message.content_encoding = Some(value),
                _ => {
                    message.custom_properties.insert(key.into_owned(), value);
                }
            }
        }
        message
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn data_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A device-to-cloud telemetry message
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub custom_properties: HashMap<String, String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub to: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub expiry_time_utc: Option<DateTime<Utc>>,
    /// Module output the message is sent on
    pub output_name: Option<String>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Append the url-encoded property bag to a telemetry topic prefix
    ///
    /// System properties come first in a fixed order, custom properties
    /// follow sorted by key so the topic is deterministic.
    pub fn encode_topic(&self, telemetry_topic: &str) -> String {
        let system = [
            (OUTPUT_NAME, self.output_name.clone()),
            (MESSAGE_ID, self.message_id.clone()),
            (CORRELATION_ID, self.correlation_id.clone()),
            (USER_ID, self.user_id.clone()),
            (TO, self.to.clone()),
            (CONTENT_TYPE, self.content_type.clone()),
            (CONTENT_ENCODING, self.content_encoding.clone()),
            (EXPIRY, self.expiry_time_utc.map(|expiry| expiry.to_rfc3339())),
        ];

        let mut custom: Vec<_> = self.custom_properties.iter().collect();
        custom.sort();

        let mut bag = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in system.iter().filter_map(|(k, v)| v.as_ref().map(|v| (k, v))) {
            bag.append_pair(key, value);
        }
        for (key, value) in custom {
            bag.append_pair(key, value);
        }

        format!("{telemetry_topic}{}", bag.finish())
    }
}
