//! IoT hub MQTT topic layout
//!
//! Subscriptions, telemetry topics and the classification of inbound
//! publishes all derive from the device identity:
//!
//! - c2d: `devices/{device}/messages/devicebound/{property_bag}`
//! - module input: `devices/{device}/modules/{module}/inputs/{input}/{property_bag}`
//! - telemetry: `devices/{device}[/modules/{module}]/messages/events/{property_bag}`

use crate::auth::DeviceIdentity;

/// Topic construction for one device or module identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    base: String,
    has_module: bool,
}

impl TopicBuilder {
    pub fn new(identity: &DeviceIdentity) -> Self {
        let base = match &identity.module_id {
            Some(module_id) => format!("devices/{}/modules/{}", identity.device_id, module_id),
            None => format!("devices/{}", identity.device_id),
        };
        Self {
            base,
            has_module: identity.module_id.is_some(),
        }
    }

    /// `devices/{device}[/modules/{module}]`
    pub fn base_topic(&self) -> &str {
        &self.base
    }

    /// Subscription filter for cloud-to-device messages
    pub fn c2d_subscription(&self) -> String {
        format!("{}/messages/devicebound/#", self.base)
    }

    /// Subscription filter for module input messages; devices have no inputs
    pub fn input_subscription(&self) -> Option<String> {
        self.has_module.then(|| format!("{}/inputs/#", self.base))
    }

    /// Telemetry topic prefix; encoded properties are appended directly
    pub fn telemetry_topic(&self) -> String {
        format!("{}/messages/events/", self.base)
    }

    /// Classify an inbound publish topic
    ///
    /// Only topics under this identity's base are recognised; deliveries
    /// addressed to any other device or module are `Unknown`.
    pub fn classify(&self, topic: &str) -> TopicKind {
        let rest = match topic
            .strip_prefix(self.base.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            Some(rest) => rest,
            None => return TopicKind::Unknown,
        };

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            ["inputs", input_name, bag @ ..] if self.has_module && !input_name.is_empty() => {
                TopicKind::Input {
                    input_name: (*input_name).to_string(),
                    property_bag: bag.join("/"),
                }
            }
            ["messages", "devicebound", bag @ ..] => TopicKind::CloudToDevice {
                property_bag: bag.join("/"),
            },
            _ => TopicKind::Unknown,
        }
    }
}

/// What kind of delivery an inbound topic carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    CloudToDevice { property_bag: String },
    Input { input_name: String, property_bag: String },
    Unknown,
}
