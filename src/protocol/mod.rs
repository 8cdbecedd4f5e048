//! IoT hub protocol conventions on top of MQTT
//!
//! Topic construction and classification plus the message types and their
//! property-bag encoding.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
