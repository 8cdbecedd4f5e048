//! Observability for the device client
//!
//! Structured logging only; the client exposes connection state through its
//! own observer API rather than a metrics endpoint.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{mqtt_span, session_span};
