//! Testing utilities
//!
//! A mock transport for exercising the client without a broker.

pub mod mocks;

pub use mocks::*;
