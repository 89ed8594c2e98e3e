//! Testing utilities and mock implementations
//!
//! Mocks for exercising the agent without an MQTT broker, a package
//! manager or a service supervisor.

pub mod mocks;

pub use mocks::*;
