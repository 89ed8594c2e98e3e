//! Durable agent state
//!
//! Both documents on disk (component registry and runtime config) share the
//! same write discipline from [`atomic`].

pub mod atomic;
pub mod config_store;
pub mod registry;

pub use config_store::{ConfigSetOutcome, ConfigStore, ConfigStoreError, TelemetrySettings};
pub use registry::{ComponentRecord, Registry, RegistryError, RegistryMap, ReleaseSource};
