//! Pluggable component units
//!
//! - [`plugin`] - the [`Component`] trait, its context and the factory map
//! - [`manager`] - loaded instances and their run states
//! - [`dummy`] - the built-in demo component

pub mod dummy;
pub mod manager;
pub mod plugin;

pub use manager::{ComponentManager, ComponentState};
pub use plugin::{
    Component, ComponentContext, ComponentError, ComponentFactory, ComponentFactoryRegistry,
    ComponentPublisher, TransportPublisher,
};
