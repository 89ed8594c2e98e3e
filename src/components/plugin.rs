//! Component plugin model
//!
//! Components are compiled into the agent and registered in a static
//! factory map keyed by entrypoint string (`module.path:ClassName`). An
//! installed registry record is loadable when its entrypoint is a key of
//! that map.

use crate::protocol::topics::TopicSchema;
use crate::transport::{Delivery, Transport};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Minimal publish surface handed to components
#[async_trait]
pub trait ComponentPublisher: Send + Sync {
    async fn publish_json(&self, topic: &str, payload: &Value, retain: bool) -> Result<(), String>;
}

/// [`ComponentPublisher`] backed by the agent's transport, QoS 1
pub struct TransportPublisher<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> TransportPublisher<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: Transport + 'static> ComponentPublisher for TransportPublisher<T> {
    async fn publish_json(&self, topic: &str, payload: &Value, retain: bool) -> Result<(), String> {
        let bytes = serde_json::to_vec(payload).map_err(|e| e.to_string())?;
        self.transport
            .publish(topic, bytes, retain, Delivery::AtLeastOnce)
            .await
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("component not found: {0}")]
    NotFound(String),
    #[error("entrypoint not importable: {0}")]
    UnknownEntrypoint(String),
    #[error("component {component_id} is {state}")]
    Transitional {
        component_id: String,
        state: String,
    },
    #[error("component {component_id} does not support action {action}")]
    UnsupportedAction {
        component_id: String,
        action: String,
    },
    #[error("component {component_id} is not running")]
    NotRunning { component_id: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Failed(String),
}

/// Runtime handed to each component instance
#[derive(Clone)]
pub struct ComponentContext {
    component_id: String,
    topics: TopicSchema,
    publisher: Arc<dyn ComponentPublisher>,
}

impl fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentContext")
            .field("component_id", &self.component_id)
            .field("agent_id", &self.topics.agent_id())
            .finish_non_exhaustive()
    }
}

impl ComponentContext {
    pub fn new(
        component_id: impl Into<String>,
        topics: TopicSchema,
        publisher: Arc<dyn ComponentPublisher>,
    ) -> Self {
        Self {
            component_id: component_id.into(),
            topics,
            publisher,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn agent_id(&self) -> &str {
        self.topics.agent_id()
    }

    pub fn topics(&self) -> &TopicSchema {
        &self.topics
    }

    /// Retained `components/<cid>/state`
    pub async fn publish_state(&self, state: &Value) -> Result<(), ComponentError> {
        let topic = self
            .topics
            .component_state(&self.component_id)
            .map_err(|e| ComponentError::Failed(e.to_string()))?;
        self.publisher
            .publish_json(&topic, state, true)
            .await
            .map_err(ComponentError::Failed)
    }

    /// Retained `components/<cid>/cfg`
    pub async fn publish_cfg(&self, cfg: &Value) -> Result<(), ComponentError> {
        let topic = self
            .topics
            .component_cfg(&self.component_id)
            .map_err(|e| ComponentError::Failed(e.to_string()))?;
        self.publisher
            .publish_json(&topic, cfg, true)
            .await
            .map_err(ComponentError::Failed)
    }
}

/// A pluggable unit managed by the agent
#[async_trait]
pub trait Component: Send + Sync {
    fn component_id(&self) -> &str;

    /// Actions exposed as `components/<cid>/cmd/<action>`
    fn capabilities(&self) -> Vec<String>;

    async fn start(&self) -> Result<(), ComponentError>;

    async fn stop(&self) -> Result<(), ComponentError>;

    /// Returns operation-specific result fields
    async fn handle_command(
        &self,
        action: &str,
        payload: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ComponentError>;
}

pub type ComponentFactory = Arc<dyn Fn(ComponentContext) -> Arc<dyn Component> + Send + Sync>;

/// Static entrypoint → constructor map
#[derive(Clone, Default)]
pub struct ComponentFactoryRegistry {
    factories: HashMap<String, ComponentFactory>,
}

impl fmt::Debug for ComponentFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentFactoryRegistry")
            .field("entrypoints", &self.entrypoints())
            .finish()
    }
}

impl ComponentFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every component compiled into this build
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(super::dummy::ENTRYPOINT, |ctx| {
            Arc::new(super::dummy::DummyComponent::new(ctx))
        });
        registry
    }

    pub fn register<F>(&mut self, entrypoint: &str, factory: F)
    where
        F: Fn(ComponentContext) -> Arc<dyn Component> + Send + Sync + 'static,
    {
        self.factories
            .insert(entrypoint.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, entrypoint: &str) -> bool {
        self.factories.contains_key(entrypoint)
    }

    pub fn create(&self, entrypoint: &str, ctx: ComponentContext) -> Option<Arc<dyn Component>> {
        self.factories.get(entrypoint).map(|factory| factory(ctx))
    }

    pub fn entrypoints(&self) -> Vec<String> {
        let mut entrypoints: Vec<String> = self.factories.keys().cloned().collect();
        entrypoints.sort();
        entrypoints
    }
}
