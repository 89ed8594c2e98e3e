//! In-process component instances and their run states

use super::plugin::{
    Component, ComponentContext, ComponentError, ComponentFactoryRegistry, ComponentPublisher,
};
use crate::protocol::topics::TopicSchema;
use crate::storage::registry::RegistryMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ComponentState {
    pub fn is_transitional(self) -> bool {
        matches!(self, ComponentState::Starting | ComponentState::Stopping)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentState::Stopped => "stopped",
            ComponentState::Starting => "starting",
            ComponentState::Running => "running",
            ComponentState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct ManagedComponent {
    instance: Arc<dyn Component>,
    state: ComponentState,
}

/// Owns every loaded component instance
pub struct ComponentManager {
    factories: Arc<ComponentFactoryRegistry>,
    topics: TopicSchema,
    publisher: Arc<dyn ComponentPublisher>,
    components: RwLock<BTreeMap<String, ManagedComponent>>,
}

impl fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentManager")
            .field("factories", &self.factories)
            .finish_non_exhaustive()
    }
}

impl ComponentManager {
    pub fn new(
        factories: Arc<ComponentFactoryRegistry>,
        topics: TopicSchema,
        publisher: Arc<dyn ComponentPublisher>,
    ) -> Self {
        Self {
            factories,
            topics,
            publisher,
            components: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn factories(&self) -> &ComponentFactoryRegistry {
        &self.factories
    }

    /// Start every enabled, importable registry entry. One failing component
    /// never prevents the others from loading.
    pub async fn load_all(&self, registry: &RegistryMap) -> Vec<String> {
        let mut started = Vec::new();
        for (component_id, record) in registry {
            if !record.enabled {
                info!(component_id = %component_id, "Component disabled, not loading");
                continue;
            }
            match self.start(component_id, &record.entrypoint).await {
                Ok(()) => started.push(component_id.clone()),
                Err(e) => error!(component_id = %component_id, error = %e, "Failed to load component"),
            }
        }
        info!(count = started.len(), "Components loaded");
        started
    }

    fn instantiate(
        &self,
        component_id: &str,
        entrypoint: &str,
    ) -> Result<Arc<dyn Component>, ComponentError> {
        let ctx = ComponentContext::new(component_id, self.topics.clone(), self.publisher.clone());
        self.factories
            .create(entrypoint, ctx)
            .ok_or_else(|| ComponentError::UnknownEntrypoint(entrypoint.to_string()))
    }

    pub async fn state_of(&self, component_id: &str) -> Option<ComponentState> {
        self.components
            .read()
            .await
            .get(component_id)
            .map(|managed| managed.state)
    }

    pub async fn is_transitional(&self, component_id: &str) -> bool {
        self.state_of(component_id)
            .await
            .is_some_and(ComponentState::is_transitional)
    }

    pub async fn running_ids(&self) -> BTreeSet<String> {
        self.components
            .read()
            .await
            .iter()
            .filter(|(_, managed)| managed.state == ComponentState::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Capabilities of a loaded instance
    pub async fn capabilities(&self, component_id: &str) -> Option<Vec<String>> {
        self.components
            .read()
            .await
            .get(component_id)
            .map(|managed| managed.instance.capabilities())
    }

    /// Every loaded instance with its capabilities
    pub async fn loaded(&self) -> Vec<(String, Vec<String>)> {
        self.components
            .read()
            .await
            .iter()
            .map(|(id, managed)| (id.clone(), managed.instance.capabilities()))
            .collect()
    }

    /// Start a component, instantiating it from the factory map if needed.
    /// Starting a running component is a no-op.
    pub async fn start(&self, component_id: &str, entrypoint: &str) -> Result<(), ComponentError> {
        let instance = {
            let mut components = self.components.write().await;
            match components.get_mut(component_id) {
                Some(managed) if managed.state == ComponentState::Running => return Ok(()),
                Some(managed) if managed.state.is_transitional() => {
                    return Err(ComponentError::Transitional {
                        component_id: component_id.to_string(),
                        state: managed.state.to_string(),
                    })
                }
                Some(managed) => {
                    managed.state = ComponentState::Starting;
                    managed.instance.clone()
                }
                None => {
                    let instance = self.instantiate(component_id, entrypoint)?;
                    components.insert(
                        component_id.to_string(),
                        ManagedComponent {
                            instance: instance.clone(),
                            state: ComponentState::Starting,
                        },
                    );
                    instance
                }
            }
        };

        let outcome = instance.start().await;
        let next = if outcome.is_ok() {
            ComponentState::Running
        } else {
            ComponentState::Stopped
        };
        self.set_state(component_id, next).await;
        match &outcome {
            Ok(()) => info!(component_id, "Component started"),
            Err(e) => warn!(component_id, error = %e, "Component failed to start"),
        }
        outcome
    }

    /// Stop a running component. Stopping an absent or stopped one is a no-op.
    pub async fn stop(&self, component_id: &str) -> Result<(), ComponentError> {
        let instance = {
            let mut components = self.components.write().await;
            match components.get_mut(component_id) {
                None => return Ok(()),
                Some(managed) if managed.state == ComponentState::Stopped => return Ok(()),
                Some(managed) if managed.state.is_transitional() => {
                    return Err(ComponentError::Transitional {
                        component_id: component_id.to_string(),
                        state: managed.state.to_string(),
                    })
                }
                Some(managed) => {
                    managed.state = ComponentState::Stopping;
                    managed.instance.clone()
                }
            }
        };

        let outcome = instance.stop().await;
        // a failed stop still leaves the instance unusable
        self.set_state(component_id, ComponentState::Stopped).await;
        match &outcome {
            Ok(()) => info!(component_id, "Component stopped"),
            Err(e) => warn!(component_id, error = %e, "Component stop reported an error"),
        }
        outcome
    }

    /// Stop and forget an instance so a later start builds a fresh one.
    /// A transitional instance is left in place.
    pub async fn unload(&self, component_id: &str) -> Result<(), ComponentError> {
        let outcome = self.stop(component_id).await;
        if matches!(outcome, Err(ComponentError::Transitional { .. })) {
            return outcome;
        }
        if self.components.write().await.remove(component_id).is_some() {
            info!(component_id, "Component unloaded");
        }
        outcome
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.running_ids().await.into_iter().collect();
        for component_id in ids {
            if let Err(e) = self.stop(&component_id).await {
                warn!(component_id = %component_id, error = %e, "Failed to stop component");
            }
        }
    }

    async fn set_state(&self, component_id: &str, state: ComponentState) {
        if let Some(managed) = self.components.write().await.get_mut(component_id) {
            managed.state = state;
        }
    }

    /// Route a component-scoped command to its instance
    pub async fn handle_command(
        &self,
        component_id: &str,
        action: &str,
        payload: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ComponentError> {
        let instance = {
            let components = self.components.read().await;
            let managed = components
                .get(component_id)
                .ok_or_else(|| ComponentError::NotFound(component_id.to_string()))?;
            if managed.state != ComponentState::Running {
                return Err(ComponentError::NotRunning {
                    component_id: component_id.to_string(),
                });
            }
            managed.instance.clone()
        };

        if !instance.capabilities().iter().any(|cap| cap == action) {
            return Err(ComponentError::UnsupportedAction {
                component_id: component_id.to_string(),
                action: action.to_string(),
            });
        }
        instance.handle_command(action, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::dummy::ENTRYPOINT;
    use crate::storage::registry::tests::sample_record;
    use crate::testing::mocks::RecordingPublisher;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    impl ComponentManager {
        async fn instance_ptr(&self, component_id: &str) -> Option<*const ()> {
            self.components
                .read()
                .await
                .get(component_id)
                .map(|managed| Arc::as_ptr(&managed.instance) as *const ())
        }
    }

    fn manager_with(factories: ComponentFactoryRegistry) -> ComponentManager {
        ComponentManager::new(
            Arc::new(factories),
            TopicSchema::new("agent_1").unwrap(),
            Arc::new(RecordingPublisher::default()),
        )
    }

    #[tokio::test]
    async fn test_unload_forgets_instance() {
        let manager = manager_with(ComponentFactoryRegistry::builtin());
        manager.start("dummy", ENTRYPOINT).await.unwrap();
        let first = manager.instance_ptr("dummy").await.unwrap();

        manager.unload("dummy").await.unwrap();
        assert_eq!(manager.state_of("dummy").await, None);
        assert!(manager.loaded().await.is_empty());
        assert!(manager.running_ids().await.is_empty());

        manager.start("dummy", ENTRYPOINT).await.unwrap();
        let second = manager.instance_ptr("dummy").await.unwrap();
        assert_ne!(first, second);

        manager.unload("absent").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let manager = manager_with(ComponentFactoryRegistry::builtin());
        assert_eq!(manager.state_of("dummy").await, None);

        manager.start("dummy", ENTRYPOINT).await.unwrap();
        assert_eq!(manager.state_of("dummy").await, Some(ComponentState::Running));
        assert!(manager.running_ids().await.contains("dummy"));

        // idempotent
        manager.start("dummy", ENTRYPOINT).await.unwrap();

        manager.stop("dummy").await.unwrap();
        assert_eq!(manager.state_of("dummy").await, Some(ComponentState::Stopped));
        assert!(manager.running_ids().await.is_empty());

        manager.start("dummy", ENTRYPOINT).await.unwrap();
        assert_eq!(manager.state_of("dummy").await, Some(ComponentState::Running));
    }

    #[tokio::test]
    async fn test_start_unknown_entrypoint() {
        let manager = manager_with(ComponentFactoryRegistry::builtin());
        let err = manager
            .start("cpu", "lucid.components.cpu:CpuComponent")
            .await
            .unwrap_err();
        assert!(matches!(err, ComponentError::UnknownEntrypoint(_)));
        assert_eq!(manager.state_of("cpu").await, None);
    }

    #[tokio::test]
    async fn test_load_all_skips_disabled_and_unimportable() {
        let manager = manager_with(ComponentFactoryRegistry::builtin());
        let mut registry = RegistryMap::new();

        let mut dummy = sample_record("0.1.0");
        dummy.entrypoint = ENTRYPOINT.to_string();
        registry.insert("dummy".to_string(), dummy.clone());

        let mut disabled = dummy.clone();
        disabled.enabled = false;
        registry.insert("dummy_off".to_string(), disabled);

        registry.insert("cpu".to_string(), sample_record("1.2.3"));

        let started = manager.load_all(&registry).await;
        assert_eq!(started, vec!["dummy".to_string()]);
    }

    #[tokio::test]
    async fn test_handle_command_requires_running_and_capability() {
        let manager = manager_with(ComponentFactoryRegistry::builtin());
        let err = manager
            .handle_command("dummy", "reset", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "component not found: dummy");

        manager.start("dummy", ENTRYPOINT).await.unwrap();
        let fields = manager
            .handle_command("dummy", "reset", &Map::new())
            .await
            .unwrap();
        assert_eq!(fields["resets"], 1);

        let err = manager
            .handle_command("dummy", "explode", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ComponentError::UnsupportedAction { .. }));

        manager.stop("dummy").await.unwrap();
        let err = manager
            .handle_command("dummy", "reset", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ComponentError::NotRunning { .. }));
    }

    struct SlowComponent {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Component for SlowComponent {
        fn component_id(&self) -> &str {
            "slow"
        }
        fn capabilities(&self) -> Vec<String> {
            Vec::new()
        }
        async fn start(&self) -> Result<(), ComponentError> {
            self.release.notified().await;
            Ok(())
        }
        async fn stop(&self) -> Result<(), ComponentError> {
            Ok(())
        }
        async fn handle_command(
            &self,
            _action: &str,
            _payload: &Map<String, Value>,
        ) -> Result<Map<String, Value>, ComponentError> {
            Ok(Map::new())
        }
    }

    #[tokio::test]
    async fn test_transitional_state_is_observable() {
        let release = Arc::new(Notify::new());
        let mut factories = ComponentFactoryRegistry::new();
        {
            let release = release.clone();
            factories.register("slow:Slow", move |_| {
                Arc::new(SlowComponent {
                    release: release.clone(),
                })
            });
        }
        let manager = Arc::new(manager_with(factories));

        let starting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start("slow", "slow:Slow").await })
        };
        while manager.state_of("slow").await != Some(ComponentState::Starting) {
            tokio::task::yield_now().await;
        }
        assert!(manager.is_transitional("slow").await);
        assert!(matches!(
            manager.stop("slow").await,
            Err(ComponentError::Transitional { .. })
        ));

        release.notify_one();
        starting.await.unwrap().unwrap();
        assert!(!manager.is_transitional("slow").await);
    }
}
