//! Everything a command handler can touch
//!
//! Built once at startup and shared by the dispatcher, the schedulers and
//! the receive loop. There are no globals: stores, managers and the restart
//! coordinator are constructed by the caller and injected here.

use super::routes::RouteTable;
use crate::agent::scheduler::Schedulers;
use crate::agent::session::SessionClock;
use crate::components::{ComponentFactoryRegistry, ComponentManager, TransportPublisher};
use crate::lifecycle::{
    LifecycleError, LifecycleManager, LifecycleSettings, PackageManager, RestartCoordinator,
};
use crate::observability::LogLevelHandle;
use crate::protocol::messages::{CommandResult, StatusState};
use crate::protocol::snapshots::{
    build_cfg, build_cfg_telemetry, build_component_metadata, build_component_status,
    build_components_list, build_metadata, build_state, build_status, MetricsSampler,
};
use crate::protocol::topics::TopicSchema;
use crate::storage::{ConfigStore, Registry, RegistryMap};
use crate::transport::{Delivery, Transport};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;
pub const DEFAULT_TELEMETRY_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_BOOTSTRAP_HEARTBEAT_S: u64 = 30;

/// Tunables taken from the bootstrap config
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub worker_pool_size: usize,
    pub telemetry_tick: Duration,
    /// Used when the runtime config has no `heartbeat_s`; `0` disables
    pub bootstrap_heartbeat_s: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            telemetry_tick: DEFAULT_TELEMETRY_TICK,
            bootstrap_heartbeat_s: DEFAULT_BOOTSTRAP_HEARTBEAT_S,
        }
    }
}

/// Collaborators that exist before the transport does
pub struct CoreServices {
    pub topics: TopicSchema,
    pub version: String,
    pub config_store: Arc<ConfigStore>,
    pub registry: Registry,
    pub lifecycle_settings: LifecycleSettings,
    pub factories: Arc<ComponentFactoryRegistry>,
    pub package_manager: Arc<dyn PackageManager>,
    pub restart: Arc<RestartCoordinator>,
    pub session: Arc<SessionClock>,
    pub sampler: Arc<MetricsSampler>,
    pub log_level: Option<LogLevelHandle>,
    pub logs_enabled: Arc<AtomicBool>,
    pub settings: RuntimeSettings,
}

impl std::fmt::Debug for CoreServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreServices")
            .field("agent_id", &self.topics.agent_id())
            .field("version", &self.version)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Shared state behind every handler
pub struct CommandContext<T: Transport + 'static> {
    pub transport: Arc<T>,
    pub topics: TopicSchema,
    pub version: String,
    pub config_store: Arc<ConfigStore>,
    pub registry: Registry,
    pub lifecycle: Arc<LifecycleManager>,
    pub components: Arc<ComponentManager>,
    pub routes: Arc<RouteTable>,
    pub restart: Arc<RestartCoordinator>,
    pub session: Arc<SessionClock>,
    pub sampler: Arc<MetricsSampler>,
    pub log_level: Option<LogLevelHandle>,
    pub logs_enabled: Arc<AtomicBool>,
    pub schedulers: Arc<Schedulers<T>>,
    pub settings: RuntimeSettings,
}

impl<T: Transport + 'static> std::fmt::Debug for CommandContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("agent_id", &self.topics.agent_id())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> CommandContext<T> {
    /// Wire the transport-dependent pieces onto the injected services
    pub fn assemble(
        transport: Arc<T>,
        services: CoreServices,
        routes: Arc<RouteTable>,
    ) -> Result<Self, LifecycleError> {
        let publisher = Arc::new(TransportPublisher::new(transport.clone()));
        let components = Arc::new(ComponentManager::new(
            services.factories,
            services.topics.clone(),
            publisher,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            services.registry.clone(),
            services.lifecycle_settings,
            services.package_manager,
            components.clone(),
        )?);
        let schedulers = Arc::new(Schedulers::new(
            transport.clone(),
            services.topics.clone(),
            services.session.clone(),
            services.config_store.clone(),
            services.sampler.clone(),
            &services.settings,
        ));

        Ok(Self {
            transport,
            topics: services.topics,
            version: services.version,
            config_store: services.config_store,
            registry: services.registry,
            lifecycle,
            components,
            routes,
            restart: services.restart,
            session: services.session,
            sampler: services.sampler,
            log_level: services.log_level,
            logs_enabled: services.logs_enabled,
            schedulers,
            settings: services.settings,
        })
    }

    /// QoS 1 JSON publish. Failures are logged, never raised.
    pub async fn publish_json<P: Serialize + ?Sized>(&self, topic: &str, payload: &P, retain: bool) -> bool {
        publish_json(self.transport.as_ref(), topic, payload, retain, Delivery::AtLeastOnce).await
    }

    pub async fn publish_result(&self, topic: &str, result: &CommandResult) -> bool {
        self.publish_json(topic, result, false).await
    }

    pub async fn publish_metadata(&self) -> bool {
        let metadata = build_metadata(self.topics.agent_id(), &self.version);
        self.publish_json(&self.topics.metadata(), &metadata, true).await
    }

    pub async fn publish_status(&self, state: StatusState) -> bool {
        let status = build_status(state, self.session.connected_since(), Utc::now());
        self.publish_json(&self.topics.status(), &status, true).await
    }

    async fn load_registry(&self) -> RegistryMap {
        self.registry.load_async().await.unwrap_or_else(|e| {
            warn!(error = %e, "Registry unreadable, publishing empty component list");
            RegistryMap::new()
        })
    }

    pub async fn publish_state(&self) -> bool {
        let registry = self.load_registry().await;
        let running = self.components.running_ids().await;
        let sampler = self.sampler.clone();
        let metrics = tokio::task::spawn_blocking(move || sampler.sample())
            .await
            .unwrap_or_default();
        let state = build_state(metrics, &build_components_list(&registry, &running));
        self.publish_json(&self.topics.state(), &state, true).await
    }

    /// `cfg` and `cfg/telemetry`
    pub async fn publish_cfg(&self) -> bool {
        let cfg = self.config_store.cached();
        let full = self
            .publish_json(&self.topics.cfg(), &build_cfg(&cfg), true)
            .await;
        let telemetry = self
            .publish_json(&self.topics.cfg_telemetry(), &build_cfg_telemetry(&cfg), true)
            .await;
        full && telemetry
    }

    /// Retained `components/<cid>/metadata` and `components/<cid>/status`
    pub async fn publish_component_snapshots(&self, component_id: &str) -> bool {
        let registry = self.load_registry().await;
        let running = self.components.running_ids().await;
        self.publish_component_from(component_id, &registry, &running)
            .await
    }

    async fn publish_component_from(
        &self,
        component_id: &str,
        registry: &RegistryMap,
        running: &BTreeSet<String>,
    ) -> bool {
        let (Ok(metadata_topic), Ok(status_topic)) = (
            self.topics.component_metadata(component_id),
            self.topics.component_status(component_id),
        ) else {
            warn!(component_id, "Component id not usable in a topic, skipping snapshots");
            return false;
        };

        let record = registry.get(component_id);
        let capabilities = self
            .components
            .capabilities(component_id)
            .await
            .unwrap_or_default();
        let metadata = build_component_metadata(
            component_id,
            record.map(|record| record.version.as_str()),
            &capabilities,
            record.is_some_and(|record| record.enabled),
        );
        let status = build_component_status(running.contains(component_id));

        let published_metadata = self.publish_json(&metadata_topic, &metadata, true).await;
        let published_status = self.publish_json(&status_topic, &status, true).await;
        published_metadata && published_status
    }

    /// Every retained snapshot, agent and component level
    pub async fn publish_all_snapshots(&self) -> bool {
        let mut ok = self.publish_metadata().await;
        ok &= self.publish_status(StatusState::Online).await;
        ok &= self.publish_state().await;
        ok &= self.publish_cfg().await;

        let registry = self.load_registry().await;
        let running = self.components.running_ids().await;
        let mut component_ids: BTreeSet<String> = registry.keys().cloned().collect();
        component_ids.extend(
            self.components
                .loaded()
                .await
                .into_iter()
                .map(|(component_id, _)| component_id),
        );
        for component_id in component_ids {
            ok &= self
                .publish_component_from(&component_id, &registry, &running)
                .await;
        }
        debug!(ok, "Snapshots published");
        ok
    }

    /// Route and subscribe a started component's capabilities
    pub async fn expose_component(&self, component_id: &str) {
        let Some(capabilities) = self.components.capabilities(component_id).await else {
            return;
        };
        match self
            .routes
            .register_component(&self.topics, component_id, &capabilities)
            .await
        {
            Ok(added) => {
                for topic in added {
                    if let Err(e) = self.transport.subscribe(&topic).await {
                        warn!(topic = %topic, error = %e, "Failed to subscribe component command");
                    }
                }
            }
            Err(e) => warn!(component_id, error = %e, "Component routes rejected"),
        }
    }

    /// Drop and unsubscribe a component's command routes
    pub async fn hide_component(&self, component_id: &str) {
        for topic in self.routes.remove_component(component_id).await {
            if let Err(e) = self.transport.unsubscribe(&topic).await {
                warn!(topic = %topic, error = %e, "Failed to unsubscribe component command");
            }
        }
    }
}

/// Serialize and publish, logging instead of failing
pub async fn publish_json<T, P>(
    transport: &T,
    topic: &str,
    payload: &P,
    retain: bool,
    delivery: Delivery,
) -> bool
where
    T: Transport + ?Sized,
    P: Serialize + ?Sized,
{
    let bytes = match serde_json::to_vec(payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(topic, error = %e, "Failed to serialize payload");
            return false;
        }
    };
    match transport.publish(topic, bytes, retain, delivery).await {
        Ok(()) => true,
        Err(e) => {
            warn!(topic, error = %e, "Publish failed");
            false
        }
    }
}
