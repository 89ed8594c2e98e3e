//! Exact-topic route table for inbound commands

use crate::protocol::topics::{TopicSchema, TopicSchemaError};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Agent-level commands under `cmd/<action>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreCommand {
    Ping,
    Restart,
    Refresh,
    CfgSet,
    ComponentsInstall,
    ComponentsUninstall,
    ComponentsEnable,
    ComponentsDisable,
    ComponentsUpgrade,
    CoreUpgrade,
}

impl CoreCommand {
    pub const ALL: [CoreCommand; 10] = [
        CoreCommand::Ping,
        CoreCommand::Restart,
        CoreCommand::Refresh,
        CoreCommand::CfgSet,
        CoreCommand::ComponentsInstall,
        CoreCommand::ComponentsUninstall,
        CoreCommand::ComponentsEnable,
        CoreCommand::ComponentsDisable,
        CoreCommand::ComponentsUpgrade,
        CoreCommand::CoreUpgrade,
    ];

    pub fn action(self) -> &'static str {
        match self {
            CoreCommand::Ping => "ping",
            CoreCommand::Restart => "restart",
            CoreCommand::Refresh => "refresh",
            CoreCommand::CfgSet => "cfg/set",
            CoreCommand::ComponentsInstall => "components/install",
            CoreCommand::ComponentsUninstall => "components/uninstall",
            CoreCommand::ComponentsEnable => "components/enable",
            CoreCommand::ComponentsDisable => "components/disable",
            CoreCommand::ComponentsUpgrade => "components/upgrade",
            CoreCommand::CoreUpgrade => "core/upgrade",
        }
    }

    pub fn from_action(action: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.action() == action)
    }
}

/// What an inbound topic resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Core(CoreCommand),
    Component {
        component_id: String,
        action: String,
    },
}

impl Route {
    pub fn action(&self) -> &str {
        match self {
            Route::Core(command) => command.action(),
            Route::Component { action, .. } => action,
        }
    }

    /// Where the single result for this route is published
    pub fn result_topic(&self, topics: &TopicSchema) -> Result<String, TopicSchemaError> {
        match self {
            Route::Core(command) => topics.evt_result(command.action()),
            Route::Component {
                component_id,
                action,
            } => topics.component_evt_result(component_id, action),
        }
    }
}

/// Subscribed command topics and their routes
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every core command. Returns the topics.
    pub async fn register_core(&self, topics: &TopicSchema) -> Result<Vec<String>, TopicSchemaError> {
        let mut registered = Vec::with_capacity(CoreCommand::ALL.len());
        let mut routes = self.routes.write().await;
        for command in CoreCommand::ALL {
            let topic = topics.cmd(command.action())?;
            routes.insert(topic.clone(), Route::Core(command));
            registered.push(topic);
        }
        Ok(registered)
    }

    /// Register `components/<cid>/cmd/<cap>` for each capability.
    /// Returns only topics that were not already routed.
    pub async fn register_component(
        &self,
        topics: &TopicSchema,
        component_id: &str,
        capabilities: &[String],
    ) -> Result<Vec<String>, TopicSchemaError> {
        let mut added = Vec::new();
        let mut routes = self.routes.write().await;
        for action in capabilities {
            let topic = topics.component_cmd(component_id, action)?;
            let route = Route::Component {
                component_id: component_id.to_string(),
                action: action.clone(),
            };
            if routes.insert(topic.clone(), route).is_none() {
                added.push(topic);
            }
        }
        Ok(added)
    }

    /// Drop every route of a component. Returns the removed topics.
    pub async fn remove_component(&self, component_id: &str) -> Vec<String> {
        let mut routes = self.routes.write().await;
        let removed: Vec<String> = routes
            .iter()
            .filter(|(_, route)| {
                matches!(route, Route::Component { component_id: cid, .. } if cid == component_id)
            })
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in &removed {
            routes.remove(topic);
        }
        removed
    }

    pub async fn lookup(&self, topic: &str) -> Option<Route> {
        self.routes.read().await.get(topic).cloned()
    }

    /// Every routed topic, sorted
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TopicSchema {
        TopicSchema::new("agent_1").unwrap()
    }

    #[test]
    fn test_action_round_trip() {
        for command in CoreCommand::ALL {
            assert_eq!(CoreCommand::from_action(command.action()), Some(command));
        }
        assert_eq!(CoreCommand::from_action("components"), None);
    }

    #[tokio::test]
    async fn test_register_core_routes() {
        let table = RouteTable::new();
        let topics = table.register_core(&schema()).await.unwrap();
        assert_eq!(topics.len(), CoreCommand::ALL.len());

        let route = table
            .lookup("lucid/agents/agent_1/cmd/components/install")
            .await
            .unwrap();
        assert_eq!(route, Route::Core(CoreCommand::ComponentsInstall));
        assert_eq!(
            route.result_topic(&schema()).unwrap(),
            "lucid/agents/agent_1/evt/components/install/result"
        );
        assert!(table.lookup("lucid/agents/agent_1/cmd/unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_component_routes_add_and_remove() {
        let table = RouteTable::new();
        table.register_core(&schema()).await.unwrap();
        let caps = vec!["reset".to_string(), "identify".to_string()];

        let added = table.register_component(&schema(), "dummy", &caps).await.unwrap();
        assert_eq!(added.len(), 2);
        // re-registering is a no-op for the subscription set
        let again = table.register_component(&schema(), "dummy", &caps).await.unwrap();
        assert!(again.is_empty());

        let route = table
            .lookup("lucid/agents/agent_1/components/dummy/cmd/reset")
            .await
            .unwrap();
        assert_eq!(route.action(), "reset");
        assert_eq!(
            route.result_topic(&schema()).unwrap(),
            "lucid/agents/agent_1/components/dummy/evt/reset/result"
        );

        let mut removed = table.remove_component("dummy").await;
        removed.sort();
        assert_eq!(removed, {
            let mut added = added.clone();
            added.sort();
            added
        });
        assert_eq!(table.len().await, CoreCommand::ALL.len());
    }

    #[tokio::test]
    async fn test_invalid_component_id_rejected() {
        let table = RouteTable::new();
        let result = table
            .register_component(&schema(), "Bad-Id", &["reset".to_string()])
            .await;
        assert!(result.is_err());
        assert!(table.is_empty().await);
    }
}
