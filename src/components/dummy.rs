//! Built-in demo component
//!
//! Does no real work. It exists so that a fresh agent has something to
//! enable, disable and command, and for regression tests of the loader.

use super::plugin::{Component, ComponentContext, ComponentError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub const ENTRYPOINT: &str = "lucid_agent_core.components.dummy:DummyComponent";

#[derive(Debug)]
pub struct DummyComponent {
    ctx: ComponentContext,
    resets: AtomicU64,
}

impl DummyComponent {
    pub fn new(ctx: ComponentContext) -> Self {
        Self {
            ctx,
            resets: AtomicU64::new(0),
        }
    }

    fn state(&self) -> Value {
        json!({ "resets": self.resets.load(Ordering::SeqCst) })
    }
}

#[async_trait]
impl Component for DummyComponent {
    fn component_id(&self) -> &str {
        self.ctx.component_id()
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["reset".to_string(), "identify".to_string()]
    }

    async fn start(&self) -> Result<(), ComponentError> {
        info!(component_id = %self.component_id(), "Dummy component started");
        self.ctx.publish_state(&self.state()).await
    }

    async fn stop(&self) -> Result<(), ComponentError> {
        info!(component_id = %self.component_id(), "Dummy component stopped");
        Ok(())
    }

    async fn handle_command(
        &self,
        action: &str,
        _payload: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ComponentError> {
        let mut fields = Map::new();
        match action {
            "reset" => {
                self.resets.fetch_add(1, Ordering::SeqCst);
                self.ctx.publish_state(&self.state()).await?;
                fields.insert("resets".to_string(), json!(self.resets.load(Ordering::SeqCst)));
            }
            "identify" => {
                fields.insert("component_id".to_string(), json!(self.component_id()));
                fields.insert("agent_id".to_string(), json!(self.ctx.agent_id()));
                fields.insert("identified_at".to_string(), json!(Utc::now()));
            }
            other => {
                return Err(ComponentError::UnsupportedAction {
                    component_id: self.component_id().to_string(),
                    action: other.to_string(),
                })
            }
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::topics::TopicSchema;
    use crate::testing::mocks::RecordingPublisher;
    use std::sync::Arc;

    fn dummy() -> (DummyComponent, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let ctx = ComponentContext::new("dummy", TopicSchema::new("agent_1").unwrap(), publisher.clone());
        (DummyComponent::new(ctx), publisher)
    }

    #[tokio::test]
    async fn test_reset_counts_and_publishes_state() {
        let (component, publisher) = dummy();
        component.start().await.unwrap();
        let fields = component.handle_command("reset", &Map::new()).await.unwrap();
        assert_eq!(fields["resets"], 1);

        let published = publisher.published().await;
        let last = published.last().unwrap();
        assert_eq!(last.0, "lucid/agents/agent_1/components/dummy/state");
        assert_eq!(last.1["resets"], 1);
    }

    #[tokio::test]
    async fn test_identify() {
        let (component, _) = dummy();
        let fields = component.handle_command("identify", &Map::new()).await.unwrap();
        assert_eq!(fields["component_id"], "dummy");
        assert_eq!(fields["agent_id"], "agent_1");
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let (component, _) = dummy();
        let err = component.handle_command("explode", &Map::new()).await.unwrap_err();
        assert!(matches!(err, ComponentError::UnsupportedAction { .. }));
    }
}
