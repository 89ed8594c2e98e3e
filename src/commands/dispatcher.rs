//! Bounded worker pool for command handlers
//!
//! The receive loop only routes and submits. Each submission waits for one
//! of N permits, so a slow download or package manager run never blocks
//! reception. Handlers run in their own task; a panic surfaces as a
//! `JoinError` and is turned into a failure result.

use super::context::CommandContext;
use super::handlers::{self, HandlerOutcome};
use super::routes::Route;
use crate::protocol::messages::{extract_request_id, CommandResult};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Bound on waiting for acknowledgements before a restart
pub const RESTART_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Dispatcher<T: Transport + 'static> {
    ctx: Arc<CommandContext<T>>,
    permits: Arc<Semaphore>,
}

impl<T: Transport + 'static> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            permits: self.permits.clone(),
        }
    }
}

impl<T: Transport + 'static> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> Dispatcher<T> {
    pub fn new(ctx: Arc<CommandContext<T>>) -> Self {
        let workers = ctx.settings.worker_pool_size.max(1);
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn context(&self) -> &Arc<CommandContext<T>> {
        &self.ctx
    }

    /// Queue one command. The returned handle completes after the result
    /// (and any restart) has been handled.
    pub fn submit(&self, route: Route, payload: String) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(action = route.action(), "Worker pool closed, dropping command");
                return;
            };

            let request_id = extract_request_id(&payload);
            let span = crate::command_span!(action = route.action(), request_id = %request_id);
            let handler_ctx = ctx.clone();
            let handler_route = route.clone();
            let outcome = match tokio::spawn(
                async move { handlers::handle(&handler_ctx, &handler_route, &payload).await }
                    .instrument(span),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(action = route.action(), request_id = %request_id, error = %e, "Command handler panicked");
                    HandlerOutcome::result_only(CommandResult::failure(
                        request_id,
                        format!("internal error handling {}", route.action()),
                    ))
                }
            };

            finish(&ctx, &route, outcome).await;
        })
    }
}

/// Publish the result, then refreshed snapshots, then restart if asked.
pub async fn finish<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    route: &Route,
    outcome: HandlerOutcome,
) {
    let result_topic = match route.result_topic(&ctx.topics) {
        Ok(topic) => topic,
        Err(e) => {
            error!(action = route.action(), error = %e, "No result topic for route");
            return;
        }
    };

    ctx.publish_result(&result_topic, &outcome.result).await;
    info!(
        action = route.action(),
        request_id = %outcome.result.request_id,
        ok = outcome.result.ok,
        restart_required = outcome.result.restart_required,
        "Command result published"
    );

    if outcome.state_changed {
        ctx.publish_state().await;
    }
    if outcome.cfg_changed {
        ctx.publish_cfg().await;
    }
    if let Some(component_id) = &outcome.component_changed {
        ctx.publish_component_snapshots(component_id).await;
    }

    if outcome.result.ok && outcome.result.restart_required {
        if !ctx.transport.flush(RESTART_FLUSH_TIMEOUT).await {
            warn!(action = route.action(), "Outstanding publishes not acknowledged before restart");
        }
        ctx.restart.request(route.action());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::context::tests::fixture;
    use crate::commands::routes::CoreCommand;

    #[tokio::test]
    async fn test_result_published_once_on_result_topic() {
        let fx = fixture().await;
        let dispatcher = Dispatcher::new(fx.ctx.clone());
        dispatcher
            .submit(Route::Core(CoreCommand::Ping), r#"{"request_id":"p1"}"#.to_string())
            .await
            .unwrap();

        let results = fx
            .transport
            .published_on("lucid/agents/agent_1/evt/ping/result")
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].retain);
        let body = results[0].json();
        assert_eq!(body["request_id"], "p1");
        assert_eq!(body["ok"], true);
        assert!(body["error"].is_null());
        assert_eq!(body["restart_required"], false);
        assert!(body["ts"].is_string());
    }

    #[tokio::test]
    async fn test_restart_signal_follows_result_and_flush() {
        let fx = fixture().await;
        let dispatcher = Dispatcher::new(fx.ctx.clone());
        dispatcher
            .submit(Route::Core(CoreCommand::Restart), r#"{"request_id":"r1"}"#.to_string())
            .await
            .unwrap();

        assert_eq!(fx.signaller.count(), 1);
        let result = fx
            .timeline
            .position("publish lucid/agents/agent_1/evt/restart/result")
            .unwrap();
        let flush = fx.timeline.position("flush").unwrap();
        let signal = fx.timeline.position("signal").unwrap();
        assert!(result < flush && flush < signal);
    }

    #[tokio::test]
    async fn test_cfg_set_republishes_cfg_after_result() {
        let fx = fixture().await;
        let dispatcher = Dispatcher::new(fx.ctx.clone());
        dispatcher
            .submit(
                Route::Core(CoreCommand::CfgSet),
                r#"{"request_id":"c1","set":{"telemetry":{"enabled":true}}}"#.to_string(),
            )
            .await
            .unwrap();

        let result = fx
            .timeline
            .position("publish lucid/agents/agent_1/evt/cfg/set/result")
            .unwrap();
        let cfg = fx.timeline.position("publish lucid/agents/agent_1/cfg").unwrap();
        assert!(result < cfg);
        let telemetry = fx
            .transport
            .last_json_on("lucid/agents/agent_1/cfg/telemetry")
            .await
            .unwrap();
        assert_eq!(telemetry["enabled"], true);
        assert_eq!(fx.signaller.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_command_does_not_refresh_or_restart() {
        let fx = fixture().await;
        let dispatcher = Dispatcher::new(fx.ctx.clone());
        dispatcher
            .submit(
                Route::Core(CoreCommand::ComponentsUninstall),
                r#"{"request_id":"u1"}"#.to_string(),
            )
            .await
            .unwrap();

        let body = fx
            .transport
            .last_json_on("lucid/agents/agent_1/evt/components/uninstall/result")
            .await
            .unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["request_id"], "u1");
        assert!(fx.transport.published_on("lucid/agents/agent_1/state").await.is_empty());
        assert_eq!(fx.transport.flush_calls(), 0);
        assert_eq!(fx.signaller.count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_each_get_a_result() {
        let fx = fixture().await;
        let dispatcher = Dispatcher::new(fx.ctx.clone());
        let handles: Vec<_> = (0..10)
            .map(|i| {
                dispatcher.submit(
                    Route::Core(CoreCommand::Ping),
                    format!(r#"{{"request_id":"p{i}"}}"#),
                )
            })
            .collect();
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        let mut ids: Vec<String> = fx
            .transport
            .published_on("lucid/agents/agent_1/evt/ping/result")
            .await
            .iter()
            .map(|message| message.json()["request_id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids.len(), 10);
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }
}
