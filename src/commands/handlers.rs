//! Command handlers
//!
//! Handlers never publish their own result. Each returns a
//! [`HandlerOutcome`] and the dispatcher publishes the result, any snapshot
//! refresh and finally the restart, in that order.

use super::context::CommandContext;
use super::routes::{CoreCommand, Route};
use crate::error::sanitize_error_message;
use crate::lifecycle::{LifecycleError, OperationReport};
use crate::protocol::messages::{optional_str, parse_payload, CommandResult};
use crate::transport::Transport;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::atomic::Ordering;
use tracing::{info, warn, Instrument};

/// What the dispatcher must publish after a handler ran
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub result: CommandResult,
    /// Republish the retained `state`
    pub state_changed: bool,
    /// Republish `cfg` and `cfg/telemetry`
    pub cfg_changed: bool,
    /// Republish this component's metadata and status
    pub component_changed: Option<String>,
}

impl HandlerOutcome {
    pub fn result_only(result: CommandResult) -> Self {
        Self {
            result,
            state_changed: false,
            cfg_changed: false,
            component_changed: None,
        }
    }
}

fn request_id_of(payload: &Map<String, Value>) -> String {
    optional_str(payload, "request_id")
        .ok()
        .flatten()
        .unwrap_or_default()
        .to_string()
}

/// Run the handler for `route` on a raw UTF-8 payload
pub async fn handle<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    route: &Route,
    raw: &str,
) -> HandlerOutcome {
    let payload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(action = route.action(), error = %e, "Rejected command payload");
            return HandlerOutcome::result_only(CommandResult::failure(String::new(), e));
        }
    };

    match route {
        Route::Core(command) => handle_core(ctx, *command, payload).await,
        Route::Component {
            component_id,
            action,
        } => handle_component(ctx, component_id, action, &payload).await,
    }
}

async fn handle_core<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    command: CoreCommand,
    payload: Map<String, Value>,
) -> HandlerOutcome {
    match command {
        CoreCommand::Ping => ping(ctx, &payload),
        CoreCommand::Restart => restart(ctx, &payload),
        CoreCommand::Refresh => refresh(ctx, &payload).await,
        CoreCommand::CfgSet => cfg_set(ctx, payload).await,
        CoreCommand::ComponentsInstall
        | CoreCommand::ComponentsUninstall
        | CoreCommand::ComponentsEnable
        | CoreCommand::ComponentsDisable
        | CoreCommand::ComponentsUpgrade
        | CoreCommand::CoreUpgrade => lifecycle(ctx, command, &payload).await,
    }
}

fn ping<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    payload: &Map<String, Value>,
) -> HandlerOutcome {
    let result = CommandResult::success(request_id_of(payload))
        .with_field("uptime_s", ctx.session.uptime_s(Utc::now()));
    HandlerOutcome::result_only(result)
}

fn restart<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    payload: &Map<String, Value>,
) -> HandlerOutcome {
    let request_id = request_id_of(payload);
    if !ctx.restart.is_available() {
        warn!(request_id = %request_id, "Restart command refused");
        return HandlerOutcome::result_only(CommandResult::failure(
            request_id,
            "restart not available",
        ));
    }
    HandlerOutcome::result_only(CommandResult::success(request_id).with_restart_required(true))
}

async fn refresh<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    payload: &Map<String, Value>,
) -> HandlerOutcome {
    let request_id = request_id_of(payload);
    if ctx.publish_all_snapshots().await {
        HandlerOutcome::result_only(CommandResult::success(request_id))
    } else {
        HandlerOutcome::result_only(CommandResult::failure(
            request_id,
            "one or more snapshots failed to publish",
        ))
    }
}

async fn cfg_set<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    payload: Map<String, Value>,
) -> HandlerOutcome {
    let request_id = request_id_of(&payload);
    let heartbeat_before = ctx.config_store.heartbeat_s();
    let level_requested = payload
        .get("set")
        .and_then(Value::as_object)
        .is_some_and(|set| set.contains_key("log_level"));

    let outcome = match ctx.config_store.apply_set_async(payload).await {
        Ok(outcome) => outcome,
        Err(e) => {
            return HandlerOutcome::result_only(CommandResult::failure(
                request_id,
                sanitize_error_message(&e.to_string()),
            ))
        }
    };
    if !outcome.changed {
        return HandlerOutcome::result_only(outcome.result);
    }

    if level_requested {
        if let (Some(handle), Some(level)) = (&ctx.log_level, ctx.config_store.log_level()) {
            match handle.apply(&level) {
                Ok(()) => info!(level = %level, "Log level changed"),
                Err(e) => warn!(level = %level, error = %e, "Could not apply log level"),
            }
        }
    }
    ctx.logs_enabled
        .store(ctx.config_store.logs_enabled(), Ordering::Relaxed);
    if ctx.config_store.heartbeat_s() != heartbeat_before {
        ctx.schedulers.restart_heartbeat().await;
    }

    HandlerOutcome {
        result: outcome.result,
        state_changed: false,
        cfg_changed: true,
        component_changed: None,
    }
}

async fn run_lifecycle<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    command: CoreCommand,
    payload: &Map<String, Value>,
) -> Result<OperationReport, LifecycleError> {
    let lifecycle = &ctx.lifecycle;
    match command {
        CoreCommand::ComponentsInstall => lifecycle.install(payload).await,
        CoreCommand::ComponentsUninstall => lifecycle.uninstall(payload).await,
        CoreCommand::ComponentsUpgrade => lifecycle.upgrade(payload).await,
        CoreCommand::ComponentsEnable => lifecycle.enable(payload).await,
        CoreCommand::ComponentsDisable => lifecycle.disable(payload).await,
        CoreCommand::CoreUpgrade => lifecycle.core_upgrade(payload).await,
        other => Err(LifecycleError::Validation(format!(
            "not a lifecycle command: {}",
            other.action()
        ))),
    }
}

async fn lifecycle<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    command: CoreCommand,
    payload: &Map<String, Value>,
) -> HandlerOutcome {
    let request_id = request_id_of(payload);
    let span = crate::lifecycle_span!(action = command.action(), request_id = %request_id);

    let report = match run_lifecycle(ctx, command, payload).instrument(span).await {
        Ok(report) => report,
        Err(e) => {
            warn!(action = command.action(), error = %e, "Lifecycle command failed");
            let mut result =
                CommandResult::failure(request_id, sanitize_error_message(&e.to_string()));
            for key in ["component_id", "version"] {
                if let Some(value) = payload.get(key).filter(|value| value.is_string()) {
                    result = result.with_field(key, value.clone());
                }
            }
            return HandlerOutcome::result_only(result);
        }
    };

    let noop = report.fields.get("noop").and_then(Value::as_bool) == Some(true);
    let component_id = report
        .fields
        .get("component_id")
        .and_then(Value::as_str)
        .map(String::from);

    let mut component_changed = None;
    if let Some(component_id) = component_id.filter(|_| !noop) {
        match command {
            CoreCommand::ComponentsEnable => {
                ctx.expose_component(&component_id).await;
                component_changed = Some(component_id);
            }
            CoreCommand::ComponentsDisable => {
                ctx.hide_component(&component_id).await;
                component_changed = Some(component_id);
            }
            CoreCommand::ComponentsUninstall => {
                ctx.hide_component(&component_id).await;
                component_changed = Some(component_id);
            }
            _ => {}
        }
    }

    let mut result =
        CommandResult::success(request_id).with_restart_required(report.restart_required);
    for (key, value) in report.fields {
        result = result.with_field(&key, value);
    }
    HandlerOutcome {
        result,
        state_changed: report.registry_changed,
        cfg_changed: false,
        component_changed,
    }
}

async fn handle_component<T: Transport + 'static>(
    ctx: &CommandContext<T>,
    component_id: &str,
    action: &str,
    payload: &Map<String, Value>,
) -> HandlerOutcome {
    let request_id = request_id_of(payload);
    let result = match ctx
        .components
        .handle_command(component_id, action, payload)
        .await
    {
        Ok(fields) => fields.into_iter().fold(
            CommandResult::success(request_id).with_field("component_id", component_id),
            |result, (key, value)| result.with_field(&key, value),
        ),
        Err(e) => {
            warn!(component_id, action, error = %e, "Component command failed");
            CommandResult::failure(request_id, sanitize_error_message(&e.to_string()))
                .with_field("component_id", component_id)
        }
    };
    HandlerOutcome::result_only(result)
}
