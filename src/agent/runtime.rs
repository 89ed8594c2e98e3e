//! Agent runtime: session events in, commands out
//!
//! The transport's own task forwards [`TransportEvent`]s over a channel. The
//! receive loop here only decodes, routes and submits to the dispatcher; all
//! command work happens on the dispatcher's worker pool.

use crate::commands::{CommandContext, CoreServices, Dispatcher, RouteTable};
use crate::lifecycle::LifecycleError;
use crate::observability::{spawn_log_forwarder, LogStream};
use crate::protocol::messages::StatusState;
use crate::protocol::topics::TopicSchemaError;
use crate::transport::{Transport, TransportEvent};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Topic(#[from] TopicSchemaError),
    #[error("lifecycle setup failed: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("runtime already started")]
    AlreadyStarted,
    #[error("runtime not started")]
    NotStarted,
}

/// Owns the session for one process lifetime
pub struct Runtime<T: Transport + 'static> {
    pending: Option<(T, CoreServices)>,
    log_stream: Option<LogStream>,
    ctx: Option<Arc<CommandContext<T>>>,
    receive_task: Option<JoinHandle<()>>,
    log_task: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> std::fmt::Debug for Runtime<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("started", &self.ctx.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> Runtime<T> {
    pub fn new(transport: T, services: CoreServices) -> Self {
        Self {
            pending: Some((transport, services)),
            log_stream: None,
            ctx: None,
            receive_task: None,
            log_task: None,
        }
    }

    /// Forward log records to the `logs` topic once connected
    pub fn with_log_stream(mut self, log_stream: LogStream) -> Self {
        self.log_stream = Some(log_stream);
        self
    }

    pub fn context(&self) -> Option<&Arc<CommandContext<T>>> {
        self.ctx.as_ref()
    }

    /// Connect, load enabled components and start the receive loop.
    ///
    /// Subscriptions and snapshots happen on every `Connected` event, the
    /// first one included.
    pub async fn start(&mut self) -> Result<(), RuntimeError> {
        let (mut transport, services) = self.pending.take().ok_or(RuntimeError::AlreadyStarted)?;
        info!(agent_id = %services.topics.agent_id(), version = %services.version, "Starting agent runtime");

        let routes = Arc::new(RouteTable::new());
        routes.register_core(&services.topics).await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        transport.set_event_sender(events_tx);
        transport
            .connect()
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        info!("Transport connected");

        let transport = Arc::new(transport);
        let ctx = Arc::new(CommandContext::assemble(transport.clone(), services, routes)?);

        match ctx.registry.load_async().await {
            Ok(registry) => {
                for component_id in ctx.components.load_all(&registry).await {
                    ctx.expose_component(&component_id).await;
                }
            }
            Err(e) => error!(error = %e, "Registry unreadable, no components loaded"),
        }

        if let Some(log_stream) = self.log_stream.take() {
            self.log_task = Some(spawn_log_forwarder(log_stream, transport, ctx.topics.logs()));
        }

        let dispatcher = Dispatcher::new(ctx.clone());
        self.receive_task = Some(tokio::spawn(
            receive_loop(dispatcher, events_rx).instrument(crate::mqtt_span!(role = "receive")),
        ));
        self.ctx = Some(ctx);
        info!("Agent runtime started");
        Ok(())
    }

    /// Stop loops and components, publish `offline`, disconnect.
    pub async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        let ctx = self.ctx.take().ok_or(RuntimeError::NotStarted)?;
        info!("Shutting down agent runtime");

        ctx.schedulers.stop().await;
        ctx.components.stop_all().await;
        ctx.publish_status(StatusState::Offline).await;
        if !ctx.transport.flush(SHUTDOWN_FLUSH_TIMEOUT).await {
            warn!("Offline status not acknowledged before disconnect");
        }
        if let Err(e) = ctx.transport.disconnect().await {
            warn!(error = %e, "Disconnect failed");
        }

        for handle in [self.receive_task.take(), self.log_task.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        info!("Agent runtime stopped");
        Ok(())
    }
}

async fn receive_loop<T: Transport + 'static>(
    dispatcher: Dispatcher<T>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    let ctx = dispatcher.context().clone();
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => on_connected(&ctx).await,
            TransportEvent::Disconnected(reason) => {
                warn!(reason = %reason, "Session lost, pausing schedulers");
                ctx.schedulers.stop().await;
            }
            TransportEvent::Message { topic, payload } => {
                route_message(&dispatcher, topic, payload).await;
            }
        }
    }
    debug!("Transport event channel closed");
}

async fn on_connected<T: Transport + 'static>(ctx: &CommandContext<T>) {
    if ctx.session.mark_connected(Utc::now()) {
        info!("First connection of this process");
    }

    for topic in ctx.routes.topics().await {
        if let Err(e) = ctx.transport.subscribe(&topic).await {
            error!(topic = %topic, error = %e, "Subscribe failed");
        }
    }

    ctx.publish_metadata().await;
    ctx.publish_status(StatusState::Online).await;
    ctx.publish_state().await;
    ctx.publish_cfg().await;
    for (component_id, _) in ctx.components.loaded().await {
        ctx.publish_component_snapshots(&component_id).await;
    }

    ctx.schedulers.start().await;
    let routes = ctx.routes.len().await;
    info!(routes = routes, "Session ready");
}

async fn route_message<T: Transport + 'static>(
    dispatcher: &Dispatcher<T>,
    topic: String,
    payload: Vec<u8>,
) {
    let Some(route) = dispatcher.context().routes.lookup(&topic).await else {
        warn!(topic = %topic, "No route for topic, dropping message");
        return;
    };
    let payload = match String::from_utf8(payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Payload is not UTF-8, dropping message");
            return;
        }
    };
    debug!(topic = %topic, action = route.action(), "Command received");
    dispatcher.submit(route, payload);
}
