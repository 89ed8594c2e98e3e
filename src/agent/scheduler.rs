//! Heartbeat and telemetry loops
//!
//! Both are [`PeriodicTask`]s: a tokio interval raced against a watch stop
//! channel. Stopping signals the channel and joins with a bounded wait, so
//! a stuck publish can never hang shutdown.

use super::session::SessionClock;
use super::telemetry::TelemetryGate;
use crate::commands::context::{publish_json, RuntimeSettings};
use crate::protocol::messages::{StatusState, TelemetrySample};
use crate::protocol::snapshots::{build_status, MetricsSampler};
use crate::protocol::topics::TopicSchema;
use crate::storage::ConfigStore;
use crate::transport::{Delivery, Transport};
use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A cancellable loop calling `tick` every `period`
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// With `skip_first`, the first tick fires after one period instead of immediately
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, skip_first: bool, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if skip_first {
                interval.tick().await;
            }
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(task = name, "Periodic task exited");
        });
        Self { name, stop, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal and join, aborting after [`STOP_JOIN_TIMEOUT`]
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let mut handle = self.handle;
        match tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => debug!(task = self.name, "Periodic task stopped"),
            Ok(Err(e)) => warn!(task = self.name, error = %e, "Periodic task ended abnormally"),
            Err(_) => {
                warn!(task = self.name, "Periodic task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    started: bool,
    heartbeat: Option<PeriodicTask>,
    telemetry: Option<PeriodicTask>,
}

/// Owns the heartbeat and telemetry loops for one connection
pub struct Schedulers<T: Transport + 'static> {
    transport: Arc<T>,
    topics: TopicSchema,
    session: Arc<SessionClock>,
    config_store: Arc<ConfigStore>,
    sampler: Arc<MetricsSampler>,
    bootstrap_heartbeat_s: u64,
    telemetry_tick: Duration,
    gate: Arc<StdMutex<TelemetryGate>>,
    state: Mutex<SchedulerState>,
}

impl<T: Transport + 'static> std::fmt::Debug for Schedulers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedulers")
            .field("bootstrap_heartbeat_s", &self.bootstrap_heartbeat_s)
            .field("telemetry_tick", &self.telemetry_tick)
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> Schedulers<T> {
    pub fn new(
        transport: Arc<T>,
        topics: TopicSchema,
        session: Arc<SessionClock>,
        config_store: Arc<ConfigStore>,
        sampler: Arc<MetricsSampler>,
        settings: &RuntimeSettings,
    ) -> Self {
        Self {
            transport,
            topics,
            session,
            config_store,
            sampler,
            bootstrap_heartbeat_s: settings.bootstrap_heartbeat_s,
            telemetry_tick: settings.telemetry_tick,
            gate: Arc::new(StdMutex::new(TelemetryGate::new())),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Runtime config `heartbeat_s`, else the bootstrap value; `0` disables
    pub fn heartbeat_interval_s(&self) -> u64 {
        self.config_store
            .heartbeat_s()
            .unwrap_or(self.bootstrap_heartbeat_s)
    }

    /// Start both loops. Calling it while started is a no-op.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.started {
            return;
        }
        state.started = true;
        state.heartbeat = self.spawn_heartbeat();
        state.telemetry = Some(self.spawn_telemetry());
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.started = false;
        if let Some(task) = state.heartbeat.take() {
            task.stop().await;
        }
        if let Some(task) = state.telemetry.take() {
            task.stop().await;
        }
    }

    /// Pick up a new heartbeat interval. Ignored while stopped.
    pub async fn restart_heartbeat(&self) {
        let mut state = self.state.lock().await;
        if !state.started {
            return;
        }
        if let Some(task) = state.heartbeat.take() {
            task.stop().await;
        }
        state.heartbeat = self.spawn_heartbeat();
    }

    pub async fn heartbeat_running(&self) -> bool {
        self.state
            .lock()
            .await
            .heartbeat
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub async fn telemetry_running(&self) -> bool {
        self.state
            .lock()
            .await
            .telemetry
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn spawn_heartbeat(&self) -> Option<PeriodicTask> {
        let interval_s = self.heartbeat_interval_s();
        if interval_s == 0 {
            info!("Heartbeat disabled");
            return None;
        }
        info!(interval_s, "Heartbeat started");

        let transport = self.transport.clone();
        let session = self.session.clone();
        let topic = self.topics.status();
        Some(PeriodicTask::spawn(
            "heartbeat",
            Duration::from_secs(interval_s),
            true,
            move || {
                let transport = transport.clone();
                let session = session.clone();
                let topic = topic.clone();
                async move {
                    let status = build_status(StatusState::Online, session.connected_since(), Utc::now());
                    publish_json(transport.as_ref(), &topic, &status, true, Delivery::AtLeastOnce).await;
                }
            },
        ))
    }

    fn spawn_telemetry(&self) -> PeriodicTask {
        let transport = self.transport.clone();
        let topics = self.topics.clone();
        let config_store = self.config_store.clone();
        let sampler = self.sampler.clone();
        let gate = self.gate.clone();
        PeriodicTask::spawn("telemetry", self.telemetry_tick, false, move || {
            let transport = transport.clone();
            let topics = topics.clone();
            let config_store = config_store.clone();
            let sampler = sampler.clone();
            let gate = gate.clone();
            async move {
                let settings = config_store.telemetry();
                if !settings.enabled {
                    return;
                }
                let Ok(metrics) = tokio::task::spawn_blocking(move || sampler.sample()).await else {
                    return;
                };
                let due = match gate.lock() {
                    Ok(mut gate) => gate.select(&settings, &metrics, Instant::now()),
                    Err(_) => return,
                };
                for (metric, value) in due {
                    let Ok(topic) = topics.telemetry(metric) else {
                        continue;
                    };
                    let sample = TelemetrySample {
                        value,
                        ts: Utc::now(),
                    };
                    publish_json(transport.as_ref(), &topic, &sample, false, Delivery::AtMostOnce).await;
                }
            }
        })
    }
}
