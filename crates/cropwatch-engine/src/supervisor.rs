//! Channel lifecycle supervision and the engine's service lifecycle.
//!
//! One long-lived task owns the channel and the telemetry store: it
//! connects, subscribes the store's ingestion to the push topics, polls
//! connection health, reconnects with the transport's own backoff, and
//! rescopes the live view when the session identity changes. Because
//! every event funnels through the same `select!` loop, two ingests can
//! never interleave and teardown drops the subscriptions and timers
//! together.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use cropwatch_channel::{ChannelError, PushMessage, TopicSubscription};
use cropwatch_core::{AlertThreshold, Reading, SensorAlert, SensorKind};

use crate::cache::SnapshotStore;
use crate::error::{EngineError, Result};
use crate::facade::QueryFacade;
use crate::identity::{CacheScope, IdentityProvider, resolve_user_id};
use crate::store::{HISTORY_CAPACITY, TelemetryStore};
use crate::synth::HistorySynthesizer;

/// Push topics the engine claims on the channel.
const PUSH_TOPICS: [&str; 9] = [
    "sensor_data",
    "thresholds_data",
    "sensor_alert",
    "request_completed",
    "system",
    "welcome",
    "pong",
    "subscribed",
    "unsubscribed",
];

/// Interface boundary to the duplex transport collaborator.
///
/// Auth handshakes, token refresh and retry caps live behind this trait;
/// the engine only drives the lifecycle and consumes decoded messages.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn connect(&self) -> cropwatch_channel::Result<()>;
    async fn disconnect(&self) -> cropwatch_channel::Result<()>;
    async fn is_connected(&self) -> bool;
    async fn subscribe(&self, subscription: TopicSubscription);
    async fn unsubscribe(&self, topic: &str);
    /// Returns `Ok(false)` when the transport throttled the request.
    async fn request_sensor_data(&self, manual: bool) -> cropwatch_channel::Result<bool>;
    /// Returns `Ok(false)` when the transport throttled the request.
    async fn request_thresholds(&self) -> cropwatch_channel::Result<bool>;
    async fn ping(&self) -> cropwatch_channel::Result<()>;
}

/// Engine behavior knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on the in-memory history buffer.
    pub history_capacity: usize,
    /// Spacing of the connection health poll.
    pub health_interval: Duration,
    /// How long a transient connection error stays visible.
    pub error_clear_after: Duration,
    /// Pause between rescoping state and reconnecting on identity change.
    pub identity_grace: Duration,
    /// Prime thresholds and sensor data after every (re)connect.
    pub prime_on_connect: bool,
    /// Open the channel for unauthenticated sessions too.
    pub connect_as_guest: bool,
    /// Perturb a fraction of repeat updates, for demo installations.
    pub simulate_noise: bool,
    /// Snapshot directory override; platform data dir when unset.
    pub cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: HISTORY_CAPACITY,
            health_interval: Duration::from_secs(5),
            error_clear_after: Duration::from_secs(30),
            identity_grace: Duration::from_secs(1),
            prime_on_connect: true,
            connect_as_guest: true,
            simulate_noise: false,
            cache_dir: None,
        }
    }
}

enum Command {
    Refresh,
    ToggleConnection,
    Shutdown,
}

struct EngineState {
    store: TelemetryStore,
    facade: QueryFacade,
    connected: bool,
    connection_error: Option<String>,
    paused: bool,
}

/// Constructor namespace for the engine service.
pub struct SyncEngine;

impl SyncEngine {
    /// Start the supervisor task and return the consumer handle.
    pub fn start(
        channel: Arc<dyn Channel>,
        identity: Arc<dyn IdentityProvider>,
        config: EngineConfig,
    ) -> EngineHandle {
        Self::start_with_alerts(channel, identity, config, None)
    }

    /// Start the supervisor task, forwarding `sensor_alert` events into the
    /// given sink (the external notification collaborator).
    pub fn start_with_alerts(
        channel: Arc<dyn Channel>,
        identity: Arc<dyn IdentityProvider>,
        config: EngineConfig,
        alert_tx: Option<mpsc::Sender<SensorAlert>>,
    ) -> EngineHandle {
        let scope = CacheScope::from_user(resolve_user_id(identity.as_ref()));
        let snapshots = match &config.cache_dir {
            Some(dir) => SnapshotStore::open(dir.clone()),
            None => SnapshotStore::open_default(),
        };
        let store = TelemetryStore::open(
            scope,
            snapshots,
            HistorySynthesizer::from_entropy(),
            config.history_capacity,
            config.simulate_noise,
        );

        let state = Arc::new(Mutex::new(EngineState {
            store,
            facade: QueryFacade::default(),
            connected: false,
            connection_error: None,
            paused: false,
        }));
        let (command_tx, command_rx) = mpsc::channel(16);
        let (push_tx, push_rx) = mpsc::channel(256);

        let supervisor = Supervisor {
            channel,
            identity,
            config,
            state: Arc::clone(&state),
            push_tx,
            push_rx,
            command_rx,
            alert_tx,
            error_expires_at: None,
        };
        let task = tokio::spawn(supervisor.run());

        EngineHandle {
            state,
            command_tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

struct Supervisor {
    channel: Arc<dyn Channel>,
    identity: Arc<dyn IdentityProvider>,
    config: EngineConfig,
    state: Arc<Mutex<EngineState>>,
    push_tx: mpsc::Sender<PushMessage>,
    push_rx: mpsc::Receiver<PushMessage>,
    command_rx: mpsc::Receiver<Command>,
    alert_tx: Option<mpsc::Sender<SensorAlert>>,
    error_expires_at: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self) {
        for topic in PUSH_TOPICS {
            self.channel
                .subscribe(TopicSubscription::with_sender(topic, self.push_tx.clone()))
                .await;
        }
        if self.should_connect() {
            self.try_connect().await;
        }

        let mut health = time::interval(self.config.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval's first tick completes immediately; consume it so the
        // poll cadence starts one full period from now.
        health.tick().await;

        loop {
            let error_deadline = self
                .error_expires_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                Some(message) = self.push_rx.recv() => self.handle_push(message),
                Some(command) = self.command_rx.recv() => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                _ = health.tick() => self.health_check().await,
                () = time::sleep_until(error_deadline), if self.error_expires_at.is_some() => {
                    self.error_expires_at = None;
                    self.state().connection_error = None;
                    debug!("transient connection error expired");
                }
            }
        }

        self.teardown().await;
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_connect(&self) -> bool {
        if self.state().paused {
            return false;
        }
        self.identity.is_authenticated() || self.config.connect_as_guest
    }

    fn handle_push(&mut self, message: PushMessage) {
        match message {
            PushMessage::SensorData(reading) => {
                let outcome = self.state().store.ingest(reading);
                debug!("reading processed: {:?}", outcome);
            }
            PushMessage::ThresholdsData(thresholds) => {
                info!("applying {} alert thresholds", thresholds.len());
                self.state().store.apply_thresholds(thresholds);
            }
            PushMessage::SensorAlert(alert) => match &self.alert_tx {
                Some(alert_tx) => {
                    if let Err(error) = alert_tx.try_send(alert) {
                        warn!("alert sink unavailable: {}", error);
                    }
                }
                None => warn!("sensor alert: {}", alert.message),
            },
            PushMessage::RequestCompleted(receipt) => {
                debug!("request completed: {} ({})", receipt.message, receipt.status);
            }
            PushMessage::System(notice) => {
                if notice.is_error() {
                    warn!("server notice: {}", notice.message);
                } else {
                    debug!("server notice: {}", notice.message);
                }
            }
            PushMessage::Welcome(welcome) => {
                info!(
                    "channel ready (user {:?}, groups {:?})",
                    welcome.user_id, welcome.groups
                );
            }
            PushMessage::Pong { .. } => debug!("keepalive pong"),
            PushMessage::Subscribed { groups } => debug!("joined groups {:?}", groups),
            PushMessage::Unsubscribed { groups } => debug!("left groups {:?}", groups),
        }
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Shutdown => false,
            Command::Refresh => {
                match self.channel.request_sensor_data(true).await {
                    Ok(true) => debug!("manual refresh requested"),
                    Ok(false) => debug!("manual refresh coalesced by transport throttle"),
                    Err(error) => self.record_error(format!("refresh failed: {error}")),
                }
                true
            }
            Command::ToggleConnection => {
                let paused = {
                    let mut state = self.state();
                    state.paused = !state.paused;
                    state.paused
                };
                if paused {
                    if let Err(error) = self.channel.disconnect().await {
                        debug!("disconnect on pause: {}", error);
                    }
                    self.state().connected = false;
                    info!("channel paused by consumer");
                } else if self.should_connect() {
                    info!("channel resumed by consumer");
                    self.try_connect().await;
                }
                true
            }
        }
    }

    async fn health_check(&mut self) {
        let scope = CacheScope::from_user(resolve_user_id(self.identity.as_ref()));
        if scope != self.state().store.scope() {
            self.switch_identity(scope).await;
            return;
        }

        let connected = self.channel.is_connected().await;
        let paused = {
            let mut state = self.state();
            state.connected = connected;
            state.paused
        };
        if paused {
            return;
        }

        if connected {
            if let Err(error) = self.channel.ping().await {
                debug!("keepalive ping failed: {}", error);
            }
        } else if self.should_connect() {
            self.try_connect().await;
        }
    }

    /// Identity changed underneath us: drop the socket, swap the live view
    /// for the new identity's snapshots, then reconnect after a short grace
    /// period so the old session's frames cannot land in the new cache.
    async fn switch_identity(&mut self, scope: CacheScope) {
        info!("identity changed, rescoping to {}", scope);
        if let Err(error) = self.channel.disconnect().await {
            debug!("disconnect during rescope: {}", error);
        }
        {
            let mut state = self.state();
            state.connected = false;
            state.connection_error = None;
            state.store.reset(scope);
        }
        self.error_expires_at = None;

        time::sleep(self.config.identity_grace).await;
        if self.should_connect() {
            self.try_connect().await;
        }
    }

    async fn try_connect(&mut self) {
        match self.channel.connect().await {
            Ok(()) => {
                {
                    let mut state = self.state();
                    state.connected = true;
                    state.connection_error = None;
                }
                self.error_expires_at = None;
                info!("channel connected");
                if self.config.prime_on_connect {
                    self.prime().await;
                }
            }
            Err(ChannelError::AlreadyConnected) => {
                self.state().connected = true;
            }
            Err(error) => self.record_error(format!("connection failed: {error}")),
        }
    }

    /// One-shot state priming after a (re)connect; the transport's own
    /// request throttle decides whether the frames actually go out.
    async fn prime(&mut self) {
        if let Err(error) = self.channel.request_thresholds().await {
            debug!("threshold priming skipped: {}", error);
        }
        if let Err(error) = self.channel.request_sensor_data(false).await {
            debug!("sensor data priming skipped: {}", error);
        }
    }

    fn record_error(&mut self, message: String) {
        warn!("{}", message);
        {
            let mut state = self.state();
            state.connected = false;
            state.connection_error = Some(message);
        }
        self.error_expires_at = Some(Instant::now() + self.config.error_clear_after);
    }

    async fn teardown(&mut self) {
        for topic in PUSH_TOPICS {
            self.channel.unsubscribe(topic).await;
        }
        if let Err(error) = self.channel.disconnect().await {
            debug!("disconnect on shutdown: {}", error);
        }
        self.state().connected = false;
        info!("engine disposed");
    }
}

/// Clonable consumer handle over the running engine.
///
/// Reads return snapshots; the supervisor task keeps exclusive ownership
/// of the underlying state.
#[derive(Clone)]
pub struct EngineHandle {
    state: Arc<Mutex<EngineState>>,
    command_tx: mpsc::Sender<Command>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest accepted reading per sensor.
    pub fn latest(&self) -> std::collections::HashMap<String, Reading> {
        self.state().store.latest().clone()
    }

    /// Rolling history across all sensors, oldest first.
    pub fn history(&self) -> Vec<Reading> {
        self.state().store.history().cloned().collect()
    }

    /// History of one sensor, oldest first.
    pub fn sensor_history(&self, sensor_id: &str) -> Vec<Reading> {
        self.state().store.sensor_history(sensor_id)
    }

    /// Distinct-sensor counts per kind.
    pub fn counts(&self) -> std::collections::HashMap<SensorKind, usize> {
        self.state().store.counts().clone()
    }

    /// Active alert thresholds per kind.
    pub fn thresholds(&self) -> std::collections::HashMap<SensorKind, AlertThreshold> {
        self.state().store.thresholds().clone()
    }

    /// Latest readings grouped by sensor kind.
    pub fn by_kind(&self) -> std::collections::HashMap<SensorKind, Vec<Reading>> {
        let mut state = self.state();
        let state = &mut *state;
        state.facade.refresh(&state.store);
        state.facade.by_kind().clone()
    }

    /// Latest readings grouped by location.
    pub fn by_location(&self) -> std::collections::HashMap<String, Vec<Reading>> {
        let mut state = self.state();
        let state = &mut *state;
        state.facade.refresh(&state.store);
        state.facade.by_location().clone()
    }

    /// Latest readings of one kind.
    pub fn of_kind(&self, kind: SensorKind) -> Vec<Reading> {
        let mut state = self.state();
        let state = &mut *state;
        state.facade.refresh(&state.store);
        state.facade.of_kind(kind).to_vec()
    }

    /// Latest readings at one location.
    pub fn at_location(&self, location_id: &str) -> Vec<Reading> {
        let mut state = self.state();
        let state = &mut *state;
        state.facade.refresh(&state.store);
        state.facade.at_location(location_id).to_vec()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Transient connection error, if one is currently visible.
    pub fn connection_error(&self) -> Option<String> {
        self.state().connection_error.clone()
    }

    /// Ask the server for a fresh data push.
    pub async fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh).await
    }

    /// Pause or resume the channel.
    pub async fn toggle_connection(&self) -> Result<()> {
        self.send(Command::ToggleConnection).await
    }

    /// Dispose the engine: unsubscribe, disconnect and stop all timers.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await?;
        let task = {
            self.task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        };
        if let Some(task) = task
            && let Err(error) = task.await
        {
            debug!("supervisor task ended abnormally: {}", error);
        }
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| EngineError::Disposed)
    }
}
