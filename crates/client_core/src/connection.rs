//! Lifecycle of the single push connection shared by every realtime feature.
//!
//! [`ConnectionManager::connect`] spawns one background task that owns the
//! transport session. The task walks the transport preference list, counts
//! failed attempts, and gives up at the configured ceiling. Inbound events
//! are handed to the [`EventDispatcher`] in arrival order from that task.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use shared::protocol::ClientEvent;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::EventDispatcher,
    error::TransportError,
    transport::{
        Endpoint, LongPollConnector, TransportConnector, TransportKind, TransportSession,
        WebSocketConnector,
    },
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted; stays here until `connect` is called again.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Failed attempts tolerated before giving up.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the retry that follows `failed_attempts` failures.
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub base_url: String,
    /// Preference order; earlier kinds are tried first on every attempt.
    pub transports: Vec<TransportKind>,
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            base_url: crate::config::DEFAULT_BASE_URL.to_string(),
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            reconnect: ReconnectConfig::default(),
        }
    }
}

type ConnectHook = Arc<dyn Fn(&mpsc::UnboundedSender<ClientEvent>) + Send + Sync>;

struct ConnectionTask {
    generation: u64,
    handle: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct ManagerInner {
    generation: u64,
    task: Option<ConnectionTask>,
    outbound: Option<mpsc::UnboundedSender<ClientEvent>>,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    connectors: Vec<Arc<dyn TransportConnector>>,
    dispatcher: Arc<EventDispatcher>,
    attempts: AtomicU32,
    state_tx: watch::Sender<ConnectionState>,
    connect_hooks: RwLock<Vec<ConnectHook>>,
    inner: Mutex<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        connectors: Vec<Arc<dyn TransportConnector>>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            settings,
            connectors,
            dispatcher,
            attempts: AtomicU32::new(0),
            state_tx,
            connect_hooks: RwLock::new(Vec::new()),
            inner: Mutex::new(ManagerInner::default()),
        })
    }

    /// WebSocket first, long polling as the fallback.
    pub fn with_default_transports(
        settings: ConnectionSettings,
        http: reqwest::Client,
        dispatcher: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        let connectors: Vec<Arc<dyn TransportConnector>> = vec![
            Arc::new(WebSocketConnector),
            Arc::new(LongPollConnector::new(http)),
        ];
        Self::new(settings, connectors, dispatcher)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Registers a callback run on every successful connect, before any
    /// inbound event is delivered. Events sent through the given sender go
    /// out on the fresh session.
    pub fn on_connected<F>(&self, hook: F)
    where
        F: Fn(&mpsc::UnboundedSender<ClientEvent>) + Send + Sync + 'static,
    {
        self.connect_hooks.write().push(Arc::new(hook));
    }

    /// Starts the connection task unless one is already live.
    pub fn connect(self: &Arc<Self>) -> watch::Receiver<ConnectionState> {
        let mut inner = self.inner.lock();
        let live = inner
            .task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished());
        if live && self.state() != ConnectionState::Failed {
            debug!("socket: connect requested while a connection is live");
            return self.state_tx.subscribe();
        }

        inner.generation += 1;
        let generation = inner.generation;
        self.attempts.store(0, Ordering::SeqCst);
        self.state_tx.send_replace(ConnectionState::Connecting);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.run(generation, shutdown_rx).await;
        });
        inner.task = Some(ConnectionTask {
            generation,
            handle,
            shutdown: Some(shutdown_tx),
        });
        self.state_tx.subscribe()
    }

    /// Tears the connection down. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let task = {
            let mut inner = self.inner.lock();
            inner.outbound = None;
            inner.generation += 1;
            self.state_tx.send_replace(ConnectionState::Disconnected);
            inner.task.take()
        };
        self.attempts.store(0, Ordering::SeqCst);

        let Some(mut task) = task else {
            return;
        };
        info!(generation = task.generation, "socket: disconnecting");
        if let Some(shutdown) = task.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task.handle)
            .await
            .is_err()
        {
            warn!("socket: connection task did not stop in time; aborting");
            task.handle.abort();
        }
    }

    /// Fire-and-forget send on the live session. Returns `false` when there is
    /// no connected session; the event is dropped in that case.
    pub fn emit(&self, event: ClientEvent) -> bool {
        let outbound = self.inner.lock().outbound.clone();
        let Some(outbound) = outbound else {
            debug!(event = event.name(), "socket: not connected; dropping outbound event");
            return false;
        };
        let name = event.name();
        if outbound.send(event).is_err() {
            debug!(event = name, "socket: session closed; dropping outbound event");
            return false;
        }
        true
    }

    fn ordered_connectors(&self) -> Result<Vec<Arc<dyn TransportConnector>>, TransportError> {
        let ordered: Vec<_> = if self.settings.transports.is_empty() {
            self.connectors.clone()
        } else {
            self.settings
                .transports
                .iter()
                .flat_map(|kind| {
                    self.connectors
                        .iter()
                        .filter(move |connector| connector.kind() == *kind)
                        .cloned()
                })
                .collect()
        };
        if ordered.is_empty() {
            return Err(TransportError::NoConnectors);
        }
        Ok(ordered)
    }

    /// Publishes `state` only if `generation` is still the live one. The check
    /// and the send happen under one lock so a concurrent `disconnect` cannot
    /// be overwritten.
    fn set_state(&self, generation: u64, state: ConnectionState) {
        let inner = self.inner.lock();
        if inner.generation == generation {
            self.state_tx.send_replace(state);
        }
    }

    fn install_outbound(&self, generation: u64, outbound: Option<mpsc::UnboundedSender<ClientEvent>>) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.outbound = outbound;
        }
    }

    async fn open_first(
        &self,
        endpoint: &Endpoint,
        connectors: &[Arc<dyn TransportConnector>],
    ) -> Option<TransportSession> {
        for connector in connectors {
            match connector.open(endpoint).await {
                Ok(session) => return Some(session),
                Err(err) => {
                    warn!(transport = %connector.kind(), %err, "socket: transport failed to open");
                }
            }
        }
        None
    }

    async fn run(self: Arc<Self>, generation: u64, mut shutdown: oneshot::Receiver<()>) {
        let prepared = Endpoint::from_base_url(&self.settings.base_url)
            .and_then(|endpoint| Ok((endpoint, self.ordered_connectors()?)));
        let (endpoint, connectors) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(%err, transports = ?self.settings.transports, "socket: cannot connect");
                self.set_state(generation, ConnectionState::Failed);
                return;
            }
        };
        let reconnect = self.settings.reconnect.clone();

        loop {
            self.set_state(generation, ConnectionState::Connecting);
            let opened = tokio::select! {
                _ = &mut shutdown => return,
                opened = self.open_first(&endpoint, &connectors) => opened,
            };

            let Some(mut session) = opened else {
                let failed = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if failed >= reconnect.max_attempts {
                    error!(
                        attempts = failed,
                        "socket: giving up after reaching the reconnect ceiling"
                    );
                    self.set_state(generation, ConnectionState::Failed);
                    return;
                }
                let delay = reconnect.delay_for_attempt(failed);
                warn!(
                    attempts = failed,
                    max_attempts = reconnect.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "socket: connect attempt failed; retrying"
                );
                tokio::select! {
                    _ = &mut shutdown => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            };

            self.attempts.store(0, Ordering::SeqCst);
            let outbound = session.sender();
            self.install_outbound(generation, Some(outbound.clone()));
            self.set_state(generation, ConnectionState::Connected);
            info!(transport = %session.kind(), "socket: connected");

            let hooks: Vec<ConnectHook> = self.connect_hooks.read().clone();
            for hook in hooks {
                hook(&outbound);
            }
            drop(outbound);

            let stopped_by_caller = loop {
                tokio::select! {
                    _ = &mut shutdown => break true,
                    event = session.recv() => match event {
                        Some(event) => {
                            self.dispatcher.dispatch(&event);
                        }
                        None => break false,
                    },
                }
            };

            self.install_outbound(generation, None);
            if stopped_by_caller {
                session.close().await;
                return;
            }

            drop(session);
            warn!("socket: transport dropped unexpectedly; reconnecting");
            self.set_state(generation, ConnectionState::Connecting);
            tokio::select! {
                _ = &mut shutdown => return,
                _ = tokio::time::sleep(reconnect.delay_for_attempt(0)) => {}
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
