use crate::config::ChannelConfig;
use crate::connection::{BackoffPolicy, Connection, ConnectionState, Recovery};
use crate::connector::{Connector, Socket};
use deck_core::protocol::{decode_frame, encode_envelope, Envelope, MessageKind};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged {
        state: ConnectionState,
        generation: u64,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Decoded envelopes from one frame, in wire order. Never contains heartbeats.
    Envelopes(Vec<Envelope>),
    GaveUp {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportOptions {
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
    pub max_frame_bytes: usize,
}

impl From<&ChannelConfig> for TransportOptions {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            backoff: BackoffPolicy::from(&config.reconnect),
            heartbeat_interval: config.heartbeat.interval(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

/// Reconnecting, heartbeat-monitored socket to one agent endpoint.
///
/// Cloning yields another handle to the same connection. Background tasks
/// hold weak references, so dropping every handle tears the connection down.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    options: TransportOptions,
    events: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<Inner>,
}

struct Inner {
    connection: Connection,
    address: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    connect_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl Inner {
    fn abort_timers(&mut self) {
        for task in [
            self.connect_task.take(),
            self.heartbeat_task.take(),
            self.reconnect_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.connection.close();
        inner.outbound = None;
        inner.abort_timers();
    }
}

impl Transport {
    pub fn new(
        connector: Arc<dyn Connector>,
        options: TransportOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                options,
                events,
                inner: Mutex::new(Inner {
                    connection: Connection::new(options.backoff),
                    address: None,
                    outbound: None,
                    connect_task: None,
                    heartbeat_task: None,
                    reconnect_task: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.lock().connection.attempts()
    }

    pub fn generation(&self) -> u64 {
        self.lock().connection.generation()
    }

    /// Begins connecting. No-op while connecting or connected to `address`;
    /// a different address replaces the current connection.
    pub fn open(&self, address: &str) {
        let mut inner = self.lock();
        if inner.address.as_deref() != Some(address) {
            if inner.address.is_some() {
                self.teardown(&mut inner);
            }
            inner.address = Some(address.to_string());
        }
        let Some(generation) = inner.connection.open() else {
            debug!(event = "deck_open_ignored", state = %inner.connection.state());
            return;
        };
        if let Some(task) = inner.reconnect_task.take() {
            task.abort();
        }
        info!(event = "deck_connecting", address, generation);
        self.emit(TransportEvent::StateChanged {
            state: ConnectionState::Connecting,
            generation,
        });
        self.spawn_connect(&mut inner, generation, address.to_string());
    }

    /// Best-effort send. Returns `false` when the envelope was dropped.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let inner = self.lock();
        if inner.connection.state() != ConnectionState::Connected {
            debug!(event = "deck_send_dropped", kind = %envelope.kind, state = %inner.connection.state());
            return false;
        }
        let Some(outbound) = inner.outbound.as_ref() else {
            return false;
        };
        match encode_envelope(envelope, self.shared.options.max_frame_bytes) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(err) => {
                warn!(event = "deck_encode_error", kind = %envelope.kind, error = %err);
                false
            }
        }
    }

    /// Disables auto-reconnect and drops the socket. Callbacks from earlier
    /// generations become no-ops.
    pub fn close(&self) {
        let mut inner = self.lock();
        let generation = self.teardown(&mut inner);
        info!(event = "deck_closed", generation);
        self.emit(TransportEvent::StateChanged {
            state: ConnectionState::Disconnected,
            generation,
        });
    }

    fn teardown(&self, inner: &mut Inner) -> u64 {
        let generation = inner.connection.close();
        inner.outbound = None;
        inner.abort_timers();
        generation
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.shared.events.send(event);
    }

    fn spawn_connect(&self, inner: &mut Inner, generation: u64, address: String) {
        let weak = self.downgrade();
        let connector = self.shared.connector.clone();
        inner.connect_task = Some(tokio::spawn(async move {
            let result = connector.connect(&address).await;
            let Some(transport) = Transport::upgrade(&weak) else {
                return;
            };
            match result {
                Ok(socket) => transport.on_connected(generation, socket),
                Err(err) => {
                    warn!(event = "deck_connect_error", address = %address, generation, error = %err);
                    transport.on_socket_closed(generation);
                }
            }
        }));
    }

    fn on_connected(&self, generation: u64, socket: Socket) {
        let mut inner = self.lock();
        if !inner.connection.on_connected(generation) {
            debug!(event = "deck_stale_socket", generation);
            return;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        inner.outbound = Some(outbound_tx);
        tokio::spawn(run_socket(self.downgrade(), generation, socket, outbound_rx));
        inner.heartbeat_task = Some(tokio::spawn(run_heartbeat(
            self.downgrade(),
            generation,
            self.shared.options.heartbeat_interval,
        )));

        info!(event = "deck_connected", generation);
        self.emit(TransportEvent::StateChanged {
            state: ConnectionState::Connected,
            generation,
        });
    }

    fn on_socket_closed(&self, generation: u64) {
        let mut inner = self.lock();
        let Some(recovery) = inner.connection.on_disconnected(generation) else {
            return;
        };
        inner.outbound = None;
        if let Some(task) = inner.heartbeat_task.take() {
            task.abort();
        }
        self.emit(TransportEvent::StateChanged {
            state: ConnectionState::Disconnected,
            generation,
        });

        match recovery {
            Recovery::Reconnect { attempt, delay } => {
                warn!(
                    event = "deck_reconnect_scheduled",
                    generation,
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
                self.emit(TransportEvent::StateChanged {
                    state: ConnectionState::Reconnecting,
                    generation,
                });
                self.emit(TransportEvent::Reconnecting { attempt, delay });
                let weak = self.downgrade();
                inner.reconnect_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(transport) = Transport::upgrade(&weak) {
                        transport.on_reconnect_due(generation);
                    }
                }));
            }
            Recovery::GiveUp { attempts } => {
                warn!(event = "deck_reconnect_gave_up", generation, attempts);
                self.emit(TransportEvent::GaveUp { attempts });
            }
        }
    }

    fn on_reconnect_due(&self, generation: u64) {
        let mut inner = self.lock();
        let Some(next) = inner.connection.on_reconnect_due(generation) else {
            return;
        };
        let Some(address) = inner.address.clone() else {
            return;
        };
        self.emit(TransportEvent::StateChanged {
            state: ConnectionState::Connecting,
            generation: next,
        });
        self.spawn_connect(&mut inner, next, address);
    }

    fn on_frame(&self, generation: u64, frame: &[u8]) {
        let report = decode_frame(frame, self.shared.options.max_frame_bytes);
        for err in &report.errors {
            warn!(event = "deck_decode_error", generation, error = %err);
        }

        let mut forward = Vec::with_capacity(report.envelopes.len());
        let mut answer_ping = false;
        for envelope in report.envelopes {
            match envelope.message_kind() {
                Some(MessageKind::Pong) => {}
                Some(MessageKind::Ping) => answer_ping = true,
                Some(_) => forward.push(envelope),
                None => debug!(event = "deck_unknown_type", generation, kind = %envelope.kind),
            }
        }

        let inner = self.lock();
        if !inner.connection.is_current(generation)
            || inner.connection.state() != ConnectionState::Connected
        {
            return;
        }
        if answer_ping {
            if let Some(outbound) = inner.outbound.as_ref() {
                if let Ok(text) = encode_envelope(&Envelope::pong(), self.shared.options.max_frame_bytes) {
                    let _ = outbound.send(text);
                }
            }
        }
        if !forward.is_empty() {
            self.emit(TransportEvent::Envelopes(forward));
        }
    }

    /// Returns `false` once the heartbeat's generation is gone.
    fn send_heartbeat(&self, generation: u64) -> bool {
        let inner = self.lock();
        if !inner.connection.is_current(generation) {
            return false;
        }
        if let Some(outbound) = inner.outbound.as_ref() {
            match encode_envelope(&Envelope::ping(), self.shared.options.max_frame_bytes) {
                Ok(text) => {
                    if outbound.send(text).is_err() {
                        debug!(event = "deck_heartbeat_send_failed", generation);
                    }
                }
                Err(err) => warn!(event = "deck_encode_error", kind = "ping", error = %err),
            }
        }
        true
    }
}

async fn run_socket(
    weak: Weak<Shared>,
    generation: u64,
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let Socket {
        mut sink,
        mut stream,
    } = socket;
    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(frame)) => {
                        let Some(transport) = Transport::upgrade(&weak) else {
                            break;
                        };
                        transport.on_frame(generation, &frame);
                    }
                    Some(Err(err)) => {
                        warn!(event = "deck_socket_read_error", generation, error = %err);
                        break;
                    }
                    None => break,
                }
            }
            out = outbound.recv() => {
                match out {
                    Some(text) => {
                        if let Err(err) = sink.send(text).await {
                            warn!(event = "deck_socket_write_error", generation, error = %err);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    let _ = sink.close().await;
    if let Some(transport) = Transport::upgrade(&weak) {
        transport.on_socket_closed(generation);
    }
}

async fn run_heartbeat(weak: Weak<Shared>, generation: u64, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(transport) = Transport::upgrade(&weak) else {
            break;
        };
        if !transport.send_heartbeat(generation) {
            break;
        }
    }
}
