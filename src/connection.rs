//! Connection manager: the single persistent transport per client session.
//!
//! Owns the WebSocket lifecycle and everything attached to it:
//! - connect / disconnect / reconnect state machine
//! - heartbeat ping with a liveness window (the sole detector of
//!   silent transport failures)
//! - exponential-backoff reconnection, capped, terminal `Failed` state
//! - FIFO outbound queue drained in enqueue order on reconnect
//!
//! State machine:
//! ```text
//! Disconnected → Connecting → Connected
//!                     ▲            │ (lost)
//!                     │            ▼
//!                     └─────── Reconnecting ──(cap exceeded)──► Failed
//! ```
//! `disconnect()` is reachable from every state and returns to
//! `Disconnected`, cancelling all pending timers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::events::{EventBus, Subscription};
use crate::protocol::Envelope;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnection attempts exhausted; a manual `connect()` is required.
    Failed,
}

/// Connection manager tunables.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint
    pub url: String,
    /// Ping cadence once connected
    pub heartbeat_interval: Duration,
    /// No inbound frame for this long ⇒ connection declared lost
    pub liveness_timeout: Duration,
    /// First reconnect delay; doubles per attempt
    pub reconnect_base_delay: Duration,
    /// Reconnect attempts before the terminal `Failed` state
    pub max_reconnect_attempts: u32,
    /// Inbound event bus capacity per subscriber
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
            reconnect_base_delay: Duration::from_millis(500),
            max_reconnect_attempts: 8,
            event_capacity: 256,
        }
    }
}

/// Connection-level errors.
#[derive(Debug, Clone)]
pub enum ConnectionError {
    /// Transport error, auth rejection, or malformed endpoint
    ConnectionFailed(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(e) => write!(f, "connection failed: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Outbound queue for frames submitted while the transport is down.
///
/// Unbounded but monitored; drained strictly in enqueue order when the
/// connection comes back.
pub struct OutboundQueue {
    queue: VecDeque<Envelope>,
    queued_bytes: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    /// Append a frame for later delivery.
    pub fn enqueue(&mut self, env: Envelope) {
        self.queued_bytes += env.payload.len();
        self.queue.push_back(env);
    }

    /// Remove all queued frames, preserving enqueue order.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.queued_bytes = 0;
        self.queue.drain(..).collect()
    }

    /// Flush every queued frame into the writer channel in FIFO order.
    ///
    /// If the channel closes mid-replay, the frame that failed and all
    /// frames behind it stay queued for the next attempt.
    pub async fn replay_into(
        &mut self,
        tx: &mpsc::Sender<Envelope>,
    ) -> Result<usize, ConnectionError> {
        let mut sent = 0;
        while let Some(env) = self.queue.pop_front() {
            self.queued_bytes -= env.payload.len();
            if let Err(mpsc::error::SendError(env)) = tx.send(env).await {
                self.queued_bytes += env.payload.len();
                self.queue.push_front(env);
                return Err(ConnectionError::ConnectionFailed(
                    "transport closed during queue replay".into(),
                ));
            }
            sent += 1;
        }
        Ok(sent)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total payload bytes awaiting delivery.
    pub fn total_bytes(&self) -> usize {
        self.queued_bytes
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    config: ConnectionConfig,
    client_id: Uuid,
    state_tx: watch::Sender<ConnectionState>,
    queue: Mutex<OutboundQueue>,
    /// Sender into the writer task; present only while a socket is up
    outgoing: RwLock<Option<mpsc::Sender<Envelope>>>,
    inbound: EventBus<Envelope>,
    /// Last time any frame arrived (liveness signal)
    last_inbound: Mutex<Instant>,
    /// Reader/writer/heartbeat handles for the current socket
    socket_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes connection attempts
    connect_gate: Mutex<()>,
    /// Wakes the reconnect supervisor
    lost_tx: mpsc::Sender<()>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state() != state {
            log::debug!("connection state → {state:?}");
        }
        // send_replace stores the value even with no receivers; a plain
        // send would silently drop the transition when nobody watches.
        self.state_tx.send_replace(state);
    }

    /// Abort the reader/writer/heartbeat tasks of the current socket.
    async fn abort_socket_tasks(&self) {
        let mut tasks = self.socket_tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
        *self.outgoing.write().await = None;
    }

    /// One transport attempt. Caller holds `connect_gate` and has set
    /// the state to `Connecting`.
    async fn connect_once(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.url)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        self.abort_socket_tasks().await;
        *self.last_inbound.lock().await = Instant::now();

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(256);

        // Writer task: encode and forward outgoing frames.
        let writer = tokio::spawn(async move {
            while let Some(env) = out_rx.recv().await {
                let bytes = match env.encode() {
                    Ok(b) => b,
                    Err(e) => {
                        log::warn!("dropping unencodable outbound frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: decode inbound frames, track liveness, fan out.
        let shared = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        *shared.last_inbound.lock().await = Instant::now();
                        match Envelope::decode(&bytes) {
                            Ok(env) => {
                                if env.kind == crate::protocol::EventKind::Pong {
                                    // Liveness only; not delivered to consumers
                                    continue;
                                }
                                shared.inbound.publish(env);
                            }
                            Err(e) => {
                                // Malformed frames never crash the connection
                                // and are never surfaced to consumers.
                                log::warn!("dropping malformed inbound frame: {e}");
                            }
                        }
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                        *shared.last_inbound.lock().await = Instant::now();
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            shared.on_transport_lost().await;
        });

        // Heartbeat task: ping on a fixed cadence, watch the liveness window.
        let shared = Arc::clone(self);
        let hb_tx = out_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shared.state() != ConnectionState::Connected {
                    continue;
                }
                let silent_for = shared.last_inbound.lock().await.elapsed();
                if silent_for > shared.config.liveness_timeout {
                    log::warn!(
                        "no liveness signal for {silent_for:?}, declaring connection lost"
                    );
                    shared.on_transport_lost().await;
                    return;
                }
                let _ = hb_tx.send(Envelope::ping(shared.client_id)).await;
            }
        });

        {
            let mut tasks = self.socket_tasks.lock().await;
            tasks.push(writer);
            tasks.push(reader);
            tasks.push(heartbeat);
        }

        // Drain the offline queue in FIFO order before new traffic can
        // observe the connected state.
        {
            let mut queue = self.queue.lock().await;
            if !queue.is_empty() {
                log::info!("replaying {} queued frames", queue.len());
            }
            queue.replay_into(&out_tx).await?;
            *self.outgoing.write().await = Some(out_tx);
        }

        self.set_state(ConnectionState::Connected);
        log::info!("connected to {}", self.config.url);
        Ok(())
    }

    /// Unexpected transport loss: enter `Reconnecting` and wake the
    /// supervisor. A deliberate `disconnect()` does not pass through here.
    async fn on_transport_lost(&self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        *self.outgoing.write().await = None;
        self.set_state(ConnectionState::Reconnecting);
        let _ = self.lost_tx.try_send(());
    }
}

/// Cloneable handle for engines to submit frames and observe state.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Transmit immediately when connected, queue otherwise.
    ///
    /// Returns without waiting for delivery; queued frames are flushed
    /// in FIFO order on reconnect.
    pub async fn send(&self, env: Envelope) {
        if self.shared.state() == ConnectionState::Connected {
            let outgoing = self.shared.outgoing.read().await;
            if let Some(tx) = outgoing.as_ref() {
                if tx.send(env.clone()).await.is_ok() {
                    return;
                }
            }
            drop(outgoing);
        }
        self.shared.queue.lock().await.enqueue(env);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch channel mirroring every state transition.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to inbound envelopes.
    pub fn inbound(&self) -> Subscription<Envelope> {
        self.shared.inbound.subscribe()
    }

    pub async fn queue_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    pub async fn queued_bytes(&self) -> usize {
        self.shared.queue.lock().await.total_bytes()
    }

    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }
}

/// The connection manager. One per client session.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a manager for the given user identity. Does not connect.
    pub fn new(client_id: Uuid, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (lost_tx, lost_rx) = mpsc::channel(1);
        let event_capacity = config.event_capacity;

        let shared = Arc::new(Shared {
            config,
            client_id,
            state_tx,
            queue: Mutex::new(OutboundQueue::new()),
            outgoing: RwLock::new(None),
            inbound: EventBus::new(event_capacity),
            last_inbound: Mutex::new(Instant::now()),
            socket_tasks: Mutex::new(Vec::new()),
            connect_gate: Mutex::new(()),
            lost_tx,
        });

        let supervisor = tokio::spawn(Self::supervise(Arc::clone(&shared), lost_rx));

        Self { shared, supervisor }
    }

    /// Reconnect supervisor: waits for loss signals and retries with
    /// exponential backoff until success, cancellation, or the cap.
    async fn supervise(shared: Arc<Shared>, mut lost_rx: mpsc::Receiver<()>) {
        while lost_rx.recv().await.is_some() {
            let mut delay = shared.config.reconnect_base_delay;
            let mut attempt = 0u32;

            loop {
                if shared.state() != ConnectionState::Reconnecting {
                    // disconnect() cancelled the reconnection
                    break;
                }
                if attempt >= shared.config.max_reconnect_attempts {
                    log::error!(
                        "reconnection cap of {} attempts exceeded",
                        shared.config.max_reconnect_attempts
                    );
                    shared.set_state(ConnectionState::Failed);
                    break;
                }

                tokio::time::sleep(delay).await;
                if shared.state() != ConnectionState::Reconnecting {
                    break;
                }

                attempt += 1;
                log::info!(
                    "reconnect attempt {attempt}/{} after {delay:?}",
                    shared.config.max_reconnect_attempts
                );

                let _gate = shared.connect_gate.lock().await;
                shared.set_state(ConnectionState::Connecting);
                match shared.connect_once().await {
                    Ok(()) => break,
                    Err(e) => {
                        log::warn!("reconnect attempt {attempt} failed: {e}");
                        shared.set_state(ConnectionState::Reconnecting);
                        delay *= 2;
                    }
                }
            }
        }
    }

    /// Establish the transport.
    ///
    /// Resolves once the socket is open, or fails with
    /// [`ConnectionError::ConnectionFailed`]. Concurrent calls while a
    /// connect is already in flight await the same outcome.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        match self.shared.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                // Another caller (or the supervisor) is already connecting;
                // resolve together with it.
                let mut rx = self.shared.state_tx.subscribe();
                let outcome = rx
                    .wait_for(|s| {
                        matches!(
                            s,
                            ConnectionState::Connected
                                | ConnectionState::Disconnected
                                | ConnectionState::Failed
                        )
                    })
                    .await;
                return match outcome.as_deref() {
                    Ok(ConnectionState::Connected) => Ok(()),
                    _ => Err(ConnectionError::ConnectionFailed(
                        "concurrent connect did not reach connected".into(),
                    )),
                };
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }

        let _gate = self.shared.connect_gate.lock().await;
        // Re-check under the gate: a racing caller may have finished.
        if self.shared.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.shared.set_state(ConnectionState::Connecting);
        match self.shared.connect_once().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Tear down the transport and cancel pending reconnection timers.
    /// Never fails; safe from any state.
    pub async fn disconnect(&self) {
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.abort_socket_tasks().await;
        log::info!("disconnected");
    }

    /// Submit a frame (see [`ConnectionHandle::send`]).
    pub async fn send(&self, env: Envelope) {
        self.handle().send(env).await
    }

    /// Cheap cloneable handle for engines.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to inbound envelopes.
    pub fn inbound(&self) -> Subscription<Envelope> {
        self.shared.inbound.subscribe()
    }

    pub async fn queue_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    /// Stop every task owned by this manager. The manager is unusable
    /// afterwards.
    pub async fn destroy(&self) {
        self.disconnect().await;
        self.supervisor.abort();
    }
}
