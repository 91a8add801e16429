//! A single gateway shard: one websocket, its heartbeat, and its session.
//!
//! A shard connects, waits for HELLO, identifies (or resumes), and then
//! pumps frames until the connection dies. Recovery is driven by the close
//! code: most closes reconnect and RESUME, a few discard the session first,
//! and the authentication/intent failures terminate the process.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ember_http::RestClient;
use flume::{Receiver, Sender};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::engine::{Direction, Dispatcher};
use crate::error::{CloseCode, GatewayError};
use crate::heartbeat::HeartbeatState;
use crate::intents::Intents;
use crate::opcode::OpCode;
use crate::payload::{
    heartbeat_frame, ConnectionProperties, GatewayPayload, HelloPayload, IdentifyPayload,
    ResumePayload,
};
use crate::ratelimit::{exponential_backoff, with_jitter, LeakyGate};
use crate::{GATEWAY_VERSION, SEND_RATE, SEND_WINDOW};

/// Type alias for the WebSocket stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Budget for the websocket open, handshake included.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// User agent presented during the websocket handshake.
const USER_AGENT_VALUE: &str = concat!(
    "DiscordBot (https://github.com/emberbot/ember-rs, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Commands accepted by a shard's write half.
enum ShardCommand {
    /// Write one frame to the socket.
    Send(String),
    /// Close the socket, ending the current connection.
    Close,
}

/// Connection lifecycle of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Not connected, not running.
    Disconnected,
    /// Opening the websocket.
    Connecting,
    /// Socket open, HELLO not yet received.
    HelloPending,
    /// IDENTIFY sent, waiting for READY.
    Identifying,
    /// RESUME sent, waiting for replay.
    Resuming,
    /// Receiving events.
    Operational,
    /// Tearing the connection down.
    Closing,
}

/// A Discord gateway shard.
pub struct Shard {
    /// This shard's ID.
    id: u16,

    /// Total number of shards.
    shard_count: u16,

    rest: Arc<RestClient>,
    intents: Intents,

    /// Identify gate shared by every shard of the engine.
    identify_gate: Arc<LeakyGate>,
    dispatcher: Arc<Dispatcher>,

    /// Self-reference handed to dispatched listeners.
    handle: Weak<Shard>,

    state: RwLock<ShardState>,

    /// Session id from READY; present iff the next connect may RESUME.
    session_id: RwLock<Option<String>>,

    /// Last sequence observed on an inbound frame. Monotone within a session.
    sequence: RwLock<Option<u64>>,

    /// Cached gateway URL; dropped on RATE_LIMITED closes so it is re-fetched.
    gateway_url: RwLock<Option<String>>,

    heartbeat: HeartbeatState,

    /// Outbound frame budget, 120 per 60 seconds.
    send_gate: LeakyGate,

    /// Pacemaker task, armed on HELLO and cancelled on close.
    pacemaker: Mutex<Option<JoinHandle<()>>>,

    /// Flipped once a session reaches Operational; resets reconnect backoff.
    established: AtomicBool,

    shutdown: AtomicBool,

    command_tx: Sender<ShardCommand>,
    command_rx: Receiver<ShardCommand>,
}

impl Shard {
    pub(crate) fn new(
        id: u16,
        shard_count: u16,
        rest: Arc<RestClient>,
        intents: Intents,
        identify_gate: Arc<LeakyGate>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = flume::unbounded();

        Arc::new_cyclic(|handle| Self {
            id,
            shard_count,
            rest,
            intents,
            identify_gate,
            dispatcher,
            handle: handle.clone(),
            state: RwLock::new(ShardState::Disconnected),
            session_id: RwLock::new(None),
            sequence: RwLock::new(None),
            gateway_url: RwLock::new(None),
            heartbeat: HeartbeatState::new(),
            send_gate: LeakyGate::new(SEND_RATE, SEND_WINDOW),
            pacemaker: Mutex::new(None),
            established: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            command_tx,
            command_rx,
        })
    }

    /// This shard's ID.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Total number of shards.
    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    /// Current connection state.
    pub fn state(&self) -> ShardState {
        *self.state.read()
    }

    /// Last sequence number received, if any.
    pub fn sequence(&self) -> Option<u64> {
        *self.sequence.read()
    }

    /// Session id of the current session, if one is established.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Round-trip latency of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    /// Request a graceful shutdown: close the socket and stop reconnecting.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.command_tx.send(ShardCommand::Close);
    }

    /// Queue a frame for the gateway.
    ///
    /// Waits for the shard's send budget, announces the frame to
    /// `GATEWAY_SEND` listeners, then hands it to the write half; frames are
    /// written in the order they were accepted here.
    pub async fn send(&self, frame: Value) -> Result<(), GatewayError> {
        self.send_gate.acquire().await?;
        self.dispatch_frame(Direction::Outbound, &frame);

        let text = serde_json::to_string(&frame)?;
        self.command_tx
            .send(ShardCommand::Send(text))
            .map_err(|_| GatewayError::ChannelClosed)
    }

    /// Connect and keep the shard connected until shutdown or a fatal close.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let mut attempts: u32 = 0;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            let outcome = self.connect_once().await;
            self.stop_pacemaker();
            *self.state.write() = ShardState::Disconnected;

            if self.established.swap(false, Ordering::SeqCst) {
                attempts = 0;
            }

            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            match outcome {
                Ok(()) => return Ok(()),
                Err(GatewayError::Closed { code, reason }) => self.handle_close(code, &reason),
                Err(GatewayError::InvalidSession) => {
                    warn!(shard_id = self.id, "session invalidated, will re-identify");
                    *self.session_id.write() = None;
                    *self.sequence.write() = None;
                }
                Err(GatewayError::Reconnect) => {
                    info!(shard_id = self.id, "server requested reconnect");
                }
                Err(GatewayError::MissedAck) => {
                    warn!(shard_id = self.id, "heartbeat went unacknowledged, reconnecting");
                }
                Err(error) => {
                    warn!(shard_id = self.id, %error, "connection lost");
                }
            }

            attempts += 1;
            if attempts > 1 {
                let backoff = with_jitter(
                    exponential_backoff(attempts - 2, RECONNECT_BASE, RECONNECT_MAX),
                    0.25,
                );
                info!(
                    shard_id = self.id,
                    attempt = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "waiting before reconnect"
                );
                sleep(backoff).await;
            }
        }
    }

    /// Apply the close-code policy after a connection ends.
    fn handle_close(&self, code: Option<u16>, reason: &str) {
        let known = code.and_then(CloseCode::from_code);

        if let Some(close) = known {
            if close.is_fatal() {
                self.dispatcher.panic(close as u16);
            }
            if close.clears_session() {
                warn!(shard_id = self.id, code = close as u16, "discarding session");
                *self.session_id.write() = None;
                *self.sequence.write() = None;
                if close == CloseCode::RateLimited {
                    // Force a fresh URL from /gateway on the next connect.
                    *self.gateway_url.write() = None;
                }
                return;
            }
        }

        info!(shard_id = self.id, ?code, reason, "connection closed, will resume");
    }

    /// One full connection: open, HELLO, identify or resume, read until the
    /// connection ends.
    async fn connect_once(&self) -> Result<(), GatewayError> {
        *self.state.write() = ShardState::Connecting;
        self.heartbeat.reset();

        // Commands queued for a previous connection are stale.
        while self.command_rx.try_recv().is_ok() {}

        let url = self.gateway_url().await?;
        info!(shard_id = self.id, url = %url, "connecting to gateway");

        let ws = open_websocket(&url).await?;
        *self.state.write() = ShardState::HelloPending;

        let (mut sink, mut stream) = ws.split();
        let result = self.read_loop(&mut sink, &mut stream).await;

        *self.state.write() = ShardState::Closing;
        let _ = sink.close().await;

        result
    }

    /// Pump inbound frames and queued outbound commands until the
    /// connection ends.
    async fn read_loop(
        &self,
        sink: &mut WsSink,
        stream: &mut SplitStream<WsStream>,
    ) -> Result<(), GatewayError> {
        loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            let frame: Value = serde_json::from_str(text.as_str())?;
                            self.handle_frame(frame).await?;
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            sink.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let (code, reason) = match frame {
                                Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                                None => (None, String::new()),
                            };
                            return Err(GatewayError::Closed { code, reason });
                        }
                        // Binary and pong frames bypass dispatch entirely.
                        Some(Ok(_)) => {}
                        Some(Err(error)) => return Err(error.into()),
                        None => {
                            return Err(GatewayError::Closed {
                                code: None,
                                reason: "websocket stream ended".into(),
                            });
                        }
                    }
                }
                command = self.command_rx.recv_async() => {
                    match command {
                        Ok(ShardCommand::Send(text)) => {
                            sink.send(WsMessage::Text(text.into())).await?;
                        }
                        Ok(ShardCommand::Close) => {
                            return if self.shutdown.load(Ordering::SeqCst) {
                                Ok(())
                            } else {
                                // The pacemaker found an unacked heartbeat.
                                Err(GatewayError::MissedAck)
                            };
                        }
                        Err(_) => return Err(GatewayError::ChannelClosed),
                    }
                }
            }
        }
    }

    /// Handle one inbound frame.
    async fn handle_frame(&self, frame: Value) -> Result<(), GatewayError> {
        if let Some(seq) = frame.get("s").and_then(Value::as_u64) {
            self.advance_sequence(seq);
        }

        // Every inbound frame reaches listeners, protocol frames included.
        self.dispatch_frame(Direction::Inbound, &frame);

        let op = frame
            .get("op")
            .and_then(Value::as_u64)
            .and_then(|op| u8::try_from(op).ok())
            .and_then(OpCode::from_u8);

        match op {
            Some(OpCode::Hello) => {
                let hello: HelloPayload =
                    serde_json::from_value(frame.get("d").cloned().unwrap_or(Value::Null))?;
                debug!(
                    shard_id = self.id,
                    interval_ms = hello.heartbeat_interval,
                    "received hello"
                );
                self.start_pacemaker(Duration::from_millis(hello.heartbeat_interval));

                if let Some(session_id) = self.session_id() {
                    *self.state.write() = ShardState::Resuming;
                    info!(shard_id = self.id, %session_id, "resuming session");
                    self.send_resume(session_id).await?;
                } else {
                    // Identify concurrency is engine-wide; every IDENTIFY
                    // waits its turn, re-identifies after reconnect included.
                    self.identify_gate.acquire().await?;
                    *self.state.write() = ShardState::Identifying;
                    info!(shard_id = self.id, "identifying");
                    self.send_identify().await?;
                }
            }
            Some(OpCode::HeartbeatAck) => {
                self.heartbeat.mark_acked();
                trace!(
                    shard_id = self.id,
                    latency = ?self.heartbeat.latency(),
                    "heartbeat acknowledged"
                );
            }
            Some(OpCode::Heartbeat) => {
                // The server may demand an immediate heartbeat.
                self.send_heartbeat().await?;
            }
            Some(OpCode::Reconnect) => return Err(GatewayError::Reconnect),
            Some(OpCode::InvalidSession) => {
                let resumable = frame.get("d").and_then(Value::as_bool).unwrap_or(false);
                warn!(shard_id = self.id, resumable, "session invalidated");
                return Err(GatewayError::InvalidSession);
            }
            Some(OpCode::Dispatch) => self.note_dispatch(&frame),
            _ => trace!(shard_id = self.id, op = ?frame.get("op"), "ignoring opcode"),
        }

        Ok(())
    }

    /// Track session state carried by dispatch events.
    fn note_dispatch(&self, frame: &Value) {
        match frame.get("t").and_then(Value::as_str) {
            Some("READY") => {
                if let Some(session_id) = frame
                    .pointer("/d/session_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                {
                    info!(shard_id = self.id, %session_id, "session established");
                    *self.session_id.write() = Some(session_id);
                }
                *self.state.write() = ShardState::Operational;
                self.established.store(true, Ordering::SeqCst);
            }
            Some("RESUMED") => {
                info!(shard_id = self.id, "session resumed");
                *self.state.write() = ShardState::Operational;
                self.established.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    /// Advance the sequence from an inbound `s`. Never moves backwards.
    fn advance_sequence(&self, seq: u64) {
        let mut current = self.sequence.write();
        if current.is_none_or(|existing| seq >= existing) {
            *current = Some(seq);
        }
    }

    fn dispatch_frame(&self, direction: Direction, frame: &Value) {
        if let Some(shard) = self.handle.upgrade() {
            self.dispatcher.dispatch(&shard, direction, frame);
        }
    }

    async fn send_identify(&self) -> Result<(), GatewayError> {
        let identify = IdentifyPayload {
            token: self.rest.token().to_string(),
            properties: ConnectionProperties::default(),
            intents: self.intents,
            shard: [self.id, self.shard_count],
        };
        let frame = serde_json::to_value(GatewayPayload::new(OpCode::Identify, identify))?;
        self.send(frame).await
    }

    async fn send_resume(&self, session_id: String) -> Result<(), GatewayError> {
        let resume = ResumePayload {
            token: self.rest.token().to_string(),
            session_id,
            seq: self.sequence(),
        };
        let frame = serde_json::to_value(GatewayPayload::new(OpCode::Resume, resume))?;
        self.send(frame).await
    }

    async fn send_heartbeat(&self) -> Result<(), GatewayError> {
        self.heartbeat.mark_sent();
        self.send(heartbeat_frame(self.sequence())).await
    }

    /// Arm the pacemaker: an immediate heartbeat, then one per interval.
    ///
    /// A tick that finds the previous heartbeat unacknowledged closes the
    /// connection instead; the session survives for RESUME.
    fn start_pacemaker(&self, interval: Duration) {
        let Some(shard) = self.handle.upgrade() else {
            return;
        };

        let handle = tokio::spawn(async move {
            loop {
                if shard.heartbeat.awaiting_ack() {
                    warn!(
                        shard_id = shard.id,
                        "heartbeat not acknowledged, closing connection"
                    );
                    let _ = shard.command_tx.send(ShardCommand::Close);
                    return;
                }
                if shard.send_heartbeat().await.is_err() {
                    return;
                }
                sleep(interval).await;
            }
        });

        let mut pacemaker = self.pacemaker.lock();
        if let Some(old) = pacemaker.replace(handle) {
            old.abort();
        }
    }

    fn stop_pacemaker(&self) {
        if let Some(handle) = self.pacemaker.lock().take() {
            handle.abort();
        }
    }

    /// The connection URL: the cached gateway URL (fetched from `/gateway`
    /// on first use) plus the protocol query.
    async fn gateway_url(&self) -> Result<Url, GatewayError> {
        let cached = self.gateway_url.read().clone();
        let base = match cached {
            Some(url) => url,
            None => {
                let info = self.rest.get_gateway().await?;
                *self.gateway_url.write() = Some(info.url.clone());
                info.url
            }
        };

        let mut url = Url::parse(&base)?;
        url.query_pairs_mut()
            .append_pair("v", &GATEWAY_VERSION.to_string())
            .append_pair("encoding", "json");
        Ok(url)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self.sequence.read() {
            Some(seq) => write!(f, "Shard({}, {seq})", self.id),
            None => write!(f, "Shard({}, null)", self.id),
        }
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Open a gateway websocket: 60-second handshake budget, no message or
/// frame size caps, and the bot user agent.
pub async fn open_websocket(url: &Url) -> Result<WsStream, GatewayError> {
    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

    let config = WebSocketConfig::default()
        .max_message_size(None)
        .max_frame_size(None);

    let (ws, _response) = timeout(
        CONNECT_TIMEOUT,
        connect_async_with_config(request, Some(config), false),
    )
    .await
    .map_err(|_| GatewayError::ConnectTimeout)??;

    Ok(ws)
}
