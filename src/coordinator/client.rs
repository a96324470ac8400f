//! Socket.IO connection manager for coordinator communication
//!
//! Provides the persistent channel to the coordinator with:
//! - Engine.IO handshake and heartbeat handling (revisions 3 and 4)
//! - The welcome → register → registered handshake
//! - Decoding of inbound work requests into client events
//! - Automatic reconnection with exponential backoff

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{
    endpoint_url, EnginePacket, EngineRevision, InboundEvent, OpenHandshake, RegisterRequest,
    SocketPacket, EVENT_REGISTER, ROOT_NAMESPACE,
};
use crate::types::{AgentIdentity, Credential, WorkRequest, WorkResult};

/// How long `shutdown` waits for the close frames to be flushed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Coordinator address (`http(s)://` or `ws(s)://`)
    pub url: String,

    /// Engine.IO protocol revision
    pub engine_revision: EngineRevision,

    /// Extra query parameters sent with the handshake
    pub query: BTreeMap<String, String>,

    /// Timeout for the WebSocket connect and the Engine.IO open packet
    pub connect_timeout: Duration,

    /// Reconnect after the channel is lost
    pub reconnect: bool,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,

    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,

    /// Event and command queue size
    pub message_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8888".to_string(),
            engine_revision: EngineRevision::default(),
            query: BTreeMap::new(),
            connect_timeout: Duration::from_secs(20),
            reconnect: true,
            max_reconnect_attempts: 0, // Infinite
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            message_queue_size: 256,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Session State
// ─────────────────────────────────────────────────────────────────

/// Session state of the coordinator channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No channel
    #[default]
    Disconnected,
    /// Opening the channel
    Connecting,
    /// Channel open, not registered
    Connected,
    /// Registration acknowledged
    Registered,
    /// Waiting before the next connection attempt
    Reconnecting,
    /// Shutting down
    ShuttingDown,
}

/// Internal session bookkeeping
#[derive(Debug, Default)]
struct Session {
    state: SessionState,

    /// Session id from the last `registered` acknowledgement
    session_id: Option<String>,

    /// Engine.IO session id of the current channel
    engine_sid: Option<String>,

    /// Acknowledged registrations over the process lifetime
    registrations: u32,

    /// Reconnection attempt count
    reconnect_attempts: u32,

    /// When the current channel opened
    connected_at: Option<Instant>,
}

// ─────────────────────────────────────────────────────────────────
// Command Channel
// ─────────────────────────────────────────────────────────────────

/// Commands that can be sent to the connection loop
#[derive(Debug)]
pub enum ClientCommand {
    /// Emit a completion event
    SendResult(WorkResult),

    /// Close the channel and stop
    Shutdown,
}

// ─────────────────────────────────────────────────────────────────
// Event Channel
// ─────────────────────────────────────────────────────────────────

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Namespace connected
    Connected,

    /// Valid welcome received; registration sent
    Welcomed { greeting: Option<String> },

    /// Registration acknowledged
    Registered { session_id: Option<String> },

    /// Work to relay
    WorkRequest(WorkRequest),

    /// Channel lost
    Disconnected { reason: String },

    /// Waiting before the next connection attempt
    Reconnecting { attempt: u32, delay: Duration },

    /// Error occurred
    Error { message: String, fatal: bool },
}

// ─────────────────────────────────────────────────────────────────
// Connection Manager
// ─────────────────────────────────────────────────────────────────

/// Owns the channel to the coordinator
pub struct ConnectionManager {
    config: ConnectionConfig,
    identity: AgentIdentity,
    credential: Credential,
    session: Arc<RwLock<Session>>,
    command_tx: Option<mpsc::Sender<ClientCommand>>,
    task: Option<JoinHandle<()>>,
}

/// Everything the connection loop needs besides its channels
struct LoopContext {
    config: ConnectionConfig,
    url: Url,
    identity: AgentIdentity,
    credential: Credential,
    session: Arc<RwLock<Session>>,
}

impl ConnectionManager {
    /// Create a connection manager; nothing is opened until `connect`
    pub fn new(config: ConnectionConfig, identity: AgentIdentity, credential: Credential) -> Self {
        Self {
            config,
            identity,
            credential,
            session: Arc::new(RwLock::new(Session::default())),
            command_tx: None,
            task: None,
        }
    }

    /// Open the channel and return the event receiver.
    ///
    /// Fails only when the endpoint cannot be built; connection failures are
    /// reported as events and retried.
    pub async fn connect(&mut self) -> Result<mpsc::Receiver<ClientEvent>> {
        if self.command_tx.is_some() {
            return Err(Error::Internal("connection manager already started".to_string()));
        }

        let url = endpoint_url(&self.config.url, self.config.engine_revision, &self.config.query)?;

        let (event_tx, event_rx) = mpsc::channel(self.config.message_queue_size);
        let (command_tx, command_rx) = mpsc::channel(self.config.message_queue_size);
        self.command_tx = Some(command_tx);

        let context = LoopContext {
            config: self.config.clone(),
            url,
            identity: self.identity.clone(),
            credential: self.credential.clone(),
            session: self.session.clone(),
        };

        self.task = Some(tokio::spawn(async move {
            run_connection_loop(context, command_rx, event_tx).await;
        }));

        Ok(event_rx)
    }

    /// Emit a completion event without waiting for delivery.
    ///
    /// Errors when the connection loop has stopped or its queue is full.
    pub fn send_result(&self, result: WorkResult) -> Result<()> {
        let tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| Error::ChannelClosed("connection manager not started".to_string()))?;

        tx.try_send(ClientCommand::SendResult(result)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::ChannelClosed("command queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::ChannelClosed("connection loop stopped".to_string())
            }
        })
    }

    /// Close the channel and wait briefly for the loop to finish
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.command_tx.take() {
            // A stopped loop has nothing left to close.
            let _ = tx.send(ClientCommand::Shutdown).await;
        }
        self.session.write().state = SessionState::ShuttingDown;

        if let Some(task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Connection loop did not stop in time");
            }
        }
        Ok(())
    }

    /// Current session state
    pub fn session_state(&self) -> SessionState {
        self.session.read().state
    }

    /// Session id from the last registration acknowledgement
    pub fn session_id(&self) -> Option<String> {
        self.session.read().session_id.clone()
    }

    /// Whether registration was acknowledged on the current channel
    pub fn is_registered(&self) -> bool {
        self.session.read().state == SessionState::Registered
    }

    /// Acknowledged registrations since the process started
    pub fn registrations(&self) -> u32 {
        self.session.read().registrations
    }

    /// Identity presented at every registration
    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Loop
// ─────────────────────────────────────────────────────────────────

/// Main connection loop with reconnection logic
async fn run_connection_loop(
    ctx: LoopContext,
    mut command_rx: mpsc::Receiver<ClientCommand>,
    event_tx: mpsc::Sender<ClientEvent>,
) {
    let config = &ctx.config;

    let mut backoff = ExponentialBackoff {
        initial_interval: config.initial_reconnect_delay,
        max_interval: config.max_reconnect_delay,
        max_elapsed_time: None, // Retry forever
        ..Default::default()
    };

    'reconnect: loop {
        if ctx.session.read().state == SessionState::ShuttingDown {
            info!("Connection shutdown requested");
            break;
        }

        ctx.session.write().state = SessionState::Connecting;
        info!(url = %ctx.url, revision = %config.engine_revision, "Connecting to coordinator");

        match tokio::time::timeout(config.connect_timeout, connect_async(ctx.url.clone())).await {
            Ok(Ok((ws_stream, _response))) => {
                debug!("WebSocket connection established");
                ctx.session.write().connected_at = Some(Instant::now());

                let (write, read) = ws_stream.split();
                let result = handle_connection(&ctx, &mut command_rx, &event_tx, write, read).await;

                // Only a namespace connect ack clears the attempt count.
                if ctx.session.read().reconnect_attempts == 0 {
                    backoff.reset();
                }

                let reason = match result {
                    Ok(reason) => reason,
                    Err(e) => {
                        warn!(error = %e.log_line(), "Connection error");
                        e.to_string()
                    }
                };

                let uptime_secs = {
                    let mut s = ctx.session.write();
                    if s.state != SessionState::ShuttingDown {
                        s.state = SessionState::Disconnected;
                    }
                    s.session_id = None;
                    s.engine_sid = None;
                    s.connected_at.take().map(|t| t.elapsed().as_secs()).unwrap_or(0)
                };

                info!(reason = %reason, uptime_secs, "Disconnected from coordinator");
                let _ = event_tx.send(ClientEvent::Disconnected { reason }).await;
            }
            Ok(Err(e)) => {
                ctx.session.write().state = SessionState::Disconnected;
                error!(error = %e, "Failed to connect to coordinator");
                let _ = event_tx
                    .send(ClientEvent::Error {
                        message: format!("Connection failed: {}", e),
                        fatal: false,
                    })
                    .await;
            }
            Err(_) => {
                ctx.session.write().state = SessionState::Disconnected;
                let e = Error::HandshakeTimeout {
                    url: ctx.url.to_string(),
                    after_ms: config.connect_timeout.as_millis() as u64,
                };
                error!(error = %e, "Failed to connect to coordinator");
                let _ = event_tx
                    .send(ClientEvent::Error {
                        message: e.to_string(),
                        fatal: false,
                    })
                    .await;
            }
        }

        if ctx.session.read().state == SessionState::ShuttingDown {
            break;
        }

        if !config.reconnect {
            info!("Reconnection disabled; connection manager stopping");
            let _ = event_tx
                .send(ClientEvent::Error {
                    message: "Channel closed and reconnection is disabled".to_string(),
                    fatal: false,
                })
                .await;
            break;
        }

        let attempts = {
            let mut s = ctx.session.write();
            s.state = SessionState::Reconnecting;
            s.reconnect_attempts += 1;
            s.reconnect_attempts
        };

        if config.max_reconnect_attempts > 0 && attempts > config.max_reconnect_attempts {
            error!(
                attempts = attempts - 1,
                max = config.max_reconnect_attempts,
                "Max reconnection attempts reached"
            );
            let _ = event_tx
                .send(ClientEvent::Error {
                    message: "Max reconnection attempts reached".to_string(),
                    fatal: true,
                })
                .await;
            break;
        }

        let delay = backoff.next_backoff().unwrap_or(config.max_reconnect_delay);

        let _ = event_tx
            .send(ClientEvent::Reconnecting {
                attempt: attempts,
                delay,
            })
            .await;

        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempts,
            "Waiting before reconnection"
        );

        // Results have nowhere to go while the channel is down.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::SendResult(result)) => {
                            warn!(id = %result.id, event = result.event_name(), "Channel down; dropping work result");
                        }
                        Some(ClientCommand::Shutdown) | None => {
                            ctx.session.write().state = SessionState::ShuttingDown;
                            break 'reconnect;
                        }
                    }
                }
            }
        }
    }

    info!("Connection loop terminated");
}

/// Handle one open WebSocket; returns the close reason
async fn handle_connection<S, R>(
    ctx: &LoopContext,
    command_rx: &mut mpsc::Receiver<ClientCommand>,
    event_tx: &mpsc::Sender<ClientEvent>,
    mut write: S,
    mut read: R,
) -> Result<String>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let handshake = wait_for_open(ctx, &mut read).await?;
    debug!(
        sid = %handshake.sid,
        ping_interval_ms = handshake.ping_interval,
        ping_timeout_ms = handshake.ping_timeout,
        "Engine.IO handshake complete"
    );
    ctx.session.write().engine_sid = Some(handshake.sid.clone());

    // Revision 3 servers connect the root namespace on their own.
    let client_pings = ctx.config.engine_revision == EngineRevision::V3;
    if !client_pings {
        send_packet(&mut write, EnginePacket::Message(SocketPacket::connect())).await?;
    }

    let ping_period = Duration::from_millis(handshake.ping_interval.max(1));
    let mut ping_timer = tokio::time::interval(ping_period);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.reset();

    // Any inbound frame proves the peer is alive.
    let liveness = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
    let idle = tokio::time::sleep(liveness);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        idle.as_mut().reset(tokio::time::Instant::now() + liveness);
                        match EnginePacket::decode(&text) {
                            Ok(packet) => {
                                if let Some(reason) = handle_engine_packet(ctx, &mut write, event_tx, packet).await? {
                                    return Ok(reason);
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to decode frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        idle.as_mut().reset(tokio::time::Instant::now() + liveness);
                        debug!(bytes = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(frame = ?frame, "Received close frame");
                        return Ok("close frame".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(Error::ChannelLost { reason: e.to_string() });
                    }
                    None => {
                        return Ok("stream ended".to_string());
                    }
                }
            }

            _ = ping_timer.tick(), if client_pings => {
                send_packet(&mut write, EnginePacket::Ping(None)).await?;
                trace!("Sent ping");
            }

            _ = &mut idle => {
                return Err(Error::ChannelLost {
                    reason: format!("no heartbeat within {}ms", liveness.as_millis()),
                });
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(ClientCommand::SendResult(result)) => {
                        emit_result(&mut write, &result).await?;
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        info!("Shutdown command received");
                        ctx.session.write().state = SessionState::ShuttingDown;
                        let _ = send_packet(&mut write, EnginePacket::Message(SocketPacket::disconnect())).await;
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Ok("shutdown".to_string());
                    }
                }
            }
        }
    }
}

/// Wait for the Engine.IO `open` packet
async fn wait_for_open<R>(ctx: &LoopContext, read: &mut R) -> Result<OpenHandshake>
where
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let timeout = tokio::time::timeout(ctx.config.connect_timeout, async {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => match EnginePacket::decode(&text) {
                    Ok(EnginePacket::Open(handshake)) => return Ok(handshake),
                    Ok(other) => {
                        return Err(Error::UnexpectedFrame {
                            detail: format!("expected open packet, got {:?}", other),
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to decode frame before open"),
                },
                Ok(WsMessage::Close(_)) => {
                    return Err(Error::ChannelLost {
                        reason: "connection closed during handshake".to_string(),
                    });
                }
                Err(e) => {
                    return Err(Error::ChannelLost { reason: e.to_string() });
                }
                _ => {}
            }
        }
        Err(Error::ChannelLost {
            reason: "stream ended during handshake".to_string(),
        })
    });

    timeout.await.map_err(|_| Error::HandshakeTimeout {
        url: ctx.url.to_string(),
        after_ms: ctx.config.connect_timeout.as_millis() as u64,
    })?
}

/// Handle one Engine.IO packet; `Some` ends the connection with that reason
async fn handle_engine_packet<S>(
    ctx: &LoopContext,
    write: &mut S,
    event_tx: &mpsc::Sender<ClientEvent>,
    packet: EnginePacket,
) -> Result<Option<String>>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
{
    match packet {
        EnginePacket::Ping(data) => {
            send_packet(write, EnginePacket::Pong(data)).await?;
            trace!("Answered ping");
        }
        EnginePacket::Pong(_) => {
            trace!("Received pong");
        }
        EnginePacket::Close => {
            return Ok(Some("engine close".to_string()));
        }
        EnginePacket::Message(packet) => {
            return handle_socket_packet(ctx, write, event_tx, packet).await;
        }
        EnginePacket::Open(_) | EnginePacket::Upgrade | EnginePacket::Noop => {
            debug!("Ignoring engine packet");
        }
    }
    Ok(None)
}

/// Handle one Socket.IO packet
async fn handle_socket_packet<S>(
    ctx: &LoopContext,
    write: &mut S,
    event_tx: &mpsc::Sender<ClientEvent>,
    packet: SocketPacket,
) -> Result<Option<String>>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
{
    match packet {
        SocketPacket::Connect { namespace, .. } if namespace == ROOT_NAMESPACE => {
            {
                let mut s = ctx.session.write();
                s.state = SessionState::Connected;
                s.reconnect_attempts = 0;
            }
            info!("Channel open");
            let _ = event_tx.send(ClientEvent::Connected).await;
        }
        SocketPacket::ConnectError { data, .. } => {
            let reason = data.map(|d| d.to_string()).unwrap_or_default();
            return Err(Error::Rejected { reason });
        }
        SocketPacket::Disconnect { namespace } if namespace == ROOT_NAMESPACE => {
            return Ok(Some("namespace disconnect".to_string()));
        }
        SocketPacket::Event { namespace, name, args, .. } if namespace == ROOT_NAMESPACE => {
            match InboundEvent::decode(&name, args) {
                Ok(event) => handle_event(ctx, write, event_tx, event).await?,
                Err(e) => warn!(event = %name, error = %e, "Dropping malformed event"),
            }
        }
        other => {
            debug!(packet = ?other, "Ignoring Socket.IO packet");
        }
    }
    Ok(None)
}

/// Act on a decoded coordinator event
async fn handle_event<S>(
    ctx: &LoopContext,
    write: &mut S,
    event_tx: &mpsc::Sender<ClientEvent>,
    event: InboundEvent,
) -> Result<()>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
{
    debug!(event = %event.type_name(), "Received event");

    match event {
        InboundEvent::Welcome(Some(welcome)) => {
            let greeting = welcome.greeting();
            info!(greeting = ?greeting, "Welcome received");

            let register = RegisterRequest {
                token: ctx.credential.clone(),
                id: ctx.identity.clone(),
            };
            let packet = SocketPacket::event(EVENT_REGISTER, &register)?;
            send_packet(write, EnginePacket::Message(packet)).await?;
            info!(id = %ctx.identity, "Registration sent");

            let _ = event_tx
                .send(ClientEvent::Welcomed { greeting })
                .await;
        }

        InboundEvent::Welcome(None) => {
            warn!("Invalid welcome payload; registration not attempted");
        }

        InboundEvent::Registered(ack) => {
            {
                let mut s = ctx.session.write();
                s.state = SessionState::Registered;
                s.session_id = ack.sid.clone();
                s.registrations += 1;
            }
            info!(sid = ?ack.sid, "Registered with coordinator");
            let _ = event_tx
                .send(ClientEvent::Registered { session_id: ack.sid })
                .await;
        }

        InboundEvent::WorkRequest(request) => {
            if ctx.session.read().state != SessionState::Registered {
                warn!(id = %request.id, "Work request received before registration");
            }
            debug!(id = %request.id, kind = %request.kind, "Work request received");
            let _ = event_tx.send(ClientEvent::WorkRequest(request)).await;
        }

        InboundEvent::Other { name } => {
            debug!(event = %name, "Unhandled event");
        }
    }

    Ok(())
}

/// Emit a completion event for a work result
async fn emit_result<S>(write: &mut S, result: &WorkResult) -> Result<()>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
{
    let packet = SocketPacket::event(result.event_name(), result)?;
    send_packet(write, EnginePacket::Message(packet)).await?;
    debug!(id = %result.id, event = result.event_name(), success = result.success, "Result emitted");
    Ok(())
}

/// Send one Engine.IO packet as a text frame
async fn send_packet<S>(write: &mut S, packet: EnginePacket) -> Result<()>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
{
    write
        .send(WsMessage::Text(packet.encode()))
        .await
        .map_err(|e| Error::ChannelLost { reason: e.to_string() })
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
