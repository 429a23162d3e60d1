//! The per-connection gateway state machine.

use crate::compression::{inflate_payload, TransportInflater};
use crate::config::CompressionMode;
use crate::error::{Error, ErrorKind};
use crate::events::ShardEvent;
use crate::manager::GatewayContext;
use crate::protocol::{
    close_behavior, close_code_description, CloseBehavior, GatewayMessage, IdentifyPayload,
    OpCode, ReadyPayload, ResumePayload, CLOSE_CODE_NORMAL, CLOSE_CODE_RESUMING,
};
use crate::session::SessionInfo;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Type alias for the WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tokens available per send window.
const SEND_WINDOW_TOKENS: u32 = 120;
/// Tokens restored after exhausting a window; one short of the full
/// quota so heartbeats always have headroom.
const SEND_TOKENS_AFTER_EXHAUSTION: u32 = 119;
/// Length of the send window.
const SEND_WINDOW: Duration = Duration::from_secs(60);

/// Connection status of a shard.
///
/// Exactly one per shard; mutated only by that shard's own handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// No socket
    Idle,
    /// Socket open, handshake in progress
    Connecting,
    /// Re-attaching to a previous session
    Resuming,
    /// Receiving dispatches
    Ready,
}

/// How a destroyed shard should come back, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Reconnect and re-attach to the stored session
    Resume,
    /// Clear the session and reconnect with a fresh Identify
    Reconnect,
}

/// Options for [`WebSocketShard::destroy`].
#[derive(Debug, Clone, Default)]
pub struct DestroyOptions {
    /// Close code to send; derived from `recover` when `None`
    pub code: Option<u16>,
    /// Recovery to schedule after the socket closes
    pub recover: Option<Recovery>,
}

impl DestroyOptions {
    /// The close code this destroy will use on the wire.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        self.code.unwrap_or(match self.recover {
            Some(Recovery::Resume) => CLOSE_CODE_RESUMING,
            _ => CLOSE_CODE_NORMAL,
        })
    }
}

/// Commands driving a shard task.
#[derive(Debug)]
pub enum ShardCommand {
    /// Connect and report the outcome of the initial attempt
    Connect(oneshot::Sender<Result<(), Error>>),
    /// Enqueue an outbound payload
    Send(GatewayMessage),
    /// Destroy the connection
    Destroy {
        options: DestroyOptions,
        done: oneshot::Sender<()>,
    },
    /// Snapshot the current status
    Status(oneshot::Sender<ShardStatus>),
}

/// Per-connection send token bucket: 120 tokens per 60s window.
#[derive(Debug)]
struct SendRateLimiter {
    remaining: u32,
    reset_at: Instant,
    exhausted: bool,
}

impl SendRateLimiter {
    fn new() -> Self {
        Self {
            remaining: SEND_WINDOW_TOKENS,
            reset_at: Instant::now() + SEND_WINDOW,
            exhausted: false,
        }
    }

    /// Take one token if the window allows it, or report when the window
    /// resets. Never sleeps: the shard keeps reading frames and
    /// heartbeating while a send waits, so the retry is scheduled by the
    /// caller instead.
    fn try_acquire(&mut self) -> Result<(), Instant> {
        let now = Instant::now();
        if now >= self.reset_at {
            // A window that was run dry refills one token short,
            // keeping headroom for heartbeats
            self.remaining = if self.exhausted {
                SEND_TOKENS_AFTER_EXHAUSTION
            } else {
                SEND_WINDOW_TOKENS
            };
            self.exhausted = false;
            self.reset_at = now + SEND_WINDOW;
        }

        if self.remaining == 0 {
            self.exhausted = true;
            return Err(self.reset_at);
        }

        self.remaining -= 1;
        Ok(())
    }
}

/// Heartbeat bookkeeping for one connection.
#[derive(Debug, Default)]
struct HeartbeatState {
    interval: Option<Duration>,
    next_at: Option<Instant>,
    ack_pending: bool,
    last_sent: Option<Instant>,
    latency: Option<Duration>,
}

impl HeartbeatState {
    /// Start the repeating timer. The first beat is offset by a random
    /// fraction of the interval to spread fleets out.
    fn start(&mut self, interval: Duration) {
        self.interval = Some(interval);
        self.next_at = Some(Instant::now() + interval.mul_f64(rand::random::<f64>()));
        self.ack_pending = false;
    }

    /// An unacknowledged heartbeat at the next unsolicited tick marks the
    /// connection as a zombie.
    fn is_zombie(&self, requested: bool) -> bool {
        self.ack_pending && !requested
    }

    fn record_sent(&mut self) {
        self.ack_pending = true;
        self.last_sent = Some(Instant::now());
        if let Some(interval) = self.interval {
            self.next_at = Some(Instant::now() + interval);
        }
    }

    fn record_ack(&mut self) -> Option<Duration> {
        self.ack_pending = false;
        self.latency = self.last_sent.map(|sent| sent.elapsed());
        self.latency
    }
}

/// What a processed frame amounted to, from the perspective of a wait
/// loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameEvent {
    /// Nothing a wait loop cares about
    Continue,
    /// The Hello frame arrived
    Hello,
    /// READY or RESUMED completed the handshake
    BecameReady,
    /// The connection is gone (recovery, if any, already queued)
    Closed,
}

/// What a wait loop is suspended on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitFor {
    Hello,
    Ready,
}

impl WaitFor {
    const fn name(self) -> &'static str {
        match self {
            WaitFor::Hello => "Hello",
            WaitFor::Ready => "Ready",
        }
    }
}

/// One connection's state machine: connect, identify/resume, heartbeat,
/// decompress, send-queue, close and recovery.
///
/// A shard is exclusively owned by its task; all mutation happens through
/// its own serialized handlers.
pub struct WebSocketShard {
    id: u32,
    ctx: Arc<GatewayContext>,
    status: ShardStatus,
    connection: Option<WsStream>,
    compression: CompressionMode,
    inflater: Option<TransportInflater>,
    session: Option<SessionInfo>,
    sequence: Option<u64>,
    heartbeat: HeartbeatState,
    send_limiter: SendRateLimiter,
    pending_sends: VecDeque<GatewayMessage>,
    replayed: u64,
    /// Recovery queued by destroy; picked up by the run loop
    recovery: Option<Recovery>,
    /// Deadline for the wait currently in flight; refreshable
    wait_deadline: Option<Instant>,
    /// When the token bucket lets queued sends continue
    send_ready_at: Option<Instant>,
}

impl WebSocketShard {
    pub fn new(id: u32, ctx: Arc<GatewayContext>) -> Self {
        Self {
            id,
            ctx,
            status: ShardStatus::Idle,
            connection: None,
            compression: CompressionMode::None,
            inflater: None,
            session: None,
            sequence: None,
            heartbeat: HeartbeatState::default(),
            send_limiter: SendRateLimiter::new(),
            pending_sends: VecDeque::new(),
            replayed: 0,
            recovery: None,
            wait_deadline: None,
            send_ready_at: None,
        }
    }

    /// This shard's id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ShardStatus {
        self.status
    }

    /// Latency measured by the most recent heartbeat round-trip.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency
    }

    // ===== Lifecycle =====

    /// Open the socket and complete the handshake through READY/RESUMED.
    ///
    /// Fails with [`Error::NotIdle`] unless the shard is idle. A timeout
    /// rejects the call and leaves retry to the caller; the session (if
    /// any) is kept.
    pub async fn connect(&mut self) -> Result<(), Error> {
        if self.status != ShardStatus::Idle {
            return Err(Error::NotIdle { id: self.id });
        }

        match self.connect_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A close during the handshake already tore the state
                // down; anything else still holds a half-open socket.
                if self.connection.is_some() {
                    self.teardown().await;
                }
                Err(e)
            }
        }
    }

    async fn connect_inner(&mut self) -> Result<(), Error> {
        let session = self.ctx.session_store().retrieve(self.id).await;

        let base = session
            .as_ref()
            .and_then(|s| s.resume_url.clone())
            .or_else(|| self.ctx.config().gateway_url.clone());
        let base = match base {
            Some(url) => url,
            None => self.ctx.info.fetch(false).await?.url,
        };

        self.compression = self.ctx.config().compression;
        let url = build_connect_url(&base, self.ctx.config().version, self.compression)?;
        self.inflater = match self.compression {
            CompressionMode::Transport => Some(TransportInflater::new()),
            _ => None,
        };

        debug!("[SHARD-{}] Connecting to {}", self.id, url);
        let hello_timeout = self.ctx.config().hello_timeout;
        let (stream, _response) = tokio::time::timeout(hello_timeout, connect_async(&url))
            .await
            .map_err(|_| Error::Timeout {
                waiting: "WebSocket handshake",
                waited_ms: hello_timeout.as_millis() as u64,
            })??;
        self.connection = Some(stream);
        self.status = ShardStatus::Connecting;
        self.session = session;
        self.replayed = 0;

        // Hello is the first frame the server sends
        self.wait_deadline = Some(Instant::now() + hello_timeout);
        self.wait_until(WaitFor::Hello).await?;

        let shard_count = self.ctx.shard_count();
        match self.session.clone() {
            Some(session) if session.shard_count == shard_count => self.resume(session).await,
            stale => {
                if stale.is_some() {
                    debug!(
                        "[SHARD-{}] Stored session has a different shard count, identifying",
                        self.id
                    );
                }
                self.identify().await
            }
        }
    }

    /// Consult the identify throttler, send Identify, and wait for READY.
    async fn identify(&mut self) -> Result<(), Error> {
        self.ctx.throttler.wait_for_identify(self.id).await?;

        let config = self.ctx.config();
        let payload = IdentifyPayload {
            token: self.ctx.token().ok_or(Error::MissingToken)?,
            properties: config.properties.clone(),
            intents: config.intents,
            compress: self.compression == CompressionMode::Payload,
            shard: [self.id, self.ctx.shard_count()],
            large_threshold: config.large_threshold,
            presence: config.presence.clone(),
        };
        info!("[SHARD-{}] Identifying", self.id);
        self.write_frame(&GatewayMessage::identify(&payload)).await?;

        self.wait_deadline = Some(Instant::now() + self.ctx.config().ready_timeout);
        self.wait_until(WaitFor::Ready).await
    }

    /// Send Resume for the stored session and wait for RESUMED.
    async fn resume(&mut self, session: SessionInfo) -> Result<(), Error> {
        self.send_resume(&session).await?;
        self.wait_deadline = Some(Instant::now() + self.ctx.config().ready_timeout);
        self.wait_until(WaitFor::Ready).await
    }

    async fn send_resume(&mut self, session: &SessionInfo) -> Result<(), Error> {
        info!(
            "[SHARD-{}] Resuming session {} from sequence {}",
            self.id, session.session_id, session.sequence
        );
        self.status = ShardStatus::Resuming;
        self.replayed = 0;
        self.sequence = Some(session.sequence);
        let payload = ResumePayload {
            token: self.ctx.token().ok_or(Error::MissingToken)?,
            seq: session.sequence,
            session_id: session.session_id.clone(),
        };
        self.write_frame(&GatewayMessage::resume(&payload)).await
    }

    /// Send a heartbeat, or tear the connection down when the previous
    /// one was never acknowledged (`requested` marks beats the server
    /// explicitly asked for, which are always sent).
    pub async fn heartbeat(&mut self, requested: bool) -> Result<(), Error> {
        if self.heartbeat.is_zombie(requested) {
            warn!(
                "[SHARD-{}] Heartbeat was never acknowledged, connection is a zombie",
                self.id
            );
            self.destroy(DestroyOptions {
                code: None,
                recover: Some(Recovery::Resume),
            })
            .await;
            return Ok(());
        }

        self.write_frame(&GatewayMessage::heartbeat(self.sequence))
            .await?;
        self.heartbeat.record_sent();
        trace!("[SHARD-{}] Heartbeat sent (seq {:?})", self.id, self.sequence);
        Ok(())
    }

    /// Tear down the connection. Idempotent: a no-op when already idle.
    ///
    /// Clears timers and pending waits; clears the persisted session
    /// unless recovering by Resume. When `recover` is set, reconnection
    /// is scheduled and happens transparently to the caller.
    pub async fn destroy(&mut self, options: DestroyOptions) {
        if self.status == ShardStatus::Idle && self.connection.is_none() {
            return;
        }

        info!(
            "[SHARD-{}] Destroying connection (recover: {:?})",
            self.id, options.recover
        );

        self.heartbeat = HeartbeatState::default();
        self.wait_deadline = None;
        self.pending_sends.clear();
        self.send_ready_at = None;

        if options.recover != Some(Recovery::Resume) {
            self.session = None;
            self.sequence = None;
            self.ctx.session_store().update(self.id, None).await;
        }

        let code = options.close_code();
        if let Some(mut connection) = self.connection.take() {
            let _ = connection
                .close(Some(CloseFrame {
                    code: code.into(),
                    reason: close_code_description(code).into(),
                }))
                .await;
        }

        self.inflater = None;
        self.status = ShardStatus::Idle;
        if options.recover.is_some() {
            self.recovery = options.recover;
        }
    }

    /// Close the socket and reset timers without touching the session or
    /// scheduling recovery. Used when an in-flight connect() fails.
    async fn teardown(&mut self) {
        self.heartbeat = HeartbeatState::default();
        self.wait_deadline = None;
        self.send_ready_at = None;
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.close(None).await;
        }
        self.inflater = None;
        self.status = ShardStatus::Idle;
    }

    // ===== Outbound =====

    /// Enqueue an outbound payload and drain whatever the gates allow.
    ///
    /// Payloads leave in FIFO order, one write in flight at a time.
    /// Non-critical opcodes hold the queue until the shard is `Ready`;
    /// an exhausted token bucket defers the queue (never the whole
    /// shard) until the window resets.
    pub async fn send(&mut self, message: GatewayMessage) -> Result<(), Error> {
        self.pending_sends.push_back(message);
        self.flush_sends().await
    }

    /// Drain queued sends until a gate stops the head of the queue.
    async fn flush_sends(&mut self) -> Result<(), Error> {
        loop {
            let gated = match self.pending_sends.front() {
                None => return Ok(()),
                Some(message) => {
                    self.status != ShardStatus::Ready && !message.op.is_critical()
                }
            };
            if gated {
                trace!(
                    "[SHARD-{}] Holding {} queued send(s) until ready",
                    self.id,
                    self.pending_sends.len()
                );
                return Ok(());
            }

            if self.connection.is_none() {
                self.pending_sends.pop_front();
                return Err(Error::ConnectionClosed { waiting: "socket" });
            }

            if let Err(ready_at) = self.send_limiter.try_acquire() {
                debug!(
                    "[SHARD-{}] Send window exhausted, resuming sends in {:?}",
                    self.id,
                    ready_at.saturating_duration_since(Instant::now())
                );
                self.send_ready_at = Some(ready_at);
                return Ok(());
            }

            if let Some(message) = self.pending_sends.pop_front() {
                self.write_frame(&message).await?;
            }
        }
    }

    /// Write one frame to the socket. Internal protocol sends
    /// (heartbeat, identify, resume) call this directly: they bypass the
    /// token bucket, which is what the post-exhaustion refill reserves
    /// headroom for.
    async fn write_frame(&mut self, message: &GatewayMessage) -> Result<(), Error> {
        let json = serde_json::to_string(message)?;
        let connection = self
            .connection
            .as_mut()
            .ok_or(Error::ConnectionClosed { waiting: "socket" })?;
        connection.send(Message::Text(json)).await?;
        Ok(())
    }

    // ===== Inbound =====

    /// Resolve the next frame, pending forever while disconnected.
    async fn next_frame(connection: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
        match connection.as_mut() {
            Some(stream) => stream.next().await,
            None => std::future::pending().await,
        }
    }

    /// Loop over frames and timers until `target` is reached, the wait
    /// deadline passes, or the connection goes away.
    async fn wait_until(&mut self, target: WaitFor) -> Result<(), Error> {
        loop {
            if self.connection.is_none() {
                return Err(Error::ConnectionClosed {
                    waiting: target.name(),
                });
            }

            let heartbeat_at = self.heartbeat.next_at;
            let deadline = self.wait_deadline;

            tokio::select! {
                frame = Self::next_frame(&mut self.connection) => {
                    match self.process_frame(frame).await? {
                        FrameEvent::Hello if target == WaitFor::Hello => {
                            self.wait_deadline = None;
                            return Ok(());
                        }
                        FrameEvent::BecameReady if target == WaitFor::Ready => {
                            self.wait_deadline = None;
                            return Ok(());
                        }
                        FrameEvent::Closed => {
                            return Err(Error::ConnectionClosed { waiting: target.name() });
                        }
                        _ => {}
                    }
                }
                _ = maybe_sleep_until(heartbeat_at) => {
                    self.heartbeat(false).await?;
                }
                _ = maybe_sleep_until(deadline) => {
                    let waited = match target {
                        WaitFor::Hello => self.ctx.config().hello_timeout,
                        WaitFor::Ready => self.ctx.config().ready_timeout,
                    };
                    return Err(Error::Timeout {
                        waiting: target.name(),
                        waited_ms: waited.as_millis() as u64,
                    });
                }
            }
        }
    }

    /// Decode and route one socket frame.
    async fn process_frame(
        &mut self,
        frame: Option<Result<Message, WsError>>,
    ) -> Result<FrameEvent, Error> {
        match frame {
            Some(Ok(Message::Text(text))) => self.handle_payload(text.as_bytes()).await,
            Some(Ok(Message::Binary(data))) => match self.compression {
                CompressionMode::Transport => {
                    let inflater = self
                        .inflater
                        .as_mut()
                        .ok_or_else(|| Error::Decompression("no inflate context".to_string()))?;
                    match inflater.push(&data) {
                        // Partial message: buffered, nothing to parse yet
                        Ok(None) => Ok(FrameEvent::Continue),
                        Ok(Some(bytes)) => self.handle_payload(&bytes).await,
                        Err(e) => {
                            // Non-fatal by itself; the connection stays up
                            warn!("[SHARD-{}] Inflate failed: {}", self.id, e);
                            self.emit(ShardEvent::Error {
                                kind: ErrorKind::Decode,
                                message: e.to_string(),
                            });
                            Ok(FrameEvent::Continue)
                        }
                    }
                }
                _ => match inflate_payload(&data) {
                    Ok(bytes) => self.handle_payload(&bytes).await,
                    Err(e) => {
                        warn!("[SHARD-{}] Payload inflate failed: {}", self.id, e);
                        self.emit(ShardEvent::Error {
                            kind: ErrorKind::Decode,
                            message: e.to_string(),
                        });
                        Ok(FrameEvent::Continue)
                    }
                },
            },
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                self.handle_close(code).await
            }
            // Pings and pongs are answered by the transport layer
            Some(Ok(_)) => Ok(FrameEvent::Continue),
            Some(Err(e)) => {
                warn!("[SHARD-{}] WebSocket error: {}", self.id, e);
                self.emit(ShardEvent::Error {
                    kind: ErrorKind::WebSocket,
                    message: e.to_string(),
                });
                self.destroy(DestroyOptions {
                    code: None,
                    recover: Some(Recovery::Resume),
                })
                .await;
                Ok(FrameEvent::Closed)
            }
            None => {
                debug!("[SHARD-{}] Stream ended without a close frame", self.id);
                self.handle_close(None).await
            }
        }
    }

    /// Parse a decoded JSON payload and route it by opcode.
    async fn handle_payload(&mut self, bytes: &[u8]) -> Result<FrameEvent, Error> {
        let message: GatewayMessage = match serde_json::from_slice(bytes) {
            Ok(message) => message,
            Err(e) => {
                // Undecodable frames (bad JSON or unknown opcode) sever
                // the session: reconnect with a fresh Identify.
                warn!("[SHARD-{}] Failed to decode frame: {}", self.id, e);
                self.emit(ShardEvent::Error {
                    kind: ErrorKind::Decode,
                    message: e.to_string(),
                });
                self.destroy(DestroyOptions {
                    code: None,
                    recover: Some(Recovery::Reconnect),
                })
                .await;
                return Ok(FrameEvent::Closed);
            }
        };

        trace!("[SHARD-{}] {}", self.id, message);

        match message.op {
            OpCode::Dispatch => self.handle_dispatch(message).await,
            OpCode::Heartbeat => {
                debug!("[SHARD-{}] Server requested a heartbeat", self.id);
                self.heartbeat(true).await?;
                Ok(if self.connection.is_some() {
                    FrameEvent::Continue
                } else {
                    FrameEvent::Closed
                })
            }
            OpCode::Reconnect => {
                info!("[SHARD-{}] Server requested reconnect", self.id);
                self.destroy(DestroyOptions {
                    code: None,
                    recover: Some(Recovery::Resume),
                })
                .await;
                Ok(FrameEvent::Closed)
            }
            OpCode::InvalidSession => {
                let resumable = message.as_invalid_session().unwrap_or(false);
                info!(
                    "[SHARD-{}] Session invalidated (resumable: {})",
                    self.id, resumable
                );

                // Give the in-flight Ready wait a fresh allowance
                if self.wait_deadline.is_some() {
                    self.wait_deadline =
                        Some(Instant::now() + self.ctx.config().ready_timeout);
                }

                match (resumable, self.session.clone()) {
                    (true, Some(session)) => {
                        self.send_resume(&session).await?;
                        Ok(FrameEvent::Continue)
                    }
                    _ => {
                        self.destroy(DestroyOptions {
                            code: None,
                            recover: Some(Recovery::Reconnect),
                        })
                        .await;
                        Ok(FrameEvent::Closed)
                    }
                }
            }
            OpCode::Hello => {
                let hello = message.as_hello().ok_or_else(|| {
                    Error::Decompression("Hello frame without heartbeat_interval".to_string())
                })?;
                let interval = Duration::from_millis(hello.heartbeat_interval);
                debug!(
                    "[SHARD-{}] Hello received, heartbeating every {:?}",
                    self.id, interval
                );
                self.heartbeat.start(interval);
                Ok(FrameEvent::Hello)
            }
            OpCode::HeartbeatAck => {
                if let Some(latency) = self.heartbeat.record_ack() {
                    trace!("[SHARD-{}] Heartbeat acked in {:?}", self.id, latency);
                    self.emit(ShardEvent::HeartbeatAck { latency });
                }
                Ok(FrameEvent::Continue)
            }
            OpCode::Identify | OpCode::Resume => {
                warn!(
                    "[SHARD-{}] Ignoring client-only opcode {} from server",
                    self.id,
                    message.op.as_u8()
                );
                Ok(FrameEvent::Continue)
            }
        }
    }

    /// Handle a Dispatch frame: sequence bookkeeping, session lifecycle,
    /// and event emission.
    async fn handle_dispatch(&mut self, message: GatewayMessage) -> Result<FrameEvent, Error> {
        if let Some(sequence) = message.s {
            self.note_sequence(sequence).await;
        }

        match message.t.as_deref() {
            Some("READY") => {
                let data = message.d.clone().unwrap_or_default();
                let ready: ReadyPayload = serde_json::from_value(data.clone())?;
                let session = SessionInfo {
                    session_id: ready.session_id,
                    sequence: self.sequence.unwrap_or_default(),
                    shard_id: self.id,
                    shard_count: self.ctx.shard_count(),
                    resume_url: ready.resume_gateway_url,
                };
                info!(
                    "[SHARD-{}] Ready (session {})",
                    self.id, session.session_id
                );
                self.ctx
                    .session_store()
                    .update(self.id, Some(session.clone()))
                    .await;
                self.session = Some(session);
                self.status = ShardStatus::Ready;
                self.emit(ShardEvent::Ready { data });
                self.flush_sends().await?;
                Ok(FrameEvent::BecameReady)
            }
            Some("RESUMED") => {
                info!(
                    "[SHARD-{}] Resumed ({} events replayed)",
                    self.id, self.replayed
                );
                self.status = ShardStatus::Ready;
                self.emit(ShardEvent::Resumed {
                    replayed: self.replayed,
                });
                self.flush_sends().await?;
                Ok(FrameEvent::BecameReady)
            }
            _ => {
                // Dispatches are delivered while Ready and while resuming
                // (replays must not be dropped); anything earlier is not
                // application traffic.
                if matches!(self.status, ShardStatus::Ready | ShardStatus::Resuming) {
                    if self.status == ShardStatus::Resuming {
                        self.replayed += 1;
                    }
                    self.emit(ShardEvent::Dispatch {
                        event: message.t.unwrap_or_default(),
                        data: message.d.unwrap_or_default(),
                    });
                }
                Ok(FrameEvent::Continue)
            }
        }
    }

    /// Record a dispatch sequence, persisting only forward movement.
    ///
    /// In-memory state is advanced synchronously before the store write,
    /// so a slow persistence call for a stale sequence can never clobber
    /// a newer one.
    async fn note_sequence(&mut self, sequence: u64) {
        if self.sequence.is_some_and(|current| sequence <= current) {
            trace!(
                "[SHARD-{}] Discarding stale sequence {} (current {:?})",
                self.id,
                sequence,
                self.sequence
            );
            return;
        }
        self.sequence = Some(sequence);

        if let Some(session) = self.session.as_mut() {
            if session.advance(sequence) {
                let snapshot = session.clone();
                self.ctx
                    .session_store()
                    .update(self.id, Some(snapshot))
                    .await;
            }
        }
    }

    /// Map a close code to its recovery and act on it.
    async fn handle_close(&mut self, code: Option<u16>) -> Result<FrameEvent, Error> {
        self.emit(ShardEvent::Closed { code });

        let behavior = match code {
            Some(code) => close_behavior(code),
            // Severed without a close frame: a transient network drop
            None => CloseBehavior::Resume,
        };

        match behavior {
            CloseBehavior::Fatal => {
                let code = code.unwrap_or_default();
                let reason = close_code_description(code).to_string();
                warn!("[SHARD-{}] Fatal close {}: {}", self.id, code, reason);
                self.teardown().await;
                Err(Error::FatalClose { code, reason })
            }
            CloseBehavior::Reconnect => {
                info!(
                    "[SHARD-{}] Closed with {:?} ({}), reconnecting with a fresh session",
                    self.id,
                    code,
                    code.map_or("no close frame", close_code_description)
                );
                self.destroy(DestroyOptions {
                    code: None,
                    recover: Some(Recovery::Reconnect),
                })
                .await;
                Ok(FrameEvent::Closed)
            }
            CloseBehavior::Resume => {
                // Unknown codes land here on purpose; log loudly enough
                // that a newly introduced fatal code is noticed.
                warn!(
                    "[SHARD-{}] Closed with {:?} ({}), attempting to resume",
                    self.id,
                    code,
                    code.map_or("no close frame", close_code_description)
                );
                self.destroy(DestroyOptions {
                    code: None,
                    recover: Some(Recovery::Resume),
                })
                .await;
                Ok(FrameEvent::Closed)
            }
        }
    }

    fn emit(&self, event: ShardEvent) {
        let _ = self.ctx.event_tx.send((self.id, event));
    }

    // ===== Task loop =====

    /// Drive the shard: commands, socket frames, heartbeats, and
    /// automatic recovery. Runs until the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ShardCommand>) {
        let mut reconnect_attempt = 0u32;

        loop {
            // Scheduled recovery takes priority over new work
            if self.status == ShardStatus::Idle {
                if let Some(recover) = self.recovery.take() {
                    let delay = self.ctx.config().backoff.delay_for_attempt(reconnect_attempt);
                    debug!(
                        "[SHARD-{}] Reconnecting in {:?} (attempt {})",
                        self.id,
                        delay,
                        reconnect_attempt + 1
                    );
                    tokio::time::sleep(delay).await;

                    match self.connect().await {
                        Ok(()) => {
                            reconnect_attempt = 0;
                        }
                        Err(e) => {
                            let kind = e.kind();
                            self.emit(ShardEvent::Error {
                                kind,
                                message: e.to_string(),
                            });
                            if kind == ErrorKind::FatalClose {
                                warn!(
                                    "[SHARD-{}] Fatal error during recovery, giving up: {}",
                                    self.id, e
                                );
                            } else {
                                reconnect_attempt += 1;
                                // A close mid-handshake queues its own
                                // recovery; otherwise retry the same mode
                                if self.recovery.is_none() {
                                    self.recovery = Some(recover);
                                }
                            }
                        }
                    }
                    continue;
                }
            }

            let heartbeat_at = self.heartbeat.next_at;
            let send_at = self.send_ready_at;

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("[SHARD-{}] Command channel closed", self.id);
                            self.destroy(DestroyOptions::default()).await;
                            return;
                        }
                    }
                }
                frame = Self::next_frame(&mut self.connection) => {
                    if let Err(e) = self.process_frame(frame).await {
                        self.emit(ShardEvent::Error {
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                }
                _ = maybe_sleep_until(heartbeat_at) => {
                    if let Err(e) = self.heartbeat(false).await {
                        warn!("[SHARD-{}] Heartbeat failed: {}", self.id, e);
                        self.destroy(DestroyOptions {
                            code: None,
                            recover: Some(Recovery::Resume),
                        })
                        .await;
                    }
                }
                _ = maybe_sleep_until(send_at) => {
                    self.send_ready_at = None;
                    if let Err(e) = self.flush_sends().await {
                        warn!("[SHARD-{}] Queued send failed: {}", self.id, e);
                        self.emit(ShardEvent::Error {
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: ShardCommand) {
        match command {
            ShardCommand::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            ShardCommand::Send(message) => {
                if let Err(e) = self.send(message).await {
                    warn!("[SHARD-{}] Send failed: {}", self.id, e);
                    self.emit(ShardEvent::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
            ShardCommand::Destroy { options, done } => {
                // After a terminal destroy the strategy drops its
                // handle, which closes the command channel and ends
                // the task.
                self.destroy(options).await;
                let _ = done.send(());
            }
            ShardCommand::Status(reply) => {
                let _ = reply.send(self.status);
            }
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Append the protocol version, encoding, and optional compression query
/// parameters to the gateway URL.
fn build_connect_url(
    base: &str,
    version: u16,
    compression: CompressionMode,
) -> Result<String, Error> {
    let mut url = Url::parse(base)
        .map_err(|e| Error::GatewayInfo(format!("invalid gateway URL '{base}': {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("v", &version.to_string());
        pairs.append_pair("encoding", "json");
        if compression == CompressionMode::Transport {
            pairs.append_pair("compress", "zlib-stream");
        }
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_connect_url() {
        let url = build_connect_url("wss://gateway.example", 10, CompressionMode::None).unwrap();
        assert_eq!(url, "wss://gateway.example/?v=10&encoding=json");

        let url =
            build_connect_url("wss://gateway.example", 10, CompressionMode::Transport).unwrap();
        assert!(url.ends_with("v=10&encoding=json&compress=zlib-stream"));

        // Payload compression is negotiated via Identify, not the URL
        let url = build_connect_url("wss://gateway.example", 9, CompressionMode::Payload).unwrap();
        assert_eq!(url, "wss://gateway.example/?v=9&encoding=json");
    }

    #[test]
    fn test_build_connect_url_rejects_garbage() {
        assert!(build_connect_url("not a url", 10, CompressionMode::None).is_err());
    }

    #[test]
    fn test_destroy_close_code_selection() {
        let resume = DestroyOptions {
            code: None,
            recover: Some(Recovery::Resume),
        };
        assert_eq!(resume.close_code(), CLOSE_CODE_RESUMING);

        let fresh = DestroyOptions {
            code: None,
            recover: Some(Recovery::Reconnect),
        };
        assert_eq!(fresh.close_code(), CLOSE_CODE_NORMAL);

        assert_eq!(DestroyOptions::default().close_code(), CLOSE_CODE_NORMAL);

        let explicit = DestroyOptions {
            code: Some(4321),
            recover: Some(Recovery::Resume),
        };
        assert_eq!(explicit.close_code(), 4321);
    }

    #[test]
    fn test_heartbeat_zombie_detection() {
        let mut state = HeartbeatState::default();
        state.start(Duration::from_secs(41));

        // Nothing outstanding yet
        assert!(!state.is_zombie(false));

        state.record_sent();
        // Unacked at the next unsolicited tick: zombie
        assert!(state.is_zombie(false));
        // A server-requested beat is always sent
        assert!(!state.is_zombie(true));

        state.record_ack();
        assert!(!state.is_zombie(false));
    }

    #[test]
    fn test_heartbeat_latency_from_ack() {
        let mut state = HeartbeatState::default();
        state.start(Duration::from_secs(41));
        state.record_sent();
        let latency = state.record_ack().expect("latency after ack");
        assert!(latency < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rate_limiter_window() {
        let mut limiter = SendRateLimiter::new();

        // The seeded window admits 120 sends
        for _ in 0..120 {
            limiter.try_acquire().expect("token within window");
        }

        // The 121st is refused with the window's reset instant; it never
        // sleeps itself
        let ready_at = limiter.try_acquire().expect_err("window exhausted");
        assert!(ready_at > Instant::now());

        // After exhaustion the window refills to 119
        tokio::time::sleep_until(ready_at).await;
        for _ in 0..119 {
            limiter.try_acquire().expect("token within refilled window");
        }
        assert!(limiter.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rate_limiter_refills_after_idle_window() {
        let mut limiter = SendRateLimiter::new();
        for _ in 0..120 {
            limiter.try_acquire().expect("token within window");
        }

        // Let the window lapse without being refused a token: the next
        // window gets the full quota back
        tokio::time::advance(SEND_WINDOW + Duration::from_secs(1)).await;

        for _ in 0..120 {
            limiter.try_acquire().expect("token after idle lapse");
        }
        assert!(limiter.try_acquire().is_err());
    }
}
