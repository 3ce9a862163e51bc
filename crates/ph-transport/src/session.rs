//! Per-connection session machinery.
//!
//! Each session runs three tasks:
//!
//! - **reader**: frames bytes off the socket under the heartbeat timeout and
//!   feeds parsed packets to the pump through the inbound gate.
//! - **pump**: hands packets to the `SessionHandler` in arrival order. The
//!   gate between reader and pump buffers up to `pause_writer_threshold`
//!   bytes before the reader stops pulling from the socket, and releases it
//!   below `resume_writer_threshold`.
//! - **writer**: drains the outbound queue strictly FIFO, folding up to
//!   `write_batch` frames into each socket write.
//!
//! Lifecycle: `Accepting` → `Handshook` (registered) → `Active` (first
//! frame) → `Closing` (drain) → `Closed`. The disconnect hook fires exactly
//! once, from the reader's cleanup path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use ph_protocol::{ClientPacket, ResponsePacket, decode_request, decode_request_body, encode_response, encode_response_body};

use crate::pool::BufferPool;
use crate::registry::SessionRegistry;
use crate::{SessionHandler, TransportConfig};

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepting,
    Handshook,
    Active,
    Closing,
    Closed,
}

/// Binding established by a successful join: which actor this connection
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub account_id: String,
    pub stage_id: i64,
}

pub(crate) enum WriterCmd {
    Frame(ResponsePacket),
    Pong(Vec<u8>),
    Close,
}

struct SessionInner {
    sid: i64,
    peer: String,
    out_tx: mpsc::UnboundedSender<WriterCmd>,
    state: Mutex<SessionState>,
    binding: Mutex<Option<Binding>>,
    last_activity: Mutex<Instant>,
    disconnect_fired: AtomicBool,
}

/// Thread-safe handle to one client connection. Cloneable; the underlying
/// session lives until its socket closes.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub(crate) fn new(sid: i64, peer: String) -> (Self, mpsc::UnboundedReceiver<WriterCmd>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let inner = SessionInner {
            sid,
            peer,
            out_tx,
            state: Mutex::new(SessionState::Accepting),
            binding: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            disconnect_fired: AtomicBool::new(false),
        };
        (SessionHandle { inner: Arc::new(inner) }, out_rx)
    }

    /// A session with no socket behind it; written frames surface on the
    /// returned receiver. Test harnesses register these in a real registry.
    pub fn piped(sid: i64) -> (Self, mpsc::UnboundedReceiver<ResponsePacket>) {
        let (handle, mut cmd_rx) = Self::new(sid, "piped".to_owned());
        handle.set_state(SessionState::Handshook);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    WriterCmd::Frame(pkt) => {
                        if tx.send(pkt).is_err() {
                            break;
                        }
                    }
                    WriterCmd::Pong(_) => {}
                    WriterCmd::Close => break,
                }
            }
        });
        (handle, rx)
    }

    pub fn sid(&self) -> i64 {
        self.inner.sid
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().expect("state lock")
    }

    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock().expect("activity lock")
    }

    pub fn bind(&self, account_id: impl Into<String>, stage_id: i64) {
        *self.inner.binding.lock().expect("binding lock") =
            Some(Binding { account_id: account_id.into(), stage_id });
    }

    pub fn binding(&self) -> Option<Binding> {
        self.inner.binding.lock().expect("binding lock").clone()
    }

    /// Queue a response frame. Non-blocking, FIFO with every other send on
    /// this session. False once the session is closing or gone.
    pub fn send_response(&self, packet: ResponsePacket) -> bool {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return false;
        }
        self.inner.out_tx.send(WriterCmd::Frame(packet)).is_ok()
    }

    /// Begin a graceful close: already-queued frames drain best-effort
    /// within the configured window, then the socket shuts down.
    pub fn close(&self, reason: &str) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        debug!(sid = self.inner.sid, reason, "session closing");
        let _ = self.inner.out_tx.send(WriterCmd::Close);
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.inner.state.lock().expect("state lock") = state;
    }

    pub(crate) fn touch(&self) {
        *self.inner.last_activity.lock().expect("activity lock") = Instant::now();
    }

    fn mark_active(&self) {
        let mut state = self.inner.state.lock().expect("state lock");
        if *state == SessionState::Handshook {
            *state = SessionState::Active;
        }
    }

    fn fire_disconnect(&self, handler: &Arc<dyn SessionHandler>) {
        if !self.inner.disconnect_fired.swap(true, Ordering::SeqCst) {
            self.set_state(SessionState::Closed);
            handler.on_disconnect(self);
        }
    }

    pub(crate) fn send_pong(&self, data: Vec<u8>) {
        let _ = self.inner.out_tx.send(WriterCmd::Pong(data));
    }
}

// ---------------------------------------------------------------------------
// Inbound gate (reader-side backpressure)
// ---------------------------------------------------------------------------

struct InboundGate {
    queued: AtomicUsize,
    pause: usize,
    resume: usize,
    released: Notify,
}

impl InboundGate {
    fn new(pause: usize, resume: usize) -> Self {
        InboundGate { queued: AtomicUsize::new(0), pause, resume, released: Notify::new() }
    }

    fn add(&self, len: usize) {
        self.queued.fetch_add(len, Ordering::AcqRel);
    }

    fn sub(&self, len: usize) {
        let before = self.queued.fetch_sub(len, Ordering::AcqRel);
        if before.saturating_sub(len) < self.resume {
            self.released.notify_waiters();
        }
    }

    /// Park the reader while the pump's backlog is over the pause mark.
    async fn throttle(&self) {
        loop {
            if self.queued.load(Ordering::Acquire) <= self.pause {
                return;
            }
            let released = self.released.notified();
            if self.queued.load(Ordering::Acquire) <= self.pause {
                return;
            }
            released.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Session tasks
// ---------------------------------------------------------------------------

pub struct Session;

struct SessionCtx {
    handle: SessionHandle,
    cfg: Arc<TransportConfig>,
    pool: Arc<BufferPool>,
    handler: Arc<dyn SessionHandler>,
    registry: Arc<SessionRegistry>,
}

impl Session {
    /// Start the task trio over a framed TCP-style byte stream. The handle
    /// must already be registered.
    pub(crate) fn spawn_framed<S>(
        stream: S,
        handle: SessionHandle,
        writer_rx: mpsc::UnboundedReceiver<WriterCmd>,
        cfg: Arc<TransportConfig>,
        pool: Arc<BufferPool>,
        handler: Arc<dyn SessionHandler>,
        registry: Arc<SessionRegistry>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        handle.set_state(SessionState::Handshook);
        let (read_half, write_half) = tokio::io::split(stream);
        let ctx = SessionCtx { handle, cfg, pool, handler, registry };
        let gate = Arc::new(InboundGate::new(
            ctx.cfg.pause_writer_threshold,
            ctx.cfg.resume_writer_threshold,
        ));
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        spawn_pump(&ctx, Arc::clone(&gate), in_rx);
        spawn_framed_writer(&ctx, write_half, writer_rx);
        tokio::spawn(read_framed(ctx, read_half, gate, in_tx));
    }

    /// Start the task trio over an accepted WebSocket. Bodies arrive without
    /// the outer length prefix; the WS layer frames them.
    pub(crate) fn spawn_websocket<S>(
        ws: WebSocketStream<S>,
        handle: SessionHandle,
        writer_rx: mpsc::UnboundedReceiver<WriterCmd>,
        cfg: Arc<TransportConfig>,
        pool: Arc<BufferPool>,
        handler: Arc<dyn SessionHandler>,
        registry: Arc<SessionRegistry>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        handle.set_state(SessionState::Handshook);
        let (ws_tx, ws_rx) = ws.split();
        let ctx = SessionCtx { handle, cfg, pool, handler, registry };
        let gate = Arc::new(InboundGate::new(
            ctx.cfg.pause_writer_threshold,
            ctx.cfg.resume_writer_threshold,
        ));
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        spawn_pump(&ctx, Arc::clone(&gate), in_rx);
        spawn_ws_writer(&ctx, ws_tx, writer_rx);
        tokio::spawn(read_websocket(ctx, ws_rx, gate, in_tx));
    }
}

fn spawn_pump(
    ctx: &SessionCtx,
    gate: Arc<InboundGate>,
    mut in_rx: mpsc::UnboundedReceiver<(ClientPacket, usize)>,
) {
    let handle = ctx.handle.clone();
    let handler = Arc::clone(&ctx.handler);
    tokio::spawn(async move {
        while let Some((packet, cost)) = in_rx.recv().await {
            gate.sub(cost);
            handle.mark_active();
            handler.on_message(&handle, packet);
        }
    });
}

async fn read_framed<R>(
    ctx: SessionCtx,
    mut reader: R,
    gate: Arc<InboundGate>,
    in_tx: mpsc::UnboundedSender<(ClientPacket, usize)>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut buf = BytesMut::with_capacity(ctx.cfg.receive_buffer_size);
    loop {
        loop {
            match decode_request(&mut buf, ctx.cfg.max_packet_size) {
                Ok(Some(packet)) => {
                    let cost = frame_cost(&packet);
                    gate.add(cost);
                    if in_tx.send((packet, cost)).is_err() {
                        finish_session(&ctx);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(sid = ctx.handle.sid(), error = %e, "protocol violation");
                    ctx.handler.on_protocol_error(&ctx.handle, &e);
                    ctx.handle.close("protocol violation");
                    finish_session(&ctx);
                    return;
                }
            }
        }
        gate.throttle().await;

        match timeout(ctx.cfg.heartbeat_timeout, reader.read_buf(&mut buf)).await {
            Err(_) => {
                info!(sid = ctx.handle.sid(), "heartbeat timeout");
                ctx.handle.close("heartbeat timeout");
                break;
            }
            Ok(Ok(0)) => {
                debug!(sid = ctx.handle.sid(), "peer closed");
                break;
            }
            Ok(Ok(_)) => ctx.handle.touch(),
            Ok(Err(e)) => {
                debug!(sid = ctx.handle.sid(), error = %e, "read failed");
                break;
            }
        }
    }
    finish_session(&ctx);
}

async fn read_websocket<S>(
    ctx: SessionCtx,
    mut ws_rx: futures_util::stream::SplitStream<WebSocketStream<S>>,
    gate: Arc<InboundGate>,
    in_tx: mpsc::UnboundedSender<(ClientPacket, usize)>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        gate.throttle().await;
        let msg = match timeout(ctx.cfg.heartbeat_timeout, ws_rx.next()).await {
            Err(_) => {
                info!(sid = ctx.handle.sid(), "heartbeat timeout");
                ctx.handle.close("heartbeat timeout");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                debug!(sid = ctx.handle.sid(), error = %e, "websocket read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        ctx.handle.touch();
        match msg {
            Message::Binary(data) => {
                if data.len() > ctx.cfg.max_packet_size as usize {
                    let err = ph_protocol::WireError::FrameTooLarge(
                        data.len() as u32,
                        ctx.cfg.max_packet_size,
                    );
                    warn!(sid = ctx.handle.sid(), error = %err, "protocol violation");
                    ctx.handler.on_protocol_error(&ctx.handle, &err);
                    ctx.handle.close("protocol violation");
                    break;
                }
                let mut body = BytesMut::from(&data[..]);
                match decode_request_body(&mut body) {
                    Ok(packet) => {
                        let cost = frame_cost(&packet);
                        gate.add(cost);
                        if in_tx.send((packet, cost)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(sid = ctx.handle.sid(), error = %e, "protocol violation");
                        ctx.handler.on_protocol_error(&ctx.handle, &e);
                        ctx.handle.close("protocol violation");
                        break;
                    }
                }
            }
            Message::Ping(data) => ctx.handle.send_pong(data.to_vec()),
            Message::Pong(_) => {}
            other => {
                warn!(sid = ctx.handle.sid(), "ignoring non-binary websocket message: {other:?}");
            }
        }
    }
    finish_session(&ctx);
}

fn spawn_framed_writer<W>(
    ctx: &SessionCtx,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let cfg = Arc::clone(&ctx.cfg);
    let pool = Arc::clone(&ctx.pool);
    let sid = ctx.handle.sid();
    tokio::spawn(async move {
        let mut cmds = Vec::with_capacity(cfg.write_batch);
        'run: loop {
            let received = rx.recv_many(&mut cmds, cfg.write_batch).await;
            if received == 0 {
                break;
            }
            let mut buf = pool.acquire();
            let mut closing = false;
            for cmd in cmds.drain(..) {
                match cmd {
                    WriterCmd::Frame(pkt) => {
                        if let Err(e) = encode_response(&pkt, &mut buf) {
                            warn!(sid, msg_id = %pkt.msg_id, error = %e, "unencodable response dropped");
                        }
                    }
                    WriterCmd::Pong(_) => {}
                    WriterCmd::Close => {
                        closing = true;
                        break;
                    }
                }
            }
            if closing {
                // Best-effort drain of everything queued ahead of the close.
                let _ = timeout(cfg.drain_timeout, writer.write_all(&buf)).await;
                pool.recycle(buf);
                break 'run;
            }
            let result = writer.write_all(&buf).await;
            pool.recycle(buf);
            if result.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
}

fn spawn_ws_writer<S>(
    ctx: &SessionCtx,
    mut ws_tx: futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let cfg = Arc::clone(&ctx.cfg);
    let sid = ctx.handle.sid();
    tokio::spawn(async move {
        let mut cmds = Vec::with_capacity(cfg.write_batch);
        'run: loop {
            let received = rx.recv_many(&mut cmds, cfg.write_batch).await;
            if received == 0 {
                break;
            }
            let mut closing = false;
            for cmd in cmds.drain(..) {
                match cmd {
                    WriterCmd::Frame(pkt) => {
                        let mut body = BytesMut::new();
                        if let Err(e) = encode_response_body(&pkt, &mut body) {
                            warn!(sid, msg_id = %pkt.msg_id, error = %e, "unencodable response dropped");
                            continue;
                        }
                        if ws_tx.feed(Message::Binary(body.freeze())).await.is_err() {
                            break 'run;
                        }
                    }
                    WriterCmd::Pong(data) => {
                        if ws_tx.feed(Message::Pong(data.into())).await.is_err() {
                            break 'run;
                        }
                    }
                    WriterCmd::Close => {
                        closing = true;
                        break;
                    }
                }
            }
            if closing {
                let _ = timeout(cfg.drain_timeout, ws_tx.flush()).await;
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            if ws_tx.flush().await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });
}

/// Approximate buffered cost of a parsed frame, for the inbound gate.
fn frame_cost(packet: &ClientPacket) -> usize {
    packet.payload.len() + packet.msg_id.len() + 16
}

fn finish_session(ctx: &SessionCtx) {
    ctx.registry.remove(ctx.handle.sid());
    // Stop the writer if the close didn't originate from us.
    ctx.handle.close("session finished");
    ctx.handle.fire_disconnect(&ctx.handler);
}
