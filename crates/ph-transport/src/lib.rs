// ph-transport: the client-facing session transport.
//
// A SessionServer owns one listener per configured transport kind and a
// session registry. Every accepted connection becomes a Session with three
// tasks: a socket reader (framing + heartbeat), a dispatch pump (hands
// parsed messages to the handler without blocking the reader), and a writer
// (batched, strictly FIFO). Sessions register in the table before any I/O
// task starts, so a reply can never race ahead of the lookup.
//
// TLS is the integrator's: sessions are generic over the byte stream, so an
// upstream-negotiated TLS stream plugs in where a TcpStream does.

use std::time::Duration;

pub mod pool;
pub mod registry;
pub mod server;
pub mod session;

pub use pool::BufferPool;
pub use registry::SessionRegistry;
pub use server::SessionServer;
pub use session::{Binding, Session, SessionHandle, SessionState};

use ph_protocol::ClientPacket;

// ---------------------------------------------------------------------------
// Handler hook
// ---------------------------------------------------------------------------

/// The dispatch surface the transport delivers into.
///
/// Both hooks run on the session's dispatch pump and must hand work off
/// (post to a mailbox, spawn) rather than execute it inline; a blocked hook
/// stalls only its own session, but stalls it completely.
pub trait SessionHandler: Send + Sync {
    fn on_message(&self, session: &SessionHandle, packet: ClientPacket);
    /// Fired exactly once per session, after the socket is gone.
    fn on_disconnect(&self, session: &SessionHandle);
    /// Fired before the session closes on a fatal framing error.
    fn on_protocol_error(&self, session: &SessionHandle, error: &ph_protocol::WireError) {
        let _ = (session, error);
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bind failed on {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("no transport kind configured")]
    NothingToBind,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Transport options, spec defaults baked in. `tcp_bind`/`ws_bind` choose
/// the enabled kinds; both may be set at once.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tcp_bind: Option<String>,
    pub ws_bind: Option<String>,
    /// WebSocket upgrade path; requests for any other path are refused.
    pub ws_path: String,
    pub max_packet_size: u32,
    pub heartbeat_timeout: Duration,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Inbound bytes buffered between reader and dispatch before the reader
    /// pauses.
    pub pause_writer_threshold: usize,
    /// Reader resumes once the buffered backlog drops below this.
    pub resume_writer_threshold: usize,
    /// Max queued responses folded into one socket write.
    pub write_batch: usize,
    /// Best-effort outbound drain window on graceful close.
    pub drain_timeout: Duration,
    /// Enable SO_KEEPALIVE on the TCP listener (inherited by accepted
    /// sockets); probe timings stay at kernel defaults.
    pub tcp_keepalive: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            tcp_bind: None,
            ws_bind: None,
            ws_path: "/ws".to_owned(),
            max_packet_size: ph_protocol::DEFAULT_MAX_PACKET_SIZE,
            heartbeat_timeout: Duration::from_secs(90),
            receive_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
            pause_writer_threshold: 256 * 1024,
            resume_writer_threshold: 64 * 1024,
            write_batch: 100,
            drain_timeout: Duration::from_secs(5),
            tcp_keepalive: false,
        }
    }
}
