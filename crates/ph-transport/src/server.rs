//! Transport listeners.
//!
//! One `SessionServer` per play node. Binds the configured transport kinds
//! (framed TCP, WebSocket, either alone or both), assigns monotonic session
//! ids, and registers each session *before* starting its I/O tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::pool::BufferPool;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionHandle};
use crate::{SessionHandler, TransportConfig, TransportError};

pub struct SessionServer {
    registry: Arc<SessionRegistry>,
    tcp_addr: Option<SocketAddr>,
    ws_addr: Option<SocketAddr>,
    _accept_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SessionServer {
    /// Bind every configured transport kind and start accepting.
    pub async fn start(
        cfg: TransportConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, TransportError> {
        Self::start_with_registry(cfg, Arc::new(SessionRegistry::new()), handler).await
    }

    /// `start`, sharing a registry built ahead of time (the dispatcher holds
    /// the same table for reply routing).
    pub async fn start_with_registry(
        cfg: TransportConfig,
        registry: Arc<SessionRegistry>,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, TransportError> {
        if cfg.tcp_bind.is_none() && cfg.ws_bind.is_none() {
            return Err(TransportError::NothingToBind);
        }
        let cfg = Arc::new(cfg);
        let pool = Arc::new(BufferPool::new(cfg.send_buffer_size, 64));
        let mut tasks = Vec::new();
        let mut tcp_addr = None;
        let mut ws_addr = None;

        if let Some(bind) = cfg.tcp_bind.clone() {
            let listener = bind_tcp(&bind, &cfg).await?;
            tcp_addr = Some(listener.local_addr().map_err(|e| TransportError::Bind {
                addr: bind.clone(),
                source: e,
            })?);
            info!(addr = %tcp_addr.expect("just set"), "tcp transport listening");
            tasks.push(tokio::spawn(accept_tcp(
                listener,
                Arc::clone(&cfg),
                Arc::clone(&registry),
                Arc::clone(&pool),
                Arc::clone(&handler),
            )));
        }

        if let Some(bind) = cfg.ws_bind.clone() {
            let listener = bind_tcp(&bind, &cfg).await?;
            ws_addr = Some(listener.local_addr().map_err(|e| TransportError::Bind {
                addr: bind.clone(),
                source: e,
            })?);
            info!(addr = %ws_addr.expect("just set"), path = %cfg.ws_path, "websocket transport listening");
            tasks.push(tokio::spawn(accept_websocket(
                listener,
                Arc::clone(&cfg),
                Arc::clone(&registry),
                Arc::clone(&pool),
                Arc::clone(&handler),
            )));
        }

        Ok(SessionServer { registry, tcp_addr, ws_addr, _accept_tasks: tasks })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }
}

async fn bind_tcp(addr: &str, cfg: &TransportConfig) -> Result<TcpListener, TransportError> {
    let parsed: SocketAddr = addr
        .parse()
        .map_err(|e: std::net::AddrParseError| TransportError::Bind {
            addr: addr.to_owned(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;
    let socket = if parsed.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }
        .map_err(|e| TransportError::Bind { addr: addr.to_owned(), source: e })?;
    socket
        .set_reuseaddr(true)
        .map_err(|e| TransportError::Bind { addr: addr.to_owned(), source: e })?;
    if cfg.tcp_keepalive {
        socket
            .set_keepalive(true)
            .map_err(|e| TransportError::Bind { addr: addr.to_owned(), source: e })?;
    }
    let _ = socket.set_recv_buffer_size(cfg.receive_buffer_size as u32);
    let _ = socket.set_send_buffer_size(cfg.send_buffer_size as u32);
    socket
        .bind(parsed)
        .and_then(|()| socket.listen(1024))
        .map_err(|e| TransportError::Bind { addr: addr.to_owned(), source: e })
}

async fn accept_tcp(
    listener: TcpListener,
    cfg: Arc<TransportConfig>,
    registry: Arc<SessionRegistry>,
    pool: Arc<BufferPool>,
    handler: Arc<dyn SessionHandler>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                open_session(stream, peer, &cfg, &registry, &pool, &handler, false);
            }
            Err(e) => {
                warn!(error = %e, "tcp accept failed");
                break;
            }
        }
    }
}

async fn accept_websocket(
    listener: TcpListener,
    cfg: Arc<TransportConfig>,
    registry: Arc<SessionRegistry>,
    pool: Arc<BufferPool>,
    handler: Arc<dyn SessionHandler>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                open_session(stream, peer, &cfg, &registry, &pool, &handler, true);
            }
            Err(e) => {
                warn!(error = %e, "websocket accept failed");
                break;
            }
        }
    }
}

/// Register the session, then start I/O. For WebSocket connections the
/// upgrade handshake (with path check) runs first; a refused upgrade never
/// enters the table.
fn open_session(
    stream: TcpStream,
    peer: SocketAddr,
    cfg: &Arc<TransportConfig>,
    registry: &Arc<SessionRegistry>,
    pool: &Arc<BufferPool>,
    handler: &Arc<dyn SessionHandler>,
    websocket: bool,
) {
    let cfg = Arc::clone(cfg);
    let registry = Arc::clone(registry);
    let pool = Arc::clone(pool);
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        if websocket {
            let expected_path = cfg.ws_path.clone();
            let upgrade = tokio_tungstenite::accept_hdr_async(
                stream,
                move |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
                      response: tokio_tungstenite::tungstenite::handshake::server::Response| {
                    if request.uri().path() == expected_path {
                        Ok(response)
                    } else {
                        Err(tokio_tungstenite::tungstenite::handshake::server::Response::builder()
                            .status(404)
                            .body(Some("unknown path".to_owned()))
                            .expect("static refusal response"))
                    }
                },
            )
            .await;
            let ws = match upgrade {
                Ok(ws) => ws,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "websocket upgrade refused");
                    return;
                }
            };
            let sid = registry.next_sid();
            let (handle, writer_rx) = SessionHandle::new(sid, peer.to_string());
            registry.register(handle.clone());
            debug!(sid, peer = %peer, "websocket session open");
            Session::spawn_websocket(ws, handle, writer_rx, cfg, pool, handler, registry);
        } else {
            let sid = registry.next_sid();
            let (handle, writer_rx) = SessionHandle::new(sid, peer.to_string());
            registry.register(handle.clone());
            debug!(sid, peer = %peer, "tcp session open");
            Session::spawn_framed(stream, handle, writer_rx, cfg, pool, handler, registry);
        }
    });
}
