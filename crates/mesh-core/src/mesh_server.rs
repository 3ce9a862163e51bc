//! Inbound mesh listener.
//!
//! Accepts the peers' outbound links and classifies every decoded route
//! frame: replies complete the local request cache, `TO_CLIENT` packets are
//! handed to the local session layer, everything else goes to the node's
//! route handler (play dispatcher or API dispatcher).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use ph_protocol::{ResponsePacket, RoutePacket, route::decode_route};

use crate::request_cache::{ReplyOutcome, RequestCache};

/// Receives every non-reply, non-client route packet addressed to this node.
/// Implementations must not block: classify and post, never execute inline.
pub trait RouteHandler: Send + Sync {
    fn on_route(&self, packet: RoutePacket);
}

/// Delivery surface for `TO_CLIENT` packets: hands a response frame to the
/// local session with id `sid`, if it still exists.
pub trait ClientSink: Send + Sync {
    fn deliver(&self, sid: i64, response: ResponsePacket);
}

/// The pieces an inbound link needs to route traffic on this node.
#[derive(Clone)]
pub struct MeshNode {
    pub cache: Arc<RequestCache>,
    pub handler: Arc<dyn RouteHandler>,
    pub client_sink: Option<Arc<dyn ClientSink>>,
    pub max_packet_size: u32,
}

impl MeshNode {
    /// Classify one inbound packet. Split out of the read loop for tests.
    pub fn dispatch(&self, pkt: RoutePacket) {
        if pkt.header.is_reply() {
            let outcome = if pkt.header.error_code == 0 {
                ReplyOutcome::Reply(pkt.clone())
            } else {
                ReplyOutcome::Error(pkt.header.error_code)
            };
            if !self.cache.complete(pkt.header.msg_seq, outcome) {
                debug!(msg_seq = pkt.header.msg_seq, msg_id = %pkt.msg_id, "unmatched reply dropped");
            }
            return;
        }
        if pkt.header.is_to_client() {
            match &self.client_sink {
                Some(sink) => sink.deliver(pkt.header.sid, pkt.into_response()),
                None => warn!(msg_id = %pkt.msg_id, "client-bound packet on a node without sessions"),
            }
            return;
        }
        self.handler.on_route(pkt);
    }
}

// ---------------------------------------------------------------------------
// MeshServer
// ---------------------------------------------------------------------------

/// The node's mesh listener. Dropping the handle stops accepting; links
/// already established drain independently.
pub struct MeshServer {
    addr: SocketAddr,
    _accept_task: tokio::task::JoinHandle<()>,
}

impl MeshServer {
    /// Bind the mesh listener (use port 0 to let the OS choose) and start
    /// accepting peer links.
    pub async fn bind(addr: &str, node: MeshNode) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "mesh listener bound");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let node = node.clone();
                        tokio::spawn(async move {
                            read_link(stream, peer, node).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "mesh accept failed");
                        break;
                    }
                }
            }
        });

        Ok(MeshServer { addr: local, _accept_task: accept_task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Drain one inbound link until the peer closes it or a frame is malformed.
async fn read_link(mut stream: TcpStream, peer: SocketAddr, node: MeshNode) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        loop {
            match decode_route(&mut buf, node.max_packet_size) {
                Ok(Some(pkt)) => node.dispatch(pkt),
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "malformed mesh frame, closing link");
                    return;
                }
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(peer = %peer, "mesh link closed by peer");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %peer, error = %e, "mesh link read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ph_protocol::{RouteHeader, error_codes, flags};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        routed: Mutex<Vec<RoutePacket>>,
        delivered: Mutex<Vec<(i64, ResponsePacket)>>,
    }

    impl RouteHandler for Recorder {
        fn on_route(&self, packet: RoutePacket) {
            self.routed.lock().expect("lock").push(packet);
        }
    }

    impl ClientSink for Recorder {
        fn deliver(&self, sid: i64, response: ResponsePacket) {
            self.delivered.lock().expect("lock").push((sid, response));
        }
    }

    fn node(recorder: &Arc<Recorder>, cache: Arc<RequestCache>) -> MeshNode {
        MeshNode {
            cache,
            handler: Arc::clone(recorder) as Arc<dyn RouteHandler>,
            client_sink: Some(Arc::clone(recorder) as Arc<dyn ClientSink>),
            max_packet_size: 1024,
        }
    }

    fn packet(packet_flags: u8, msg_seq: u16, error_code: u16) -> RoutePacket {
        RoutePacket {
            header: RouteHeader {
                from_nid: "play-2".to_owned(),
                sid: 31,
                msg_seq,
                error_code,
                flags: packet_flags,
                ..Default::default()
            },
            msg_id: "Msg".to_owned(),
            payload: bytes::Bytes::new(),
        }
    }

    #[tokio::test]
    async fn replies_complete_the_cache_not_the_handler() {
        let recorder = Arc::new(Recorder::default());
        let cache = RequestCache::new();
        let n = node(&recorder, Arc::clone(&cache));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let seq = cache.register(
            "play-2",
            Duration::from_secs(5),
            None,
            Box::new(move |o| {
                let _ = tx.send(o.error_code());
            }),
        );
        n.dispatch(packet(flags::REPLY, seq, 0));
        assert_eq!(rx.await.expect("completed"), error_codes::SUCCESS);
        assert!(recorder.routed.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn error_replies_resolve_to_the_carried_code() {
        let recorder = Arc::new(Recorder::default());
        let cache = RequestCache::new();
        let n = node(&recorder, Arc::clone(&cache));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let seq = cache.register(
            "play-2",
            Duration::from_secs(5),
            None,
            Box::new(move |o| {
                let _ = tx.send(o.error_code());
            }),
        );
        n.dispatch(packet(flags::REPLY, seq, error_codes::STAGE_NOT_FOUND));
        assert_eq!(rx.await.expect("completed"), error_codes::STAGE_NOT_FOUND);
    }

    #[tokio::test]
    async fn unmatched_reply_is_dropped() {
        let recorder = Arc::new(Recorder::default());
        let n = node(&recorder, RequestCache::new());
        n.dispatch(packet(flags::REPLY, 999, 0));
        assert!(recorder.routed.lock().expect("lock").is_empty());
        assert!(recorder.delivered.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn client_bound_packets_reach_the_sink() {
        let recorder = Arc::new(Recorder::default());
        let n = node(&recorder, RequestCache::new());
        n.dispatch(packet(flags::TO_CLIENT, 5, 0));
        let delivered = recorder.delivered.lock().expect("lock");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, 31);
        assert_eq!(delivered[0].1.msg_seq, 5);
    }

    #[tokio::test]
    async fn plain_packets_reach_the_route_handler() {
        let recorder = Arc::new(Recorder::default());
        let n = node(&recorder, RequestCache::new());
        n.dispatch(packet(0, 7, 0));
        assert_eq!(recorder.routed.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn listener_decodes_frames_from_a_real_link() {
        let recorder = Arc::new(Recorder::default());
        let n = node(&recorder, RequestCache::new());
        let server = MeshServer::bind("127.0.0.1:0", n).await.expect("bind");

        let mut stream =
            TcpStream::connect(server.local_addr()).await.expect("connect");
        let mut buf = BytesMut::new();
        ph_protocol::route::encode_route(&packet(0, 3, 0), &mut buf).expect("encode");
        tokio::io::AsyncWriteExt::write_all(&mut stream, &buf).await.expect("write");

        // Wait for the background reader to dispatch.
        for _ in 0..50 {
            if !recorder.routed.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.routed.lock().expect("lock").len(), 1);
    }
}
