//! Mesh communicator: persistent outbound links.
//!
//! One TCP link per known server id, write-only — a reply to anything we
//! send travels back on the *responder's* outbound link and is matched by
//! `msg_seq` in our request cache (the router/dealer shape). Packets queue
//! on an unbounded channel per link; a writer task drains the queue in
//! batches into single writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use ph_protocol::{RoutePacket, route::encode_route};

use crate::request_cache::{ReplyOutcome, ReplySlot, RequestCache};

// How many queued packets a writer folds into one flush.
const WRITE_BATCH: usize = 100;

struct Link {
    address: String,
    tx: mpsc::UnboundedSender<RoutePacket>,
    generation: u64,
}

/// Outbound half of the mesh. Shared by senders, the resolver, and the
/// dispatchers.
pub struct MeshCommunicator {
    links: Mutex<HashMap<String, Link>>,
    next_generation: Mutex<u64>,
    cache: Arc<RequestCache>,
    max_packet_size: u32,
}

impl MeshCommunicator {
    pub fn new(cache: Arc<RequestCache>, max_packet_size: u32) -> Arc<Self> {
        Arc::new(MeshCommunicator {
            links: Mutex::new(HashMap::new()),
            next_generation: Mutex::new(0),
            cache,
            max_packet_size,
        })
    }

    pub fn request_cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.links.lock().expect("links lock").contains_key(server_id)
    }

    /// Establish the link to `server_id` if absent. Re-connecting an already
    /// linked server to the same address is a no-op; a changed address drops
    /// the old link first.
    pub async fn connect(self: &Arc<Self>, server_id: &str, address: &str) -> std::io::Result<()> {
        let moved = {
            let links = self.links.lock().expect("links lock");
            match links.get(server_id) {
                Some(link) if link.address == address => return Ok(()),
                Some(_) => true,
                None => false,
            }
        };
        if moved {
            // Address changed: the old link and its pending requests are
            // gone before the new link comes up.
            self.disconnect(server_id);
        }
        let stream = TcpStream::connect(address).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut next = self.next_generation.lock().expect("generation lock");
            *next += 1;
            *next
        };
        {
            let mut links = self.links.lock().expect("links lock");
            links.insert(
                server_id.to_owned(),
                Link { address: address.to_owned(), tx, generation },
            );
        }
        info!(server_id, address, "mesh link connected");

        let comm = Arc::clone(self);
        let id = server_id.to_owned();
        tokio::spawn(async move {
            comm.write_loop(&id, generation, stream, rx).await;
        });
        Ok(())
    }

    /// Drop the link to `server_id`, failing every pending request bound to
    /// it with `ConnectionClosed`. Idempotent.
    pub fn disconnect(&self, server_id: &str) {
        let removed = self.links.lock().expect("links lock").remove(server_id);
        if let Some(link) = removed {
            info!(server_id, address = %link.address, "mesh link disconnected");
        }
        self.cache.fail_target(server_id);
    }

    /// Enqueue `pkt` on the link to `target`, returning immediately.
    ///
    /// Without a link: pending requests fail through the cache with
    /// `ConnectionClosed`; pushes and replies are dropped with a log line.
    pub fn send(&self, target: &str, pkt: RoutePacket) {
        let tx = {
            let links = self.links.lock().expect("links lock");
            links.get(target).map(|l| l.tx.clone())
        };
        match tx {
            Some(tx) => {
                if let Err(mpsc::error::SendError(pkt)) = tx.send(pkt) {
                    self.drop_undeliverable(target, pkt);
                }
            }
            None => self.drop_undeliverable(target, pkt),
        }
    }

    /// Register a pending request, stamp its fresh `msg_seq`, and enqueue.
    /// The slot resolves with the reply, an error code, or `RequestTimeout`.
    pub fn request(
        &self,
        target: &str,
        mut pkt: RoutePacket,
        timeout: Duration,
        session: Option<i64>,
        slot: ReplySlot,
    ) -> u16 {
        let seq = self.cache.register(target, timeout, session, slot);
        pkt.header.msg_seq = seq;
        self.send(target, pkt);
        seq
    }

    /// `request`, resolved as a future. Dropping the future leaves the entry
    /// to the sweeper.
    pub fn request_future(
        &self,
        target: &str,
        pkt: RoutePacket,
        timeout: Duration,
        session: Option<i64>,
    ) -> impl std::future::Future<Output = ReplyOutcome> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        self.request(
            target,
            pkt,
            timeout,
            session,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        async move {
            match rx.await {
                Ok(outcome) => outcome,
                // Slot dropped without firing only if the node is tearing down.
                Err(_) => ReplyOutcome::Error(ph_protocol::error_codes::CONNECTION_CLOSED),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn drop_undeliverable(&self, target: &str, pkt: RoutePacket) {
        if pkt.header.is_request() {
            warn!(target, msg_id = %pkt.msg_id, msg_seq = pkt.header.msg_seq, "link down, failing request");
            self.cache.complete(
                pkt.header.msg_seq,
                ReplyOutcome::Error(ph_protocol::error_codes::CONNECTION_CLOSED),
            );
        } else {
            warn!(target, msg_id = %pkt.msg_id, "link down, dropping packet");
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        server_id: &str,
        generation: u64,
        mut stream: TcpStream,
        mut rx: mpsc::UnboundedReceiver<RoutePacket>,
    ) {
        let mut batch = Vec::with_capacity(WRITE_BATCH);
        let mut buf = BytesMut::new();
        loop {
            let received = rx.recv_many(&mut batch, WRITE_BATCH).await;
            if received == 0 {
                // Channel closed: disconnect() removed the link.
                break;
            }
            buf.clear();
            for pkt in batch.drain(..) {
                if let Err(e) = encode_route(&pkt, &mut buf) {
                    warn!(server_id, msg_id = %pkt.msg_id, error = %e, "unencodable packet dropped");
                }
            }
            if buf.len() > self.max_packet_size as usize {
                debug!(server_id, bytes = buf.len(), "flushing oversized batch");
            }
            if let Err(e) = stream.write_all(&buf).await {
                warn!(server_id, error = %e, "mesh link write failed");
                self.reap(server_id, generation);
                return;
            }
        }
        let _ = stream.shutdown().await;
    }

    /// Remove the link after a write failure, unless a newer link already
    /// replaced it, then fail its pending requests.
    fn reap(&self, server_id: &str, generation: u64) {
        let mut links = self.links.lock().expect("links lock");
        let stale = links.get(server_id).is_some_and(|l| l.generation == generation);
        if stale {
            links.remove(server_id);
        }
        drop(links);
        if stale {
            self.cache.fail_target(server_id);
        }
    }
}
