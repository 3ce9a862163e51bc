//! Session table.
//!
//! One registry per transport server. Writes happen on accept and
//! disconnect; reads happen on every reply routed back to a client, so the
//! map stays behind a plain mutex with short critical sections.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use ph_protocol::ResponsePacket;

use crate::session::SessionHandle;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<i64, SessionHandle>>,
    next_sid: AtomicI64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic session ids, starting at 1.
    pub fn next_sid(&self) -> i64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, handle: SessionHandle) {
        self.sessions.lock().expect("registry lock").insert(handle.sid(), handle);
    }

    pub fn remove(&self, sid: i64) -> Option<SessionHandle> {
        self.sessions.lock().expect("registry lock").remove(&sid)
    }

    pub fn get(&self, sid: i64) -> Option<SessionHandle> {
        self.sessions.lock().expect("registry lock").get(&sid).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a response on session `sid`, if it is still connected.
    pub fn send_response(&self, sid: i64, packet: ResponsePacket) -> bool {
        match self.get(sid) {
            Some(handle) => handle.send_response(packet),
            None => false,
        }
    }

    /// Gracefully close every session (shutdown path).
    pub fn close_all(&self, reason: &str) {
        let handles: Vec<SessionHandle> =
            self.sessions.lock().expect("registry lock").values().cloned().collect();
        for handle in handles {
            handle.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sids_are_monotonic_from_one() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.next_sid(), 1);
        assert_eq!(registry.next_sid(), 2);
    }

    #[tokio::test]
    async fn send_response_reaches_only_registered_sessions() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = SessionHandle::piped(registry.next_sid());
        registry.register(handle.clone());

        assert!(registry.send_response(1, ResponsePacket::error("A", 1, 0, 0)));
        assert_eq!(rx.recv().await.expect("frame").msg_id, "A");

        assert!(!registry.send_response(99, ResponsePacket::error("B", 1, 0, 0)));

        registry.remove(1);
        assert!(!registry.send_response(1, ResponsePacket::error("C", 1, 0, 0)));
        assert!(registry.is_empty());
    }
}
