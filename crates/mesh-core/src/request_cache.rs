//! Pending-request correlation table.
//!
//! Every outbound request gets a fresh non-zero `msg_seq` and a table entry
//! `{deadline, target server, optional owning session, delivery slot}`.
//! Removal of the entry is the sole claim on the slot, so a reply, a
//! timeout, and a link drop can race freely — exactly one of them delivers.
//! The table is per node; the originator nid half of the correlation key is
//! implicit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use ph_protocol::{RoutePacket, error_codes};

/// What a completed request resolves to.
#[derive(Debug)]
pub enum ReplyOutcome {
    /// Success reply; `error_code` was 0.
    Reply(RoutePacket),
    /// Failure: a non-zero error code (remote error, `RequestTimeout`,
    /// `ConnectionClosed`).
    Error(u16),
}

impl ReplyOutcome {
    pub fn error_code(&self) -> u16 {
        match self {
            ReplyOutcome::Reply(_) => error_codes::SUCCESS,
            ReplyOutcome::Error(code) => *code,
        }
    }
}

/// Delivery slot invoked exactly once with the outcome. Callers wrap
/// whatever routing they need (oneshot completion, posting a mailbox item
/// back onto the owning stage loop) into this closure.
pub type ReplySlot = Box<dyn FnOnce(ReplyOutcome) + Send>;

struct Pending {
    deadline: Instant,
    target: String,
    session: Option<i64>,
    slot: ReplySlot,
}

// ---------------------------------------------------------------------------
// RequestCache
// ---------------------------------------------------------------------------

/// The pending-request table plus the `msg_seq` allocator.
pub struct RequestCache {
    entries: Mutex<HashMap<u16, Pending>>,
    seq: Mutex<u16>,
}

impl Default for RequestCache {
    fn default() -> Self {
        RequestCache { entries: Mutex::new(HashMap::new()), seq: Mutex::new(0) }
    }
}

impl RequestCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a pending request and return its assigned `msg_seq`.
    ///
    /// Sequence numbers are allocated from a wrapping u16 counter that skips
    /// 0 (reserved for push) and any value still pending, so no two live
    /// requests ever share a sequence.
    pub fn register(
        &self,
        target: &str,
        timeout: Duration,
        session: Option<i64>,
        slot: ReplySlot,
    ) -> u16 {
        self.register_with(target, timeout, session, move |_seq| slot)
    }

    /// Like [`register`](Self::register), but the slot is built with the
    /// assigned sequence in hand — before the entry can complete — so the
    /// caller can record the sequence for later bulk cancellation.
    pub fn register_with(
        &self,
        target: &str,
        timeout: Duration,
        session: Option<i64>,
        make_slot: impl FnOnce(u16) -> ReplySlot,
    ) -> u16 {
        let mut entries = self.entries.lock().expect("cache lock");
        let mut seq = self.seq.lock().expect("seq lock");
        loop {
            *seq = seq.wrapping_add(1);
            if *seq == 0 || entries.contains_key(&*seq) {
                continue;
            }
            break;
        }
        let assigned = *seq;
        let slot = make_slot(assigned);
        entries.insert(
            assigned,
            Pending {
                deadline: Instant::now() + timeout,
                target: target.to_owned(),
                session,
                slot,
            },
        );
        assigned
    }

    /// Complete the pending entry for `msg_seq`, if any. Returns false for
    /// unmatched sequences (late replies after timeout, duplicates) — the
    /// caller logs and drops those.
    pub fn complete(&self, msg_seq: u16, outcome: ReplyOutcome) -> bool {
        let removed = self.entries.lock().expect("cache lock").remove(&msg_seq);
        match removed {
            Some(pending) => {
                (pending.slot)(outcome);
                true
            }
            None => false,
        }
    }

    /// Complete every entry bound to `server_id` with `ConnectionClosed`.
    /// Called by the communicator when a link drops.
    pub fn fail_target(&self, server_id: &str) {
        self.fail_matching(|p| p.target == server_id, error_codes::CONNECTION_CLOSED);
    }

    /// Complete every entry whose reply would route back through session
    /// `sid` with `ConnectionClosed`. Called on client disconnect.
    pub fn fail_session(&self, sid: i64) {
        self.fail_matching(|p| p.session == Some(sid), error_codes::CONNECTION_CLOSED);
    }

    /// Complete a specific set of sequences with `error_code`. Used when a
    /// stage is destroyed with requests still in flight.
    pub fn fail_sequences(&self, seqs: &[u16], error_code: u16) {
        let mut claimed = Vec::with_capacity(seqs.len());
        {
            let mut entries = self.entries.lock().expect("cache lock");
            for seq in seqs {
                if let Some(p) = entries.remove(seq) {
                    claimed.push(p);
                }
            }
        }
        for p in claimed {
            (p.slot)(ReplyOutcome::Error(error_code));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().expect("cache lock").len()
    }

    /// Spawn the timeout sweeper: every 100 ms expired entries complete with
    /// `RequestTimeout`. The task runs for the life of the node.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            loop {
                tick.tick().await;
                cache.sweep(Instant::now());
            }
        })
    }

    /// One sweep pass; split out so tests can drive it without the task.
    pub fn sweep(&self, now: Instant) {
        let mut expired = Vec::new();
        {
            let mut entries = self.entries.lock().expect("cache lock");
            let dead: Vec<u16> = entries
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in dead {
                if let Some(p) = entries.remove(&seq) {
                    debug!(msg_seq = seq, target = %p.target, "request timed out");
                    expired.push(p);
                }
            }
        }
        for p in expired {
            (p.slot)(ReplyOutcome::Error(error_codes::REQUEST_TIMEOUT));
        }
    }

    fn fail_matching(&self, pred: impl Fn(&Pending) -> bool, error_code: u16) {
        let mut claimed = Vec::new();
        {
            let mut entries = self.entries.lock().expect("cache lock");
            let dead: Vec<u16> =
                entries.iter().filter(|(_, p)| pred(p)).map(|(seq, _)| *seq).collect();
            for seq in dead {
                if let Some(p) = entries.remove(&seq) {
                    warn!(msg_seq = seq, target = %p.target, error_code, "failing pending request");
                    claimed.push(p);
                }
            }
        }
        for p in claimed {
            (p.slot)(ReplyOutcome::Error(error_code));
        }
    }
}
