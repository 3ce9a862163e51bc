//! Server info center: the in-memory fleet snapshot.
//!
//! Single writer (the address resolver), many readers (communicator,
//! dispatchers, senders). `update` replaces the snapshot atomically and
//! returns the minimal diff against the previous one.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::Rng;

use crate::info::{ServerInfo, ServerType};

// ---------------------------------------------------------------------------
// Diff and selection types
// ---------------------------------------------------------------------------

/// One entry of the diff returned by [`ServerInfoCenter::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerChange {
    Added(ServerInfo),
    /// The entry's identity tuple (address, state, weight, service id, type)
    /// changed; carries the new value.
    Updated(ServerInfo),
    Removed(ServerInfo),
}

impl ServerChange {
    pub fn server(&self) -> &ServerInfo {
        match self {
            ServerChange::Added(s) | ServerChange::Updated(s) | ServerChange::Removed(s) => s,
        }
    }
}

/// How to pick one server out of a `(service_id, server_type)` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Rotate through selectable members in server-id order.
    #[default]
    RoundRobin,
    /// Draw proportionally to member weights.
    Weighted,
    /// Lowest reported load; ties broken by server id. Falls back to
    /// round-robin ordering when no load has been reported.
    LeastLoaded,
}

// ---------------------------------------------------------------------------
// Center
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CenterInner {
    servers: HashMap<String, ServerInfo>,
    /// `(service_id, server_type)` → server ids, sorted for stable rotation.
    by_service: HashMap<(u16, ServerType), Vec<String>>,
    by_nid: HashMap<String, String>,
    rr_cursors: HashMap<(u16, ServerType), usize>,
    load: HashMap<String, u64>,
}

/// Authoritative snapshot of the fleet plus its secondary indexes.
#[derive(Default)]
pub struct ServerInfoCenter {
    inner: RwLock<CenterInner>,
}

impl ServerInfoCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with `list` and return the diff.
    ///
    /// Entries are compared by the full identity tuple; any field difference
    /// yields `Updated`. Heartbeat stamps refresh silently.
    pub fn update(&self, list: Vec<ServerInfo>) -> Vec<ServerChange> {
        let mut inner = self.inner.write().expect("center lock");
        let mut changes = Vec::new();

        let mut next: HashMap<String, ServerInfo> = HashMap::with_capacity(list.len());
        for info in list {
            next.insert(info.server_id.clone(), info);
        }

        for (id, old) in &inner.servers {
            match next.get(id) {
                None => changes.push(ServerChange::Removed(old.clone())),
                Some(new) if new.identity_tuple() != old.identity_tuple() => {
                    changes.push(ServerChange::Updated(new.clone()));
                }
                Some(_) => {}
            }
        }
        for (id, new) in &next {
            if !inner.servers.contains_key(id) {
                changes.push(ServerChange::Added(new.clone()));
            }
        }

        inner.by_service.clear();
        inner.by_nid.clear();
        for (id, info) in &next {
            inner
                .by_service
                .entry((info.service_id, info.server_type))
                .or_default()
                .push(id.clone());
            inner.by_nid.insert(info.nid.clone(), id.clone());
        }
        for ids in inner.by_service.values_mut() {
            ids.sort();
        }
        inner.load.retain(|id, _| next.contains_key(id));
        inner.servers = next;

        changes
    }

    pub fn get(&self, server_id: &str) -> Option<ServerInfo> {
        self.inner.read().expect("center lock").servers.get(server_id).cloned()
    }

    pub fn get_by_nid(&self, nid: &str) -> Option<ServerInfo> {
        let inner = self.inner.read().expect("center lock");
        inner.by_nid.get(nid).and_then(|id| inner.servers.get(id)).cloned()
    }

    /// All servers currently in `Running` state.
    pub fn running(&self) -> Vec<ServerInfo> {
        let inner = self.inner.read().expect("center lock");
        inner.servers.values().filter(|s| s.is_running()).cloned().collect()
    }

    /// Feed an external load metric for the `LeastLoaded` policy.
    pub fn report_load(&self, server_id: &str, load: u64) {
        self.inner.write().expect("center lock").load.insert(server_id.to_owned(), load);
    }

    /// Pick one selectable server of the given service group, or `None` when
    /// no member qualifies.
    pub fn select(
        &self,
        service_id: u16,
        server_type: ServerType,
        policy: SelectionPolicy,
    ) -> Option<ServerInfo> {
        let mut inner = self.inner.write().expect("center lock");
        let key = (service_id, server_type);
        let candidates: Vec<ServerInfo> = inner
            .by_service
            .get(&key)?
            .iter()
            .filter_map(|id| inner.servers.get(id))
            .filter(|s| s.is_selectable())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }

        match policy {
            SelectionPolicy::RoundRobin => {
                let cursor = inner.rr_cursors.entry(key).or_insert(0);
                let picked = candidates[*cursor % candidates.len()].clone();
                *cursor = cursor.wrapping_add(1);
                Some(picked)
            }
            SelectionPolicy::Weighted => {
                let total: u32 = candidates.iter().map(|s| u32::from(s.weight)).sum();
                let mut point = rand::thread_rng().gen_range(0..total);
                for s in &candidates {
                    let w = u32::from(s.weight);
                    if point < w {
                        return Some(s.clone());
                    }
                    point -= w;
                }
                // Unreachable: the walk covers [0, total).
                candidates.last().cloned()
            }
            SelectionPolicy::LeastLoaded => candidates
                .into_iter()
                .min_by_key(|s| (inner.load.get(&s.server_id).copied().unwrap_or(0), s.server_id.clone())),
        }
    }
}
