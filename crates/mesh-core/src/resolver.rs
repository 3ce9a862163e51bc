//! Address resolver: the discovery-driven control loop.
//!
//! Every `refresh_interval` the resolver pulls the fleet, feeds it into the
//! center, and drives the communicator off the diff:
//!
//! | change                      | action                 |
//! |-----------------------------|------------------------|
//! | added, running              | connect                |
//! | added, disabled/paused      | none                   |
//! | updated, now disabled       | disconnect             |
//! | updated, address changed    | disconnect + connect   |
//! | removed                     | disconnect             |
//!
//! The node's own entry is skipped. A failed cycle logs and the loop
//! continues. Listeners fire after every non-empty diff.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::center::{ServerChange, ServerInfoCenter};
use crate::communicator::MeshCommunicator;
use crate::info::{ServerInfo, ServerState};
use crate::provider::FleetProvider;

/// Fleet-change notification, fired once per non-empty diff. The play
/// dispatcher uses this to clean up stages whose owning nodes vanished.
pub trait ServerListListener: Send + Sync {
    fn on_server_list_changed(&self, changes: &[ServerChange]);
}

pub struct AddressResolver {
    me: ServerInfo,
    provider: Arc<dyn FleetProvider>,
    center: Arc<ServerInfoCenter>,
    communicator: Arc<MeshCommunicator>,
    listener: Option<Arc<dyn ServerListListener>>,
}

impl AddressResolver {
    pub fn new(
        me: ServerInfo,
        provider: Arc<dyn FleetProvider>,
        center: Arc<ServerInfoCenter>,
        communicator: Arc<MeshCommunicator>,
        listener: Option<Arc<dyn ServerListListener>>,
    ) -> Self {
        AddressResolver { me, provider, center, communicator, listener }
    }

    /// Start the periodic loop. The task runs for the life of the node.
    pub fn spawn(self, refresh_interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(refresh_interval);
            loop {
                tick.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "fleet refresh failed");
                }
            }
        })
    }

    /// One discovery cycle. Public so tests (and tools) can step the loop.
    pub async fn run_once(&self) -> Result<(), crate::provider::FleetError> {
        let fleet = self.provider.fetch(&self.me).await?;
        let changes = self.center.update(fleet);

        for change in &changes {
            if change.server().server_id == self.me.server_id {
                continue;
            }
            self.apply(change).await;
        }

        // Links that failed to establish (or dropped) get retried while the
        // member stays running in the snapshot.
        for info in self.center.running() {
            if info.server_id != self.me.server_id
                && !self.communicator.is_connected(&info.server_id)
            {
                self.try_connect(&info).await;
            }
        }

        if !changes.is_empty() {
            debug!(changes = changes.len(), "fleet changed");
            if let Some(listener) = &self.listener {
                listener.on_server_list_changed(&changes);
            }
        }
        Ok(())
    }

    async fn apply(&self, change: &ServerChange) {
        match change {
            ServerChange::Added(info) => {
                if info.is_running() {
                    self.try_connect(info).await;
                }
            }
            ServerChange::Updated(info) => match info.state {
                ServerState::Disabled => self.communicator.disconnect(&info.server_id),
                ServerState::Running | ServerState::Paused => {
                    // An address move shows up as Updated; reconnect to the
                    // new address (connect handles the drop of the old link).
                    if info.state == ServerState::Running {
                        self.try_connect(info).await;
                    }
                }
            },
            ServerChange::Removed(info) => self.communicator.disconnect(&info.server_id),
        }
    }

    async fn try_connect(&self, info: &ServerInfo) {
        if let Err(e) = self.communicator.connect(&info.server_id, &info.address).await {
            warn!(server_id = %info.server_id, address = %info.address, error = %e, "mesh connect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::ServerType;
    use crate::provider::StaticFleet;
    use crate::request_cache::RequestCache;
    use std::sync::Mutex;

    fn server(id: &str, address: &str, state: ServerState) -> ServerInfo {
        ServerInfo {
            server_id: id.to_owned(),
            nid: format!("n-{id}"),
            service_id: 1,
            server_type: ServerType::Play,
            address: address.to_owned(),
            state,
            weight: 1,
            last_heartbeat: 0,
        }
    }

    struct ChangeLog(Mutex<Vec<usize>>);

    impl ServerListListener for ChangeLog {
        fn on_server_list_changed(&self, changes: &[ServerChange]) {
            self.0.lock().expect("lock").push(changes.len());
        }
    }

    async fn listening_addr() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn added_running_servers_get_connected_and_own_entry_is_skipped() {
        let (listener, addr) = listening_addr().await;
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                std::mem::forget(stream);
            }
        });

        let me = server("play-1", "127.0.0.1:9", ServerState::Running);
        let fleet = Arc::new(StaticFleet::new(vec![
            me.clone(),
            server("play-2", &addr, ServerState::Running),
            server("play-3", &addr, ServerState::Disabled),
        ]));
        let center = Arc::new(ServerInfoCenter::new());
        let comm = MeshCommunicator::new(RequestCache::new(), 1024);
        let listener_log = Arc::new(ChangeLog(Mutex::new(Vec::new())));
        let resolver = AddressResolver::new(
            me,
            fleet,
            Arc::clone(&center),
            Arc::clone(&comm),
            Some(Arc::clone(&listener_log) as Arc<dyn ServerListListener>),
        );

        resolver.run_once().await.expect("cycle");
        assert!(comm.is_connected("play-2"));
        assert!(!comm.is_connected("play-3"), "disabled member stays unlinked");
        assert!(!comm.is_connected("play-1"), "own entry skipped");
        assert_eq!(*listener_log.0.lock().expect("lock"), vec![3]);
    }

    #[tokio::test]
    async fn removed_and_disabled_servers_get_disconnected() {
        let (listener, addr) = listening_addr().await;
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                std::mem::forget(stream);
            }
        });

        let me = server("play-1", "127.0.0.1:9", ServerState::Running);
        let fleet = Arc::new(StaticFleet::new(vec![
            server("play-2", &addr, ServerState::Running),
            server("play-7", &addr, ServerState::Running),
        ]));
        let center = Arc::new(ServerInfoCenter::new());
        let comm = MeshCommunicator::new(RequestCache::new(), 1024);
        let resolver =
            AddressResolver::new(me, Arc::clone(&fleet) as Arc<dyn FleetProvider>, center, Arc::clone(&comm), None);

        resolver.run_once().await.expect("cycle");
        assert!(comm.is_connected("play-2"));
        assert!(comm.is_connected("play-7"));

        // play-7 vanishes; play-2 flips to disabled.
        fleet.set(vec![server("play-2", &addr, ServerState::Disabled)]);
        resolver.run_once().await.expect("cycle");
        assert!(!comm.is_connected("play-2"));
        assert!(!comm.is_connected("play-7"));
    }

    #[tokio::test]
    async fn failed_cycle_does_not_poison_the_next_one() {
        struct Flaky(Mutex<bool>);

        #[async_trait::async_trait]
        impl FleetProvider for Flaky {
            async fn fetch(&self, _me: &ServerInfo) -> Result<Vec<ServerInfo>, crate::provider::FleetError> {
                let mut failed = self.0.lock().expect("lock");
                if !*failed {
                    *failed = true;
                    return Err(crate::provider::FleetError::Io("transient".to_owned()));
                }
                Ok(Vec::new())
            }
        }

        let me = server("play-1", "127.0.0.1:9", ServerState::Running);
        let resolver = AddressResolver::new(
            me,
            Arc::new(Flaky(Mutex::new(false))),
            Arc::new(ServerInfoCenter::new()),
            MeshCommunicator::new(RequestCache::new(), 1024),
            None,
        );
        assert!(resolver.run_once().await.is_err());
        assert!(resolver.run_once().await.is_ok());
    }
}
