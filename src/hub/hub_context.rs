use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::forwarding::ForwardingConnection;
use crate::connection::ConnectionId;
use crate::hub::connection_table::ConnectionTable;
use crate::hub::hub_config::HubConfig;
use crate::hub::hub_registry::HubRegistry;
use crate::hub::state_counter::StateCounter;
use crate::node_addr::NodeAddr;
use crate::virtual_conn::virtual_connection_registry::VirtualConnectionRegistry;

/// State shared by all connections of one hub. Each table has its own lock, and no code path
///  holds two of them at the same time.
pub struct HubContext {
    pub config: HubConfig,
    pub myself: NodeAddr,
    pub state_counter: Arc<StateCounter>,
    pub registry: RwLock<HubRegistry>,
    pub connections: RwLock<ConnectionTable>,
    pub virtual_connections: VirtualConnectionRegistry,
    next_connection_id: AtomicU64,
}

impl HubContext {
    pub fn new(config: HubConfig, myself: NodeAddr) -> Arc<HubContext> {
        let state_counter = Arc::new(StateCounter::new());
        let registry = HubRegistry::new(myself, &config.name, &config.color, state_counter.clone());
        let virtual_connections = VirtualConnectionRegistry::new(config.max_virtual_connections);

        Arc::new(HubContext {
            config,
            myself,
            state_counter,
            registry: RwLock::new(registry),
            connections: Default::default(),
            virtual_connections,
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The hub link to send traffic for `hub` through: the direct link if there is one, else
    ///  the link to its indirection.
    pub async fn route_to_hub(&self, hub: &NodeAddr) -> Option<Arc<ForwardingConnection>> {
        if let Some(conn) = self.connections.read().await.hub(hub) {
            return Some(conn);
        }

        let next_hop = self.registry.read().await.next_hop(hub)?;
        self.connections.read().await.hub(&next_hop)
    }

    pub async fn client_link(&self, client: &NodeAddr) -> Option<Arc<ForwardingConnection>> {
        self.connections.read().await.client(client)
    }
}
