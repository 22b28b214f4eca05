use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::connection::forwarding::ForwardingConnection;
use crate::connection::LinkKind;
use crate::node_addr::NodeAddr;

/// The physical connections of a hub, at most one per peer hub and one per client.
#[derive(Default)]
pub struct ConnectionTable {
    hubs: FxHashMap<NodeAddr, Arc<ForwardingConnection>>,
    clients: FxHashMap<NodeAddr, Arc<ForwardingConnection>>,
}

impl ConnectionTable {
    fn map(&self, kind: LinkKind) -> &FxHashMap<NodeAddr, Arc<ForwardingConnection>> {
        match kind {
            LinkKind::Hub => &self.hubs,
            LinkKind::Client => &self.clients,
        }
    }

    fn map_mut(&mut self, kind: LinkKind) -> &mut FxHashMap<NodeAddr, Arc<ForwardingConnection>> {
        match kind {
            LinkKind::Hub => &mut self.hubs,
            LinkKind::Client => &mut self.clients,
        }
    }

    pub fn insert(&mut self, conn: Arc<ForwardingConnection>) -> anyhow::Result<()> {
        let map = self.map_mut(conn.kind());
        if map.contains_key(&conn.peer()) {
            bail!("there is already a {:?} connection for {:?}", conn.kind(), conn.peer());
        }
        map.insert(conn.peer(), conn);
        Ok(())
    }

    /// Removes the connection unless it was replaced by a newer connection to the same peer in
    ///  the meantime. Returns `true` if it was removed.
    pub fn remove(&mut self, conn: &ForwardingConnection) -> bool {
        let map = self.map_mut(conn.kind());
        match map.get(&conn.peer()) {
            Some(existing) if existing.id() == conn.id() => {
                map.remove(&conn.peer());
                true
            }
            _ => false,
        }
    }

    pub fn hub(&self, addr: &NodeAddr) -> Option<Arc<ForwardingConnection>> {
        self.hubs.get(addr).cloned()
    }

    pub fn client(&self, addr: &NodeAddr) -> Option<Arc<ForwardingConnection>> {
        self.clients.get(addr).cloned()
    }

    pub fn contains(&self, kind: LinkKind, addr: &NodeAddr) -> bool {
        self.map(kind).contains_key(addr)
    }

    pub fn hub_links(&self) -> Vec<Arc<ForwardingConnection>> {
        self.hubs.values().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use crate::test_util::connection::test_connection_to;
    use crate::test_util::node::test_node_addr_from_number;
    use super::*;

    #[tokio::test]
    async fn test_insert_duplicate() {
        let mut table = ConnectionTable::default();
        let (first, _) = test_connection_to(1, LinkKind::Client, test_node_addr_from_number(5));
        let (second, _) = test_connection_to(2, LinkKind::Client, test_node_addr_from_number(5));
        let (hub, _) = test_connection_to(3, LinkKind::Hub, test_node_addr_from_number(5));

        table.insert(first).unwrap();
        assert!(table.insert(second).is_err());
        table.insert(hub).unwrap();

        assert_eq!(table.client(&test_node_addr_from_number(5)).unwrap().id().0, 1);
        assert_eq!(table.hub(&test_node_addr_from_number(5)).unwrap().id().0, 3);
    }

    #[tokio::test]
    async fn test_remove_only_same_connection() {
        let mut table = ConnectionTable::default();
        let (first, _) = test_connection_to(1, LinkKind::Hub, test_node_addr_from_number(5));
        let (second, _) = test_connection_to(2, LinkKind::Hub, test_node_addr_from_number(5));

        table.insert(first.clone()).unwrap();
        assert!(!table.remove(&second));
        assert!(table.contains(LinkKind::Hub, &test_node_addr_from_number(5)));
        assert!(table.remove(&first));
        assert!(!table.contains(LinkKind::Hub, &test_node_addr_from_number(5)));
        assert!(!table.remove(&first));
    }
}
