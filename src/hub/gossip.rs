use std::collections::BTreeSet;

use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tracing::{debug, trace};

use crate::hub::hub_description::{ClientDescriptor, HubDescription};
use crate::hub::hub_registry::HubRegistry;
use crate::node_addr::NodeAddr;
use crate::util::buf::{BufExt, BufMutExt};

/// What a hub tells a peer about one hub it knows (possibly itself or the peer).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GossipEntry {
    pub addr: NodeAddr,
    pub name: String,
    pub color: String,
    /// as seen from the sender
    pub hops: u32,
    pub state: u64,
    pub clients: Vec<ClientDescriptor>,
    pub connected_to: BTreeSet<NodeAddr>,
}

impl GossipEntry {
    pub fn from_description(descr: &HubDescription, hops: u32) -> GossipEntry {
        GossipEntry {
            addr: descr.addr,
            name: descr.name.clone(),
            color: descr.color.clone(),
            hops,
            state: descr.home_state,
            clients: descr.clients.values().cloned().collect(),
            connected_to: descr.connected_to.clone(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.addr.ser(buf);
        buf.put_string(&self.name);
        buf.put_string(&self.color);
        buf.put_u32(self.hops);
        buf.put_u64(self.state);
        buf.put_usize_varint(self.clients.len());
        for client in &self.clients {
            client.ser(buf);
        }
        buf.put_usize_varint(self.connected_to.len());
        for peer in &self.connected_to {
            peer.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<GossipEntry> {
        let addr = NodeAddr::try_deser(buf)?;
        let name = buf.try_get_string()?;
        let color = buf.try_get_string()?;
        let hops = buf.try_get_u32()?;
        let state = buf.try_get_u64()?;

        let num_clients = buf.try_get_usize_varint()?;
        let mut clients = Vec::with_capacity(num_clients.min(1024));
        for _ in 0..num_clients {
            clients.push(ClientDescriptor::try_deser(buf)?);
        }

        let num_peers = buf.try_get_usize_varint()?;
        let mut connected_to = BTreeSet::new();
        for _ in 0..num_peers {
            connected_to.insert(NodeAddr::try_deser(buf)?);
        }

        Ok(GossipEntry {
            addr,
            name,
            color,
            hops,
            state,
            clients,
            connected_to,
        })
    }
}

/// Merges gossip received from the directly linked peer `from` into the registry.
///
/// An entry about ourselves only tells us whether the peer reaches us directly. The peer's
///  entry about itself is authoritative. Anything else is third-party knowledge: it may offer a
///  shorter path through the peer, and its facts are taken only if they are newer than ours.
pub fn on_gossip(registry: &mut HubRegistry, from: NodeAddr, entries: &[GossipEntry]) {
    let myself = registry.myself();

    for entry in entries {
        if entry.addr == myself {
            registry.set_can_reach_me(from, entry.hops <= 1);
        }
        else if entry.addr == from {
            trace!("self report from {:?} at state {}", from, entry.state);
            registry.accept_self_report(entry);
        }
        else {
            registry.update_route(entry.addr, from, entry.hops);
            if !registry.update(entry) {
                debug!("conflict: stale gossip about {:?} from {:?} (state {}) - ignoring", entry.addr, from, entry.state);
            }
        }
    }

    registry.touch(from);
}
