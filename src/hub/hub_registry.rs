use std::collections::btree_map;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::hub::gossip::GossipEntry;
use crate::hub::hub_description::{ClientDescriptor, HubDescription, UNREACHABLE};
use crate::hub::state_counter::StateCounter;
use crate::node_addr::NodeAddr;

/// A hub's local view of the overlay's topology: one [HubDescription] per hub it ever heard
///  of, including itself.
///
/// Every change that should be passed on to peers stamps the changed record's
///  `last_local_update` with a fresh value of the local [StateCounter]; gossip to a peer then
///  only needs to send records stamped after what it already sent. Callers serialize access
///  through a lock, and all counter increments happen while holding it.
pub struct HubRegistry {
    myself: NodeAddr,
    state_counter: Arc<StateCounter>,
    hubs: FxHashMap<NodeAddr, HubDescription>,
}

impl HubRegistry {
    pub fn new(myself: NodeAddr, name: &str, color: &str, state_counter: Arc<StateCounter>) -> HubRegistry {
        let mut local = HubDescription::new_local(myself, name, color);
        let state = state_counter.increment();
        local.home_state = state;
        local.last_local_update = state;

        let mut hubs = FxHashMap::default();
        hubs.insert(myself, local);

        HubRegistry {
            myself,
            state_counter,
            hubs,
        }
    }

    pub fn myself(&self) -> NodeAddr {
        self.myself
    }

    pub fn local(&self) -> &HubDescription {
        &self.hubs[&self.myself]
    }

    pub fn get(&self, addr: &NodeAddr) -> Option<&HubDescription> {
        self.hubs.get(addr)
    }

    /// returns the existing description, or a fresh one that knows nothing but the address
    pub fn add(&mut self, addr: NodeAddr) -> &mut HubDescription {
        self.hubs.entry(addr)
            .or_insert_with(|| {
                debug!("new hub {:?}", addr);
                HubDescription::new(addr)
            })
    }

    /// Returns a snapshot of whatever `f` maps from the matching descriptions, so callers can
    ///  work with the result after releasing the lock.
    pub fn select<T>(&self, f: impl Fn(&HubDescription) -> Option<T>) -> Vec<T> {
        self.hubs.values()
            .filter_map(f)
            .collect()
    }

    fn stamp(&self) -> u64 {
        self.state_counter.increment()
    }

    /// Accepts a third party's report about `entry.addr` if it is newer than what we know.
    ///  Returns `false` for stale reports.
    pub fn update(&mut self, entry: &GossipEntry) -> bool {
        if entry.addr == self.myself {
            return false;
        }

        let stamp = self.stamp();
        let hub = self.add(entry.addr);
        if entry.state <= hub.home_state {
            return false;
        }

        Self::apply_facts(hub, entry);
        hub.last_local_update = stamp;
        true
    }

    /// A peer talking about itself is authoritative: it is the only writer of its own state, and
    ///  it is directly connected to us.
    pub fn accept_self_report(&mut self, entry: &GossipEntry) {
        if entry.addr == self.myself {
            return;
        }

        let stamp = self.stamp();
        let hub = self.add(entry.addr);
        Self::apply_facts(hub, entry);
        hub.hops = 1;
        hub.indirection = None;
        hub.last_local_update = stamp;
    }

    fn apply_facts(hub: &mut HubDescription, entry: &GossipEntry) {
        hub.name = entry.name.clone();
        hub.color = entry.color.clone();
        hub.home_state = entry.state;
        hub.clients = entry.clients.iter()
            .map(|c| (c.addr, c.clone()))
            .collect();
        hub.connected_to = entry.connected_to.clone();
    }

    /// Takes note that `via` (a directly linked peer) reaches `hub` in `reported_hops` hops.
    ///
    /// A strictly shorter path replaces the current one; a path of equal length does not, so
    ///  routes do not oscillate between equivalent peers. If `via` already is the indirection,
    ///  its report is accepted whatever it says since it describes the path we actually use.
    pub fn update_route(&mut self, hub: NodeAddr, via: NodeAddr, reported_hops: u32) -> bool {
        if hub == self.myself || hub == via {
            return false;
        }

        let new_hops = if reported_hops == UNREACHABLE { UNREACHABLE } else { reported_hops.saturating_add(1) };
        let stamp = self.stamp();
        let descr = self.add(hub);

        let changed = if new_hops < descr.hops {
            descr.hops = new_hops;
            descr.indirection = Some(via);
            true
        }
        else if descr.indirection == Some(via) && new_hops != descr.hops {
            descr.hops = new_hops;
            if new_hops == UNREACHABLE {
                descr.indirection = None;
            }
            true
        }
        else {
            false
        };

        if changed {
            trace!("route to {:?} is now {} hops via {:?}", hub, descr.hops, descr.indirection);
            descr.last_local_update = stamp;
        }
        changed
    }

    pub fn touch(&mut self, addr: NodeAddr) {
        self.add(addr).last_contact = Some(Instant::now());
    }

    pub fn set_can_reach_me(&mut self, addr: NodeAddr, can_reach_me: bool) {
        self.add(addr).can_reach_me = can_reach_me;
    }

    fn modify_local<T>(&mut self, f: impl FnOnce(&mut HubDescription, u64) -> Option<T>) -> Option<T> {
        let stamp = self.stamp();
        let myself = self.myself;
        let local = self.add(myself);
        let result = f(local, stamp)?;
        local.home_state = stamp;
        local.last_local_update = stamp;
        Some(result)
    }

    /// returns `false` if the client is already registered
    pub fn add_local_client(&mut self, client: NodeAddr) -> bool {
        self.modify_local(|local, stamp| match local.clients.entry(client) {
            btree_map::Entry::Occupied(_) => None,
            btree_map::Entry::Vacant(e) => {
                e.insert(ClientDescriptor::new(client, stamp));
                Some(())
            }
        }).is_some()
    }

    pub fn remove_local_client(&mut self, client: &NodeAddr) -> bool {
        self.modify_local(|local, _| local.clients.remove(client))
            .is_some()
    }

    pub fn is_local_client(&self, client: &NodeAddr) -> bool {
        self.local().has_client(client)
    }

    /// rejected if the client already has a property with this tag
    pub fn register_property(&mut self, client: &NodeAddr, tag: &str, value: &str) -> bool {
        self.modify_local(|local, stamp| {
            let descr = local.clients.get_mut(client)?;
            if descr.properties.contains_key(tag) {
                return None;
            }
            descr.properties.insert(tag.to_string(), value.to_string());
            descr.version = stamp;
            Some(())
        }).is_some()
    }

    /// rejected if the client has no property with this tag
    pub fn update_property(&mut self, client: &NodeAddr, tag: &str, value: &str) -> bool {
        self.modify_local(|local, stamp| {
            let descr = local.clients.get_mut(client)?;
            let prop = descr.properties.get_mut(tag)?;
            *prop = value.to_string();
            descr.version = stamp;
            Some(())
        }).is_some()
    }

    /// rejected if the client has no property with this tag
    pub fn remove_property(&mut self, client: &NodeAddr, tag: &str) -> bool {
        self.modify_local(|local, stamp| {
            let descr = local.clients.get_mut(client)?;
            descr.properties.remove(tag)?;
            descr.version = stamp;
            Some(())
        }).is_some()
    }

    pub fn add_direct_peer(&mut self, peer: NodeAddr, name: &str, color: &str) {
        self.modify_local(|local, _| {
            local.connected_to.insert(peer);
            Some(())
        });

        let stamp = self.stamp();
        let descr = self.add(peer);
        descr.hops = 1;
        descr.indirection = None;
        if !name.is_empty() {
            descr.name = name.to_string();
        }
        if !color.is_empty() {
            descr.color = color.to_string();
        }
        descr.last_contact = Some(Instant::now());
        descr.last_local_update = stamp;
    }

    /// The peer and every hub we reached through it become unreachable until gossip from other
    ///  peers supplies a new path.
    pub fn remove_direct_peer(&mut self, peer: &NodeAddr) {
        self.modify_local(|local, _| local.connected_to.remove(peer).then_some(()));

        let stamp = self.stamp();
        for descr in self.hubs.values_mut() {
            if &descr.addr == peer || descr.indirection.as_ref() == Some(peer) {
                debug!("{:?} is unreachable after losing the link to {:?}", descr.addr, peer);
                descr.hops = UNREACHABLE;
                descr.indirection = None;
                descr.last_local_update = stamp;
            }
            if &descr.addr == peer {
                descr.can_reach_me = false;
            }
        }
    }

    /// Returns the entries that changed after `since` together with the watermark to pass as
    ///  `since` next time.
    ///
    /// Hops toward hubs that we reach through `for_peer` are reported as unreachable to that
    ///  peer: it must not route through us to reach them.
    pub fn gossip_snapshot(&self, since: u64, for_peer: NodeAddr) -> (Vec<GossipEntry>, u64) {
        let watermark = self.state_counter.get();

        let entries = self.hubs.values()
            .filter(|h| h.last_local_update > since)
            .map(|h| {
                let hops = if h.indirection == Some(for_peer) { UNREACHABLE } else { h.hops };
                GossipEntry::from_description(h, hops)
            })
            .collect();
        (entries, watermark)
    }

    /// reachable remote hubs hosting the client, nearest first
    pub fn hubs_for_client(&self, client: &NodeAddr) -> Vec<NodeAddr> {
        let mut result = self.select(|h| (!h.is_local && h.is_reachable() && h.has_client(client)).then_some((h.hops, h.addr)));
        result.sort();
        result.into_iter()
            .map(|(_, addr)| addr)
            .collect()
    }

    /// hubs able to reach the client, best first: the local hub if it hosts the client, then
    ///  hosting hubs by distance
    pub fn direction_to_client(&self, client: &NodeAddr) -> Vec<NodeAddr> {
        let mut result = Vec::new();
        if self.is_local_client(client) {
            result.push(self.myself);
        }
        result.extend(self.hubs_for_client(client));
        result
    }

    /// The directly linked hub to send traffic for `hub` to, if any.
    pub fn next_hop(&self, hub: &NodeAddr) -> Option<NodeAddr> {
        let descr = self.hubs.get(hub)?;
        if descr.is_local || !descr.is_reachable() {
            return None;
        }
        match descr.indirection {
            Some(via) => Some(via),
            None => Some(descr.addr),
        }
    }

    /// reachable hubs we are not directly linked to
    pub fn discovered_hubs(&self) -> Vec<NodeAddr> {
        let local = self.local();
        self.select(|h| (!h.is_local && h.is_reachable() && !local.connected_to.contains(&h.addr)).then_some(h.addr))
    }

}
