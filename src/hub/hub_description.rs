use std::collections::{BTreeMap, BTreeSet};

use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tokio::time::Instant;

use crate::hub::hub_info::HubInfo;
use crate::node_addr::NodeAddr;
use crate::util::buf::{BufExt, BufMutExt};

/// hop count of a hub we currently know no path to
pub const UNREACHABLE: u32 = u32::MAX;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientDescriptor {
    pub addr: NodeAddr,
    pub version: u64,
    pub properties: BTreeMap<String, String>,
}

impl ClientDescriptor {
    pub fn new(addr: NodeAddr, version: u64) -> ClientDescriptor {
        ClientDescriptor {
            addr,
            version,
            properties: Default::default(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        tag.is_empty() || self.properties.contains_key(tag)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.addr.ser(buf);
        buf.put_u64_varint(self.version);
        buf.put_usize_varint(self.properties.len());
        for (k, v) in &self.properties {
            buf.put_string(k);
            buf.put_string(v);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ClientDescriptor> {
        let addr = NodeAddr::try_deser(buf)?;
        let version = buf.try_get_u64_varint()?;
        let num_properties = buf.try_get_usize_varint()?;
        let mut properties = BTreeMap::new();
        for _ in 0..num_properties {
            let key = buf.try_get_string()?;
            let value = buf.try_get_string()?;
            properties.insert(key, value);
        }
        Ok(ClientDescriptor {
            addr,
            version,
            properties,
        })
    }
}

/// A hub's record of some hub in the overlay (possibly itself).
///
/// `home_state` is the highest state counter value the described hub has published about
///  itself, while `last_local_update` is the *local* counter value at which this record last
///  changed - the latter drives delta gossip.
#[derive(Debug, Clone)]
pub struct HubDescription {
    pub addr: NodeAddr,
    pub name: String,
    pub color: String,

    pub hops: u32,
    pub indirection: Option<NodeAddr>,

    pub home_state: u64,
    pub last_local_update: u64,

    pub clients: BTreeMap<NodeAddr, ClientDescriptor>,
    pub connected_to: BTreeSet<NodeAddr>,

    pub last_contact: Option<Instant>,
    pub can_reach_me: bool,
    pub is_local: bool,
}

impl HubDescription {
    pub fn new(addr: NodeAddr) -> HubDescription {
        HubDescription {
            addr,
            name: String::new(),
            color: String::new(),
            hops: UNREACHABLE,
            indirection: None,
            home_state: 0,
            last_local_update: 0,
            clients: Default::default(),
            connected_to: Default::default(),
            last_contact: None,
            can_reach_me: false,
            is_local: false,
        }
    }

    pub fn new_local(addr: NodeAddr, name: &str, color: &str) -> HubDescription {
        HubDescription {
            name: name.to_string(),
            color: color.to_string(),
            hops: 0,
            can_reach_me: true,
            is_local: true,
            ..HubDescription::new(addr)
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.hops != UNREACHABLE
    }

    pub fn has_client(&self, client: &NodeAddr) -> bool {
        self.clients.contains_key(client)
    }

    pub fn hub_info(&self) -> HubInfo {
        HubInfo {
            addr: self.addr,
            name: self.name.clone(),
            color: self.color.clone(),
            state: self.home_state,
            client_count: self.clients.len(),
            peers: self.connected_to.iter()
                .map(|&addr| addr.into())
                .collect(),
        }
    }
}
