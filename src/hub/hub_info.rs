use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};

use crate::node_addr::NodeAddr;

const SSH_SUFFIX: &str = " (SSH)";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerInfo {
    pub addr: NodeAddr,
    pub ssh: bool,
}

impl From<NodeAddr> for PeerInfo {
    fn from(addr: NodeAddr) -> Self {
        PeerInfo {
            addr,
            ssh: false,
        }
    }
}

/// Human readable description of a hub as returned by `HUB_DETAILS` requests. The textual form
///  `HubInfo(address,name,color,state,clientCount,peerCount[,peer]*)` is parsed by clients, so
///  rendering replaces characters that would break the structure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HubInfo {
    pub addr: NodeAddr,
    pub name: String,
    pub color: String,
    pub state: u64,
    pub client_count: usize,
    pub peers: Vec<PeerInfo>,
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ',' | '(' | ')' => ' ',
            c => c,
        })
        .collect()
}

impl Display for HubInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HubInfo({},{},{},{},{},{}",
               self.addr,
               sanitize(&self.name),
               sanitize(&self.color),
               self.state,
               self.client_count,
               self.peers.len(),
        )?;
        for peer in &self.peers {
            write!(f, ",{}{}", peer.addr, if peer.ssh { SSH_SUFFIX } else { "" })?;
        }
        write!(f, ")")
    }
}

impl FromStr for HubInfo {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s.strip_prefix("HubInfo(")
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| anyhow!("not a HubInfo string: {:?}", s))?;

        let parts = inner.split(',').collect::<Vec<_>>();
        if parts.len() < 6 {
            bail!("HubInfo with too few fields: {:?}", s);
        }

        let num_peers: usize = parts[5].parse()?;
        if parts.len() - 6 != num_peers {
            bail!("HubInfo announces {} peers but has {}: {:?}", num_peers, parts.len() - 6, s);
        }

        let mut peers = Vec::with_capacity(num_peers);
        for &raw in &parts[6..] {
            let peer = match raw.strip_suffix(SSH_SUFFIX) {
                Some(addr) => PeerInfo { addr: addr.parse()?, ssh: true },
                None => PeerInfo { addr: raw.parse()?, ssh: false },
            };
            peers.push(peer);
        }

        Ok(HubInfo {
            addr: parts[0].parse()?,
            name: parts[1].to_string(),
            color: parts[2].to_string(),
            state: parts[3].parse()?,
            client_count: parts[4].parse()?,
            peers,
        })
    }
}
