use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use bytes::{Buf, BufMut};

use crate::util::buf::{BufExt, BufMutExt};

/// Identity of a hub or a client in the overlay: the network address it is known by, plus a
///  disambiguating number so that a process restarted on the same address is recognizably a
///  different participant.
///
/// The textual form is `ip:port@unique` (`[ip]:port@unique` for IPv6), and this is also how an
///  address travels on the wire: as a length-prefixed string.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeAddr {
    pub socket_addr: SocketAddr,
    pub unique: u32,
}

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}@{}]", self.socket_addr, self.unique)
    }
}

impl Display for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.socket_addr, self.unique)
    }
}

impl FromStr for NodeAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((addr, unique)) => Ok(NodeAddr {
                socket_addr: addr.parse()
                    .map_err(|e| anyhow!("invalid socket address in {:?}: {}", s, e))?,
                unique: unique.parse()
                    .map_err(|e| anyhow!("invalid unique part in {:?}: {}", s, e))?,
            }),
            None => Ok(NodeAddr {
                socket_addr: s.parse()
                    .map_err(|e| anyhow!("invalid socket address {:?}: {}", s, e))?,
                unique: 0,
            }),
        }
    }
}

impl NodeAddr {
    pub fn new(socket_addr: SocketAddr, unique: u32) -> NodeAddr {
        NodeAddr {
            socket_addr,
            unique,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.to_string());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeAddr> {
        buf.try_get_string()?
            .parse()
    }
}

impl From<SocketAddr> for NodeAddr {
    /// The unique part is initialized with the seconds since epoch, which is good enough to tell
    ///  a restarted process apart from its previous incarnation.
    fn from(addr: SocketAddr) -> Self {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        NodeAddr {
            socket_addr: addr,
            unique,
        }
    }
}
