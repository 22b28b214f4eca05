use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::connection::forwarding::ForwardingConnection;
use crate::connection::ConnectionId;

/// A circuit id is only meaningful together with the physical connection it was allocated on.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct VcKey {
    pub connection: ConnectionId,
    pub index: u64,
}

impl VcKey {
    pub fn new(connection: ConnectionId, index: u64) -> VcKey {
        VcKey {
            connection,
            index,
        }
    }
}

pub struct VcEndpoint {
    pub connection: Arc<ForwardingConnection>,
    pub index: u64,
    pub buffer_size: u32,
}

impl VcEndpoint {
    pub fn new(connection: Arc<ForwardingConnection>, index: u64, buffer_size: u32) -> VcEndpoint {
        VcEndpoint {
            connection,
            index,
            buffer_size,
        }
    }

    pub fn key(&self) -> VcKey {
        VcKey::new(self.connection.id(), self.index)
    }
}

impl Debug for VcEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{}", self.connection.peer(), self.index)
    }
}

/// One hop of a circuit as seen by a hub: the endpoint toward the requester and the endpoint
///  toward the acceptor, each with the id that is meaningful on its own connection.
#[derive(Debug)]
pub struct VirtualConnection {
    pub requester: VcEndpoint,
    pub acceptor: VcEndpoint,
}

impl VirtualConnection {
    pub fn new(requester: VcEndpoint, acceptor: VcEndpoint) -> VirtualConnection {
        VirtualConnection {
            requester,
            acceptor,
        }
    }

    pub fn keys(&self) -> (VcKey, VcKey) {
        (self.requester.key(), self.acceptor.key())
    }

    /// the endpoint opposite to the one identified by `key`
    pub fn other_side(&self, key: &VcKey) -> Option<&VcEndpoint> {
        if &self.requester.key() == key {
            Some(&self.acceptor)
        }
        else if &self.acceptor.key() == key {
            Some(&self.requester)
        }
        else {
            None
        }
    }

    /// the endpoint not running over `connection`, used when that connection is torn down
    pub fn surviving_side(&self, connection: ConnectionId) -> Option<&VcEndpoint> {
        if self.requester.connection.id() == connection {
            Some(&self.acceptor)
        }
        else if self.acceptor.connection.id() == connection {
            Some(&self.requester)
        }
        else {
            None
        }
    }
}
