use std::fmt::{Display, Formatter};

pub mod client_link;
pub mod forwarding;
pub mod handshake;
pub mod hub_link;
pub mod routing;
pub mod virtual_relay;

/// Hub-local identity of a physical connection, used as the namespace of the circuit ids
///  allocated on it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkKind {
    Hub,
    Client,
}
