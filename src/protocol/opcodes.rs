use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Single-byte frame tags, grouped by plane.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // connection / session
    ServiceLinkConnect = 1,
    HubConnect = 2,
    ConnectionAccepted = 3,
    ConnectionDenied = 4,
    Disconnect = 5,

    // gossip (hub <-> hub)
    Gossip = 10,
    Ping = 11,

    // virtual circuits
    CreateVirtual = 20,
    CreateVirtualAck = 21,
    CreateVirtualNack = 22,
    CreateVirtualAckAck = 23,
    CloseVirtual = 24,
    MessageVirtual = 25,
    MessageVirtualAck = 26,

    // control plane (client <-> hub)
    Message = 30,
    RegisterProperty = 31,
    UpdateProperty = 32,
    RemoveProperty = 33,
    PropertyAck = 34,
    Hubs = 35,
    HubDetails = 36,
    ClientsForHub = 37,
    AllClients = 38,
    Direction = 39,
    InfoReply = 40,
}

/// Reason for refusing a virtual connection, sent back to the requester in a
///  `CREATE_VIRTUAL_NACK`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive, thiserror::Error)]
#[repr(u8)]
pub enum NackReason {
    #[error("no virtual connection callback registered at the destination")]
    NoCallback = 1,
    #[error("no service found for the requested port")]
    PortNotFound = 2,
    #[error("connection refused")]
    ConnectionRefused = 3,
    #[error("unknown host")]
    UnknownHost = 4,
    #[error("illegal target")]
    IllegalTarget = 5,
    #[error("server overload")]
    ServerOverload = 6,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PropertyAckStatus {
    Rejected = 0,
    Accepted = 1,
}

impl PropertyAckStatus {
    pub fn from_accepted(accepted: bool) -> PropertyAckStatus {
        if accepted { PropertyAckStatus::Accepted } else { PropertyAckStatus::Rejected }
    }
}
