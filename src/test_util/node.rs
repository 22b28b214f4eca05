use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::node_addr::NodeAddr;

/// convenience method for test code: create a [NodeAddr] based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_node_addr_from_number(number: u16) -> NodeAddr {
    NodeAddr {
        unique: number.into(),
        socket_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number)),
    }
}
