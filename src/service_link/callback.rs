use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::node_addr::NodeAddr;
use crate::protocol::client_message::ClientMessage;
use crate::protocol::opcodes::NackReason;

/// Receives the virtual connection events of a [crate::service_link::service_link::ServiceLink].
///  At most one callback is registered at a time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VirtualConnectionCallback: Send + Sync {
    /// A remote client asks for a virtual connection. The implementation answers with
    ///  `ack_virtual_connection` or `nack_virtual_connection`; `credits` is the number of data
    ///  frames we may send once the connection is established.
    async fn on_connect(&self, index: u64, source: NodeAddr, info: String, timeout: Duration, credits: u32);

    /// our request was accepted
    async fn on_connect_ack(&self, index: u64, credits: u32);
    async fn on_connect_nack(&self, index: u64, reason: NackReason);
    /// the requester confirmed (or abandoned) a connection we accepted
    async fn on_connect_ack_ack(&self, index: u64, success: bool);

    async fn on_disconnect(&self, index: u64);
    async fn on_message(&self, index: u64, data: Bytes);
    async fn on_message_ack(&self, index: u64, credits: u32);
}

/// Handles envelopes addressed to one module name.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientMessageHandler: Send + Sync {
    async fn on_message(&self, msg: ClientMessage);
}
