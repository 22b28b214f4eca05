use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::connection::forwarding::ForwardingConnection;
use crate::connection::LinkKind;
use crate::hub::hub_context::HubContext;
use crate::protocol::frame::{CreateVirtualData, Frame};
use crate::protocol::opcodes::NackReason;
use crate::virtual_conn::virtual_connection::{VcEndpoint, VirtualConnection};
use crate::virtual_conn::virtual_connection_registry::RegisterError;

// Relaying of circuit frames. Every handler receives the circuit id that is meaningful on the
//  connection the frame arrived on, looks the circuit up under that key and passes the frame
//  on with the id of the other side. Errors are only returned for failed writes back to the
//  arrival connection since those mean that connection is dead.

async fn nack(from: &ForwardingConnection, index: u64, reason: NackReason) -> anyhow::Result<()> {
    debug!("refusing virtual connection {} from {:?}: {}", index, from.peer(), reason);
    from.send(&Frame::CreateVirtualNack { index, reason }).await
}

/// The connection to relay a setup request to: the target client if it is attached here, else
///  the link toward the declared target hub, else the link toward any hub claiming to host the
///  target. The arrival connection is never chosen.
async fn resolve_next_hop(ctx: &HubContext, from: &ForwardingConnection, data: &CreateVirtualData) -> Option<Arc<ForwardingConnection>> {
    if let Some(conn) = ctx.client_link(&data.target).await {
        return Some(conn);
    }

    if let Some(hub) = data.target_hub {
        if hub != ctx.myself {
            if let Some(conn) = ctx.route_to_hub(&hub).await {
                if conn.id() != from.id() {
                    return Some(conn);
                }
            }
        }
    }

    let candidates = ctx.registry.read().await
        .hubs_for_client(&data.target);
    for hub in candidates {
        if let Some(conn) = ctx.route_to_hub(&hub).await {
            if conn.id() != from.id() {
                return Some(conn);
            }
        }
    }
    None
}

pub async fn on_create_virtual(ctx: &HubContext, from: &Arc<ForwardingConnection>, data: CreateVirtualData) -> anyhow::Result<()> {
    trace!("CREATE_VIRTUAL {} from {:?} for {:?}", data.index, data.source, data.target);

    let hops_left = match from.kind() {
        LinkKind::Client => ctx.config.max_hops,
        LinkKind::Hub => match data.hops_left.checked_sub(1) {
            Some(hops) => hops,
            None => return nack(from, data.index, NackReason::UnknownHost).await,
        },
    };

    if data.source == data.target {
        return nack(from, data.index, NackReason::IllegalTarget).await;
    }

    let next = match resolve_next_hop(ctx, from, &data).await {
        Some(conn) => conn,
        None => return nack(from, data.index, NackReason::UnknownHost).await,
    };
    if next.kind() == LinkKind::Hub && hops_left == 0 {
        return nack(from, data.index, NackReason::UnknownHost).await;
    }

    let out_index = next.allocate_index();
    let vc = VirtualConnection::new(
        VcEndpoint::new(from.clone(), data.index, data.buffer_size),
        VcEndpoint::new(next.clone(), out_index, data.buffer_size),
    );

    // registered before relaying: the first data frame may follow the ACK immediately
    match ctx.virtual_connections.register(vc).await {
        Ok(_) => {}
        Err(RegisterError::Full(_)) => return nack(from, data.index, NackReason::ServerOverload).await,
        Err(e) => {
            debug!("{}", e);
            return nack(from, data.index, NackReason::ConnectionRefused).await;
        }
    }

    let source_hub = if from.kind() == LinkKind::Client { ctx.myself } else { data.source_hub };
    let relayed = CreateVirtualData {
        index: out_index,
        source_hub,
        hops_left,
        ..data.clone()
    };

    if next.send(&Frame::CreateVirtual(relayed)).await.is_err() {
        ctx.virtual_connections.remove(&from.key(data.index)).await;
        return nack(from, data.index, NackReason::ConnectionRefused).await;
    }
    Ok(())
}

pub async fn on_create_virtual_ack(ctx: &HubContext, from: &ForwardingConnection, index: u64, credits: u32) -> anyhow::Result<()> {
    let key = from.key(index);
    let vc = match ctx.virtual_connections.find(&key).await {
        Some(vc) => vc,
        None => {
            debug!("ACK for unknown virtual connection {} from {:?}", index, from.peer());
            return from.send(&Frame::CloseVirtual { index }).await;
        }
    };

    if let Some(other) = vc.other_side(&key) {
        if other.connection.send(&Frame::CreateVirtualAck { index: other.index, credits }).await.is_err() {
            ctx.virtual_connections.remove(&key).await;
            return from.send(&Frame::CloseVirtual { index }).await;
        }
    }
    Ok(())
}

/// A refused setup leaves no trace on the path back to the requester.
pub async fn on_create_virtual_nack(ctx: &HubContext, from: &ForwardingConnection, index: u64, reason: NackReason) {
    let key = from.key(index);
    let vc = match ctx.virtual_connections.remove(&key).await {
        Some(vc) => vc,
        None => {
            debug!("NACK for unknown virtual connection {} from {:?} - ignoring", index, from.peer());
            return;
        }
    };

    if let Some(other) = vc.other_side(&key) {
        let _ = other.connection.send(&Frame::CreateVirtualNack { index: other.index, reason }).await;
    }
}

pub async fn on_create_virtual_ack_ack(ctx: &HubContext, from: &ForwardingConnection, index: u64, success: bool) -> anyhow::Result<()> {
    let key = from.key(index);
    let vc = match ctx.virtual_connections.find(&key).await {
        Some(vc) => vc,
        None => {
            debug!("ACK_ACK for unknown virtual connection {} from {:?}", index, from.peer());
            if success {
                return from.send(&Frame::CloseVirtual { index }).await;
            }
            return Ok(());
        }
    };

    if !success {
        ctx.virtual_connections.remove(&key).await;
    }

    if let Some(other) = vc.other_side(&key) {
        let relayed = other.connection.send(&Frame::CreateVirtualAckAck { index: other.index, success }).await;
        if relayed.is_err() && success {
            ctx.virtual_connections.remove(&key).await;
            return from.send(&Frame::CloseVirtual { index }).await;
        }
    }
    Ok(())
}

/// Relays the close exactly once: whichever close removes the entry passes it on, a close
///  racing with it finds nothing and is swallowed.
pub async fn on_close_virtual(ctx: &HubContext, from: &ForwardingConnection, index: u64) {
    let key = from.key(index);
    match ctx.virtual_connections.remove(&key).await {
        Some(vc) => {
            if let Some(other) = vc.other_side(&key) {
                let _ = other.connection.send(&Frame::CloseVirtual { index: other.index }).await;
            }
        }
        None => debug!("CLOSE for unknown virtual connection {} from {:?} - ignoring", index, from.peer()),
    }
}

pub async fn on_message_virtual(ctx: &HubContext, from: &ForwardingConnection, index: u64, data: Bytes) -> anyhow::Result<()> {
    let key = from.key(index);
    let vc = match ctx.virtual_connections.find(&key).await {
        Some(vc) => vc,
        None => {
            debug!("data for unknown virtual connection {} from {:?}", index, from.peer());
            return from.send(&Frame::CloseVirtual { index }).await;
        }
    };

    if let Some(other) = vc.other_side(&key) {
        if other.connection.send(&Frame::MessageVirtual { index: other.index, data }).await.is_err() {
            ctx.virtual_connections.remove(&key).await;
            return from.send(&Frame::CloseVirtual { index }).await;
        }
    }
    Ok(())
}

pub async fn on_message_virtual_ack(ctx: &HubContext, from: &ForwardingConnection, index: u64, credits: u32) {
    let key = from.key(index);
    match ctx.virtual_connections.find(&key).await {
        Some(vc) => {
            if let Some(other) = vc.other_side(&key) {
                let _ = other.connection.send(&Frame::MessageVirtualAck { index: other.index, credits }).await;
            }
        }
        None => debug!("data ACK for unknown virtual connection {} from {:?} - ignoring", index, from.peer()),
    }
}

#[cfg(test)]
mod test {
    use crate::test_util::connection::{test_connection_to, TestFrameReader};
    use crate::test_util::hub::test_hub_context;
    use crate::test_util::node::test_node_addr_from_number;
    use crate::virtual_conn::virtual_connection::VcKey;
    use super::*;

    fn request(index: u64, target: u16) -> CreateVirtualData {
        CreateVirtualData {
            index,
            source: test_node_addr_from_number(7),
            source_hub: test_node_addr_from_number(55),
            target: test_node_addr_from_number(target),
            target_hub: None,
            info: String::new(),
            timeout_millis: 1000,
            buffer_size: 4,
            hops_left: 0,
        }
    }

    async fn next(reader: &mut TestFrameReader) -> Frame {
        reader.read_frame().await.unwrap().unwrap()
    }

    struct Setup {
        ctx: std::sync::Arc<HubContext>,
        source: Arc<ForwardingConnection>,
        source_reader: TestFrameReader,
        target: Arc<ForwardingConnection>,
        target_reader: TestFrameReader,
    }

    /// two local clients, 7 and 8, with an established circuit 7#1 <-> 8#2
    async fn established() -> Setup {
        let ctx = test_hub_context(100);
        let (source, mut source_reader) = test_connection_to(1, LinkKind::Client, test_node_addr_from_number(7));
        let (target, mut target_reader) = test_connection_to(2, LinkKind::Client, test_node_addr_from_number(8));
        ctx.connections.write().await.insert(source.clone()).unwrap();
        ctx.connections.write().await.insert(target.clone()).unwrap();

        on_create_virtual(&ctx, &source, request(1, 8)).await.unwrap();
        let relayed = match next(&mut target_reader).await {
            Frame::CreateVirtual(data) => data,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(relayed.index, 2);
        assert_eq!(relayed.source_hub, test_node_addr_from_number(100));

        on_create_virtual_ack(&ctx, &target, 2, 4).await.unwrap();
        assert_eq!(next(&mut source_reader).await, Frame::CreateVirtualAck { index: 1, credits: 4 });

        on_create_virtual_ack_ack(&ctx, &source, 1, true).await.unwrap();
        assert_eq!(next(&mut target_reader).await, Frame::CreateVirtualAckAck { index: 2, success: true });

        Setup { ctx, source, source_reader, target, target_reader }
    }

    #[tokio::test]
    async fn test_setup_data_and_close() {
        let mut s = established().await;

        on_message_virtual(&s.ctx, &s.source, 1, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(next(&mut s.target_reader).await, Frame::MessageVirtual { index: 2, data: Bytes::from_static(b"hello") });

        on_message_virtual_ack(&s.ctx, &s.target, 2, 1).await;
        assert_eq!(next(&mut s.source_reader).await, Frame::MessageVirtualAck { index: 1, credits: 1 });

        on_close_virtual(&s.ctx, &s.source, 1).await;
        assert_eq!(next(&mut s.target_reader).await, Frame::CloseVirtual { index: 2 });
        assert!(s.ctx.virtual_connections.is_empty().await);

        // the racing close from the other side is swallowed
        on_close_virtual(&s.ctx, &s.target, 2).await;
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), s.source_reader.read_frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_data_for_unknown_circuit_is_answered_with_close() {
        let mut s = established().await;
        on_message_virtual(&s.ctx, &s.source, 99, Bytes::new()).await.unwrap();
        assert_eq!(next(&mut s.source_reader).await, Frame::CloseVirtual { index: 99 });
    }

    #[tokio::test]
    async fn test_nack_is_relayed_and_clears_entry() {
        let ctx = test_hub_context(100);
        let (source, mut source_reader) = test_connection_to(1, LinkKind::Client, test_node_addr_from_number(7));
        let (target, _target_reader) = test_connection_to(2, LinkKind::Client, test_node_addr_from_number(8));
        ctx.connections.write().await.insert(target.clone()).unwrap();

        on_create_virtual(&ctx, &source, request(1, 8)).await.unwrap();
        assert_eq!(ctx.virtual_connections.len().await, 1);

        on_create_virtual_nack(&ctx, &target, 2, NackReason::NoCallback).await;
        assert_eq!(next(&mut source_reader).await, Frame::CreateVirtualNack { index: 1, reason: NackReason::NoCallback });
        assert!(ctx.virtual_connections.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let ctx = test_hub_context(100);
        let (source, mut source_reader) = test_connection_to(1, LinkKind::Client, test_node_addr_from_number(7));

        on_create_virtual(&ctx, &source, request(1, 8)).await.unwrap();
        assert_eq!(next(&mut source_reader).await, Frame::CreateVirtualNack { index: 1, reason: NackReason::UnknownHost });
        assert!(ctx.virtual_connections.is_empty().await);
    }

    #[tokio::test]
    async fn test_self_connect() {
        let ctx = test_hub_context(100);
        let (source, mut source_reader) = test_connection_to(1, LinkKind::Client, test_node_addr_from_number(7));
        ctx.connections.write().await.insert(source.clone()).unwrap();

        on_create_virtual(&ctx, &source, request(1, 7)).await.unwrap();
        assert_eq!(next(&mut source_reader).await, Frame::CreateVirtualNack { index: 1, reason: NackReason::IllegalTarget });
    }

    #[tokio::test]
    async fn test_hop_budget_exhausted() {
        let ctx = test_hub_context(100);
        let (hub, mut hub_reader) = test_connection_to(1, LinkKind::Hub, test_node_addr_from_number(1));
        let (target, _) = test_connection_to(2, LinkKind::Client, test_node_addr_from_number(8));
        ctx.connections.write().await.insert(target).unwrap();

        on_create_virtual(&ctx, &hub, request(2, 8)).await.unwrap();
        assert_eq!(next(&mut hub_reader).await, Frame::CreateVirtualNack { index: 2, reason: NackReason::UnknownHost });
    }

    #[tokio::test]
    async fn test_server_overload() {
        let mut s = established().await;
        let mut config = s.ctx.config.clone();
        config.max_virtual_connections = 1;
        let ctx = crate::test_util::hub::test_hub_context_with_config(100, config);
        ctx.virtual_connections.register(VirtualConnection::new(
            VcEndpoint::new(s.source.clone(), 101, 1),
            VcEndpoint::new(s.target.clone(), 102, 1),
        )).await.unwrap();
        ctx.connections.write().await.insert(s.target.clone()).unwrap();

        on_create_virtual(&ctx, &s.source, request(3, 8)).await.unwrap();
        assert_eq!(next(&mut s.source_reader).await, Frame::CreateVirtualNack { index: 3, reason: NackReason::ServerOverload });
        assert!(ctx.virtual_connections.find(&VcKey::new(s.source.id(), 3)).await.is_none());
    }
}
