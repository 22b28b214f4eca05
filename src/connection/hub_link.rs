use std::sync::Arc;

use tracing::trace;

use crate::connection::forwarding::ForwardingConnection;
use crate::hub::gossip::{self, GossipEntry};
use crate::hub::hub_context::HubContext;
use crate::protocol::frame::Frame;

pub async fn on_gossip(ctx: &HubContext, conn: &ForwardingConnection, entries: &[GossipEntry]) {
    trace!("received gossip with {} entries", entries.len());
    let mut registry = ctx.registry.write().await;
    gossip::on_gossip(&mut registry, conn.peer(), entries);
}

pub async fn on_ping(ctx: &HubContext, conn: &ForwardingConnection) {
    ctx.registry.write().await
        .touch(conn.peer());
}

/// Sends the peer everything that changed since the last gossip on this link, or a ping if
///  nothing did.
pub async fn send_gossip(ctx: &Arc<HubContext>, conn: &ForwardingConnection) -> anyhow::Result<()> {
    let (entries, watermark) = ctx.registry.read().await
        .gossip_snapshot(conn.last_sent_state(), conn.peer());

    if entries.is_empty() {
        conn.send(&Frame::Ping).await?;
    }
    else {
        trace!("sending {} gossip entries to {:?}", entries.len(), conn.peer());
        conn.send(&Frame::Gossip(entries)).await?;
    }
    conn.set_last_sent_state(watermark);
    Ok(())
}

#[cfg(test)]
mod test {
    use crate::connection::LinkKind;
    use crate::test_util::connection::test_connection_to;
    use crate::test_util::hub::test_hub_context;
    use crate::test_util::node::test_node_addr_from_number;
    use super::*;

    #[tokio::test]
    async fn test_send_gossip_then_ping() {
        let ctx = test_hub_context(100);
        let peer = test_node_addr_from_number(1);
        let (conn, mut peer_reader) = test_connection_to(1, LinkKind::Hub, peer);
        ctx.registry.write().await.add_direct_peer(peer, "", "");

        send_gossip(&ctx, &conn).await.unwrap();
        match peer_reader.read_frame().await.unwrap() {
            Some(Frame::Gossip(entries)) => assert_eq!(entries.len(), 2),
            other => panic!("unexpected {:?}", other),
        }

        send_gossip(&ctx, &conn).await.unwrap();
        assert_eq!(peer_reader.read_frame().await.unwrap(), Some(Frame::Ping));

        ctx.registry.write().await.add_local_client(test_node_addr_from_number(9));
        send_gossip(&ctx, &conn).await.unwrap();
        match peer_reader.read_frame().await.unwrap() {
            Some(Frame::Gossip(entries)) => {
                assert_eq!(entries.len(), 1);
                assert!(entries[0].clients.iter().any(|c| c.addr == test_node_addr_from_number(9)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_refreshes_contact() {
        let ctx = test_hub_context(100);
        let peer = test_node_addr_from_number(1);
        let (conn, _) = test_connection_to(1, LinkKind::Hub, peer);

        on_ping(&ctx, &conn).await;
        assert!(ctx.registry.read().await.get(&peer).unwrap().last_contact.is_some());
    }
}
