use std::collections::BTreeSet;

use tracing::debug;

use crate::connection::forwarding::ForwardingConnection;
use crate::hub::hub_context::HubContext;
use crate::node_addr::NodeAddr;
use crate::protocol::frame::Frame;
use crate::protocol::opcodes::PropertyAckStatus;

async fn property_ack(conn: &ForwardingConnection, request_id: u32, accepted: bool) -> anyhow::Result<()> {
    conn.send(&Frame::PropertyAck {
        request_id,
        status: PropertyAckStatus::from_accepted(accepted),
    }).await
}

async fn info_reply(conn: &ForwardingConnection, request_id: u32, entries: Vec<String>) -> anyhow::Result<()> {
    conn.send(&Frame::InfoReply {
        request_id,
        entries,
    }).await
}

pub async fn on_register_property(ctx: &HubContext, conn: &ForwardingConnection, request_id: u32, tag: &str, value: &str) -> anyhow::Result<()> {
    let accepted = ctx.registry.write().await
        .register_property(&conn.peer(), tag, value);
    debug!("register property {:?} for {:?}: {}", tag, conn.peer(), accepted);
    property_ack(conn, request_id, accepted).await
}

pub async fn on_update_property(ctx: &HubContext, conn: &ForwardingConnection, request_id: u32, tag: &str, value: &str) -> anyhow::Result<()> {
    let accepted = ctx.registry.write().await
        .update_property(&conn.peer(), tag, value);
    property_ack(conn, request_id, accepted).await
}

pub async fn on_remove_property(ctx: &HubContext, conn: &ForwardingConnection, request_id: u32, tag: &str) -> anyhow::Result<()> {
    let accepted = ctx.registry.write().await
        .remove_property(&conn.peer(), tag);
    property_ack(conn, request_id, accepted).await
}

pub async fn on_hubs(ctx: &HubContext, conn: &ForwardingConnection, request_id: u32) -> anyhow::Result<()> {
    let mut hubs = ctx.registry.read().await
        .select(|h| h.is_reachable().then_some((h.hops, h.addr)));
    hubs.sort();

    let entries = hubs.into_iter()
        .map(|(_, addr)| addr.to_string())
        .collect();
    info_reply(conn, request_id, entries).await
}

pub async fn on_hub_details(ctx: &HubContext, conn: &ForwardingConnection, request_id: u32) -> anyhow::Result<()> {
    let mut hubs = ctx.registry.read().await
        .select(|h| h.is_reachable().then(|| (h.hops, h.addr, h.hub_info())));
    hubs.sort_by_key(|(hops, addr, _)| (*hops, *addr));

    let entries = hubs.into_iter()
        .map(|(_, _, info)| info.to_string())
        .collect();
    info_reply(conn, request_id, entries).await
}

pub async fn on_clients_for_hub(ctx: &HubContext, conn: &ForwardingConnection, request_id: u32, hub: &NodeAddr, tag: &str) -> anyhow::Result<()> {
    let entries = ctx.registry.read().await
        .get(hub)
        .map(|h| h.clients.values()
            .filter(|c| c.has_tag(tag))
            .map(|c| c.addr.to_string())
            .collect())
        .unwrap_or_default();
    info_reply(conn, request_id, entries).await
}

pub async fn on_all_clients(ctx: &HubContext, conn: &ForwardingConnection, request_id: u32, tag: &str) -> anyhow::Result<()> {
    let clients = ctx.registry.read().await
        .select(|h| h.is_reachable().then(|| h.clients.values()
            .filter(|c| c.has_tag(tag))
            .map(|c| c.addr)
            .collect::<Vec<_>>()))
        .into_iter()
        .flatten()
        .collect::<BTreeSet<_>>();

    let entries = clients.into_iter()
        .map(|c| c.to_string())
        .collect();
    info_reply(conn, request_id, entries).await
}

pub async fn on_direction(ctx: &HubContext, conn: &ForwardingConnection, request_id: u32, client: &NodeAddr) -> anyhow::Result<()> {
    let entries = ctx.registry.read().await
        .direction_to_client(client)
        .into_iter()
        .map(|h| h.to_string())
        .collect();
    info_reply(conn, request_id, entries).await
}
