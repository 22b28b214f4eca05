use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::connection::forwarding::ForwardingConnection;
use crate::connection::{ConnectionId, LinkKind};
use crate::hub::hub_context::HubContext;
use crate::protocol::client_message::ClientMessage;
use crate::protocol::frame::Frame;

/// An envelope arriving from a client gets the hop budget, an envelope arriving from a hub
///  pays for the hop it just took.
pub async fn on_message(ctx: &HubContext, arrival: &ForwardingConnection, msg: ClientMessage) {
    let msg = match arrival.kind() {
        LinkKind::Client => msg.with_hop_budget(ctx.config.max_hops),
        LinkKind::Hub => match msg.next_hop() {
            Some(msg) => msg,
            None => {
                debug!("dropping message from {:?} to {:?}: hop budget exhausted", msg.source, msg.target);
                return;
            }
        },
    };

    forward(ctx, msg, Some(arrival.id())).await;
}

/// Delivers the envelope toward its destination, bouncing it back to its sender if that is not
///  possible. An envelope that is already on its way back is never bounced again. Returns
///  `true` if the envelope (or its bounced version) was handed to some connection.
pub async fn forward(ctx: &HubContext, msg: ClientMessage, arrival: Option<ConnectionId>) -> bool {
    if deliver(ctx, &msg, arrival).await {
        return true;
    }

    match msg.bounced() {
        Some(bounced) => {
            debug!("returning undeliverable message to {:?}", bounced.source);
            if deliver(ctx, &bounced, None).await {
                true
            }
            else {
                warn!("message from {:?} to {:?} can be delivered neither way - dropping", msg.source, msg.target);
                false
            }
        }
        None => {
            warn!("returned message for {:?} is undeliverable - dropping", msg.source);
            false
        }
    }
}

/// Tries the local client table first, then the declared target hub (directly or through its
///  indirection), then every hub claiming to host the destination. Never sends back over the
///  connection the envelope arrived on.
async fn deliver(ctx: &HubContext, msg: &ClientMessage, exclude: Option<ConnectionId>) -> bool {
    let (destination, destination_hub) = msg.destination();
    let frame = Frame::Message(msg.clone());

    if let Some(conn) = ctx.client_link(&destination).await {
        trace!("delivering message to local client {:?}", destination);
        return conn.send(&frame).await.is_ok();
    }

    if msg.hops_left == 0 {
        return false;
    }

    if let Some(hub) = destination_hub {
        if hub != ctx.myself {
            if let Some(conn) = ctx.route_to_hub(&hub).await {
                if Some(conn.id()) != exclude && conn.send(&frame).await.is_ok() {
                    return true;
                }
            }
        }
    }

    let candidates = ctx.registry.read().await
        .hubs_for_client(&destination);

    let mut sent_to = FxHashSet::default();
    let mut delivered = false;
    for hub in candidates {
        if let Some(conn) = ctx.route_to_hub(&hub).await {
            if Some(conn.id()) == exclude || !sent_to.insert(conn.id()) {
                continue;
            }
            if conn.send(&frame).await.is_ok() {
                delivered = true;
            }
        }
    }
    delivered
}
