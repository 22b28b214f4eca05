use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::select;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connection::forwarding::ForwardingConnection;
use crate::connection::handshake;
use crate::connection::hub_link;
use crate::hub::hub_config::HubConfig;
use crate::hub::hub_context::HubContext;
use crate::node_addr::NodeAddr;

/// A hub process: accepts client and hub connections, gossips with its peer hubs and keeps
///  (re-)establishing links to configured and discovered peers.
pub struct Hub {
    ctx: Arc<HubContext>,
    listener: TcpListener,
}

impl Hub {
    pub async fn new(config: HubConfig) -> anyhow::Result<Hub> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr).await?;
        let bound_addr = listener.local_addr()?;
        let myself = NodeAddr::from(config.public_addr.unwrap_or(bound_addr));
        info!("hub {:?} listening on {}", myself, bound_addr);

        Ok(Hub {
            ctx: HubContext::new(config, myself),
            listener,
        })
    }

    pub fn addr(&self) -> NodeAddr {
        self.ctx.myself
    }

    pub fn context(&self) -> Arc<HubContext> {
        self.ctx.clone()
    }

    /// runs until accepting connections fails
    pub async fn run(self) -> anyhow::Result<()> {
        let ctx = self.ctx;
        select! {
            result = accept_loop(ctx.clone(), self.listener) => result,
            _ = gossip_loop(ctx.clone()) => Ok(()),
            _ = peer_connect_loop(ctx.clone()) => Ok(()),
        }
    }
}

async fn accept_loop(ctx: Arc<HubContext>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (stream, from) = listener.accept().await?;
        debug!("incoming connection from {}", from);

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handshake::accept_connection(ctx, stream).await {
                debug!("rejected connection from {}: {}", from, e);
            }
        });
    }
}

/// Gossips on every hub link once per interval, closing links that have been silent for too
///  long.
async fn gossip_loop(ctx: Arc<HubContext>) {
    let mut ticks = interval(ctx.config.gossip_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        let links = ctx.connections.read().await.hub_links();
        for conn in links {
            let last_contact = ctx.registry.read().await
                .get(&conn.peer())
                .and_then(|h| h.last_contact);
            if let Some(last_contact) = last_contact {
                if last_contact.elapsed() > ctx.config.hub_link_timeout {
                    warn!("no traffic from hub {:?} for {:?} - closing the link", conn.peer(), last_contact.elapsed());
                    conn.close();
                    continue;
                }
            }

            spawn_gossip(&ctx, conn);
        }
    }
}

/// Each link gets its own task, so a peer that stops reading delays nobody but itself.
fn spawn_gossip(ctx: &Arc<HubContext>, conn: Arc<ForwardingConnection>) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = hub_link::send_gossip(&ctx, &conn).await {
            debug!("error sending gossip to {:?}: {}", conn.peer(), e);
        }
    });
}

async fn peer_connect_loop(ctx: Arc<HubContext>) {
    let mut ticks = interval(ctx.config.peer_connect_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        for addr in peers_to_dial(&ctx).await {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                // jitter makes simultaneous dialling of two configured peers unlikely
                let jitter_millis = ctx.config.peer_connect_interval.as_millis() as u64 / 4;
                if jitter_millis > 0 {
                    let delay = rand::thread_rng().gen_range(0..jitter_millis);
                    sleep(Duration::from_millis(delay)).await;
                }

                match handshake::connect_to_hub(ctx, addr).await {
                    Ok(peer) => info!("linked to hub {:?}", peer),
                    Err(e) => debug!("could not link to hub at {}: {}", addr, e),
                }
            });
        }
    }
}

/// Configured peers are dialled whenever there is no link to them. Hubs discovered through
///  gossip are dialled only by the side with the smaller address so that two hubs learning of
///  each other do not cross-connect.
async fn peers_to_dial(ctx: &HubContext) -> Vec<SocketAddr> {
    let linked = ctx.connections.read().await
        .hub_links()
        .into_iter()
        .map(|c| c.peer())
        .collect::<Vec<_>>();
    let is_linked = |socket_addr: &SocketAddr| linked.iter().any(|p| &p.socket_addr == socket_addr);

    let mut result = ctx.config.peers.iter()
        .filter(|&addr| addr != &ctx.myself.socket_addr && !is_linked(addr))
        .cloned()
        .collect::<Vec<_>>();

    if ctx.config.connect_to_discovered_hubs {
        let discovered = ctx.registry.read().await.discovered_hubs();
        for hub in discovered {
            if ctx.myself < hub && !is_linked(&hub.socket_addr) && !result.contains(&hub.socket_addr) {
                result.push(hub.socket_addr);
            }
        }
    }
    result
}

/// Starts the hub in a background task, logging if it terminates.
pub fn spawn_hub(hub: Hub) -> NodeAddr {
    let addr = hub.addr();
    tokio::spawn(async move {
        if let Err(e) = hub.run().await {
            error!("hub {:?} terminated: {}", addr, e);
        }
    });
    addr
}

#[cfg(test)]
mod test {
    use tokio::time::timeout;

    use crate::connection::LinkKind;
    use crate::protocol::frame::Frame;
    use crate::test_util::connection::{test_connection_to, test_connection_with_buffer};
    use crate::test_util::hub::test_hub_context_with_config;
    use crate::test_util::node::test_node_addr_from_number;
    use super::*;

    #[tokio::test]
    async fn test_peers_to_dial() {
        let mut config = HubConfig::new("127.0.0.1:100".parse().unwrap());
        config.peers = vec!["127.0.0.1:1".parse().unwrap(), "127.0.0.1:100".parse().unwrap()];
        let ctx = test_hub_context_with_config(100, config);
        {
            let mut registry = ctx.registry.write().await;
            let peer = test_node_addr_from_number(1);
            registry.add_direct_peer(peer, "", "");
            registry.update_route(test_node_addr_from_number(50), peer, 1);
            registry.update_route(test_node_addr_from_number(150), peer, 1);
        }

        let to_dial = peers_to_dial(&ctx).await;
        assert_eq!(to_dial, vec![
            "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
            "127.0.0.1:150".parse::<SocketAddr>().unwrap(),
        ]);
    }

    #[tokio::test]
    async fn test_stalled_link_does_not_delay_gossip_to_others() {
        let ctx = test_hub_context_with_config(100, HubConfig::new("127.0.0.1:100".parse().unwrap()));
        let stalled_peer = test_node_addr_from_number(1);
        let healthy_peer = test_node_addr_from_number(2);
        let (stalled, _stalled_reader) = test_connection_with_buffer(1, LinkKind::Hub, stalled_peer, 16, Duration::from_secs(60));
        let (healthy, mut healthy_reader) = test_connection_to(2, LinkKind::Hub, healthy_peer);
        {
            let mut registry = ctx.registry.write().await;
            registry.add_direct_peer(stalled_peer, "", "");
            registry.add_direct_peer(healthy_peer, "", "");
        }

        spawn_gossip(&ctx, stalled.clone());
        spawn_gossip(&ctx, healthy.clone());

        let frame = timeout(Duration::from_secs(2), healthy_reader.read_frame()).await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Frame::Gossip(_)));
        assert!(!stalled.is_closed());
    }
}
