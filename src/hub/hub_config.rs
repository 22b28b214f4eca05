use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::protocol::framing::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_addr: SocketAddr,
    /// The address this hub announces to peers and clients. Needed if `listen_addr` is a wildcard
    ///  address or the hub is reachable only through some form of port forwarding.
    pub public_addr: Option<SocketAddr>,

    pub name: String,
    /// informational, passed on to visualization tools
    pub color: String,

    /// peer hubs to link to at startup, retried every `peer_connect_interval` while not linked
    pub peers: Vec<SocketAddr>,
    pub peer_connect_interval: Duration,
    /// If set, the hub also links to hubs it learns about through gossip. Of two hubs that
    ///  discover each other, only the one with the smaller address dials.
    pub connect_to_discovered_hubs: bool,

    pub gossip_interval: Duration,
    /// a hub link without any incoming traffic for this long is considered dead
    pub hub_link_timeout: Duration,

    /// hop budget assigned to envelopes and connection setup requests entering the overlay
    pub max_hops: u32,
    pub max_virtual_connections: usize,

    pub max_frame_len: usize,
    /// A write that does not complete within this time closes the connection, so a peer that
    ///  stops reading cannot stall gossip or circuit traffic for other peers.
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
}

impl HubConfig {
    pub fn new(listen_addr: SocketAddr) -> HubConfig {
        HubConfig {
            listen_addr,
            public_addr: None,
            name: listen_addr.to_string(),
            color: String::new(),
            peers: Vec::new(),
            peer_connect_interval: Duration::from_secs(5),
            connect_to_discovered_hubs: true,
            gossip_interval: Duration::from_secs(1),
            hub_link_timeout: Duration::from_secs(30),
            max_hops: 8,
            max_virtual_connections: 10_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gossip_interval.is_zero() {
            bail!("gossip interval must not be zero");
        }
        if self.hub_link_timeout <= self.gossip_interval {
            bail!("hub link timeout ({:?}) must be longer than the gossip interval ({:?})", self.hub_link_timeout, self.gossip_interval);
        }
        if self.max_hops == 0 {
            bail!("max hops must be at least 1");
        }
        if self.max_frame_len < 1024 {
            bail!("max frame length is too small");
        }
        if self.write_timeout.is_zero() {
            bail!("write timeout must not be zero");
        }
        Ok(())
    }
}
