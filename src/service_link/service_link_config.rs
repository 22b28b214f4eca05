use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::node_addr::NodeAddr;
use crate::protocol::framing::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug, Clone)]
pub struct ServiceLinkConfig {
    /// the client's identity in the overlay
    pub local_addr: NodeAddr,
    /// hubs to try, in order, until the first successful connection; afterwards only that hub
    ///  is reconnected to
    pub hub_candidates: Vec<SocketAddr>,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Cumulative time spent waiting between failed attempts after which the link gives up.
    ///  `None` retries forever.
    pub max_retry_time: Option<Duration>,
    /// giving up terminates the process
    pub force: bool,

    pub default_timeout: Duration,
    pub connect_timeout: Duration,

    /// number of data frames a peer may send on a circuit before it needs an ack from us
    pub receive_credits: u32,
    pub max_frame_len: usize,
}

impl ServiceLinkConfig {
    pub fn new(local_addr: NodeAddr, hub_candidates: Vec<SocketAddr>) -> ServiceLinkConfig {
        ServiceLinkConfig {
            local_addr,
            hub_candidates,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_retry_time: None,
            force: false,
            default_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            receive_credits: 16,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hub_candidates.is_empty() {
            bail!("at least one hub address is required");
        }
        if self.initial_backoff.is_zero() || self.initial_backoff > self.max_backoff {
            bail!("initial backoff must be positive and at most the maximum backoff");
        }
        if self.receive_credits == 0 {
            bail!("receive credits must be at least 1");
        }
        if self.force && self.max_retry_time.is_none() {
            bail!("'force' requires a maximum retry time");
        }
        Ok(())
    }
}
