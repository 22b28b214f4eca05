use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};
use vhub::hub::hub::Hub;
use vhub::hub::hub_config::HubConfig;

#[derive(Parser)]
struct Args {
    listen_address: String,

    #[clap(long)]
    peer: Vec<String>,

    #[clap(long)]
    name: Option<String>,

    #[clap(long, default_value = "")]
    color: String,

    #[clap(long)]
    gossip_interval_ms: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = HubConfig::new(args.listen_address.parse()?);
    for s in args.peer {
        let peer: SocketAddr = s.parse()?;
        config.peers.push(peer);
    }
    if let Some(name) = args.name {
        config.name = name;
    }
    config.color = args.color;
    if let Some(millis) = args.gossip_interval_ms {
        config.gossip_interval = Duration::from_millis(millis);
    }

    let hub = Hub::new(config).await?;
    info!("hub {} running", hub.addr());
    hub.run().await
}
