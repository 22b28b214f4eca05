use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::connection::forwarding::ForwardingConnection;
use crate::connection::{hub_link, LinkKind};
use crate::hub::hub_context::HubContext;
use crate::node_addr::NodeAddr;
use crate::protocol::frame::Frame;
use crate::protocol::framing::{BoxedReader, BoxedWriter, FrameReader, FrameWriter};
use crate::virtual_conn::id_allocator::Parity;

fn split(ctx: &HubContext, stream: TcpStream) -> (FrameReader<BoxedReader>, FrameWriter<BoxedWriter>) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let reader: BoxedReader = Box::new(read_half);
    let writer: BoxedWriter = Box::new(write_half);
    (FrameReader::new(reader, ctx.config.max_frame_len), FrameWriter::new(writer, ctx.config.max_frame_len))
}

async fn deny(mut writer: FrameWriter<BoxedWriter>, reason: &str) -> anyhow::Error {
    if writer.write_frame(&Frame::ConnectionDenied { reason: reason.to_string() }).await.is_ok() {
        let _ = writer.shutdown().await;
    }
    anyhow!("denied connection: {}", reason)
}

/// Runs the accepting side of the session handshake on a freshly accepted stream and, if the
///  peer is admitted, spawns the connection's read loop.
pub async fn accept_connection(ctx: Arc<HubContext>, stream: TcpStream) -> anyhow::Result<Arc<ForwardingConnection>> {
    let (mut reader, mut writer) = split(&ctx, stream);

    let first = timeout(ctx.config.handshake_timeout, reader.read_frame()).await
        .map_err(|_| anyhow!("handshake timed out"))??;

    let (kind, peer, name, color) = match first {
        Some(Frame::ServiceLinkConnect { client }) => {
            if ctx.connections.read().await.contains(LinkKind::Client, &client) {
                return Err(deny(writer, "a client with this address is already connected").await);
            }
            (LinkKind::Client, client, String::new(), String::new())
        }
        Some(Frame::HubConnect { hub, name, color }) => {
            if hub == ctx.myself {
                return Err(deny(writer, "hub connecting to itself").await);
            }
            if ctx.connections.read().await.contains(LinkKind::Hub, &hub) {
                return Err(deny(writer, "duplicate hub link").await);
            }
            (LinkKind::Hub, hub, name, color)
        }
        Some(other) => bail!("expected a connect frame, received {:?}", other.opcode()),
        None => bail!("connection closed during handshake"),
    };

    writer.write_frame(&Frame::ConnectionAccepted { hub: ctx.myself }).await?;

    // the connecting side of a hub link allocates even ids, a client odd ones
    let conn = ForwardingConnection::new(ctx.next_connection_id(), kind, peer, writer, match kind {
        LinkKind::Hub => Parity::Odd,
        LinkKind::Client => Parity::Even,
    }, ctx.config.write_timeout);
    register(&ctx, &conn, &name, &color).await?;

    info!("accepted {:?}", conn);
    tokio::spawn(conn.clone().run(ctx.clone(), reader));

    if kind == LinkKind::Hub {
        hub_link::send_gossip(&ctx, &conn).await?;
    }
    Ok(conn)
}

async fn register(ctx: &HubContext, conn: &Arc<ForwardingConnection>, name: &str, color: &str) -> anyhow::Result<()> {
    if let Err(e) = ctx.connections.write().await.insert(conn.clone()) {
        // lost a race against a concurrent connection from the same peer
        conn.disconnect().await;
        return Err(e);
    }

    let mut registry = ctx.registry.write().await;
    match conn.kind() {
        LinkKind::Hub => registry.add_direct_peer(conn.peer(), name, color),
        LinkKind::Client => {
            registry.add_local_client(conn.peer());
        }
    }
    Ok(())
}

/// Dials a peer hub and runs the connecting side of the handshake.
pub async fn connect_to_hub(ctx: Arc<HubContext>, addr: SocketAddr) -> anyhow::Result<NodeAddr> {
    let stream = timeout(ctx.config.connect_timeout, TcpStream::connect(addr)).await
        .map_err(|_| anyhow!("connecting to {} timed out", addr))??;
    let (mut reader, mut writer) = split(&ctx, stream);

    writer.write_frame(&Frame::HubConnect {
        hub: ctx.myself,
        name: ctx.config.name.clone(),
        color: ctx.config.color.clone(),
    }).await?;

    let reply = timeout(ctx.config.handshake_timeout, reader.read_frame()).await
        .map_err(|_| anyhow!("handshake with {} timed out", addr))??;

    let peer = match reply {
        Some(Frame::ConnectionAccepted { hub }) => hub,
        Some(Frame::ConnectionDenied { reason }) => bail!("{} denied the hub link: {}", addr, reason),
        Some(other) => bail!("unexpected {:?} during handshake with {}", other.opcode(), addr),
        None => bail!("{} closed the connection during handshake", addr),
    };
    if peer == ctx.myself {
        writer.write_frame(&Frame::Disconnect).await?;
        bail!("{} is this hub's own address", addr);
    }

    let conn = ForwardingConnection::new(ctx.next_connection_id(), LinkKind::Hub, peer, writer, Parity::Even, ctx.config.write_timeout);
    register(&ctx, &conn, "", "").await?;

    debug!("linked to hub {:?}", peer);
    tokio::spawn(conn.clone().run(ctx.clone(), reader));
    hub_link::send_gossip(&ctx, &conn).await?;
    Ok(peer)
}
