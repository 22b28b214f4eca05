use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::{client_link, hub_link, routing, virtual_relay, ConnectionId, LinkKind};
use crate::hub::hub_context::HubContext;
use crate::node_addr::NodeAddr;
use crate::protocol::frame::Frame;
use crate::protocol::framing::{BoxedReader, BoxedWriter, FrameReader, FrameWriter};
use crate::virtual_conn::id_allocator::{ConnectionIdAllocator, Parity};
use crate::virtual_conn::virtual_connection::VcKey;

/// One physical connection of a hub, to a peer hub or to a client. The connection's read loop
///  decodes frames and dispatches them: envelopes are routed, circuit frames relayed, and gossip
///  resp. client requests are handed to the hub link resp. client link handlers.
///
/// Writes from any task go through the connection's writer lock, so frames are never
///  interleaved. Waiting for the lock counts toward the write timeout.
pub struct ForwardingConnection {
    id: ConnectionId,
    kind: LinkKind,
    peer: NodeAddr,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    write_timeout: Duration,
    allocator: ConnectionIdAllocator,
    /// gossip watermark, hub links only
    last_sent_state: AtomicU64,
    closed: AtomicBool,
    torn_down: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Debug for ForwardingConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{}{:?}", self.kind, self.id, self.peer)
    }
}

impl ForwardingConnection {
    pub fn new(id: ConnectionId, kind: LinkKind, peer: NodeAddr, writer: FrameWriter<BoxedWriter>, parity: Parity, write_timeout: Duration) -> Arc<ForwardingConnection> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(ForwardingConnection {
            id,
            kind,
            peer,
            writer: Mutex::new(writer),
            write_timeout,
            allocator: ConnectionIdAllocator::new(parity),
            last_sent_state: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn peer(&self) -> NodeAddr {
        self.peer
    }

    pub fn allocate_index(&self) -> u64 {
        self.allocator.next_id()
    }

    pub fn key(&self, index: u64) -> VcKey {
        VcKey::new(self.id, index)
    }

    pub fn last_sent_state(&self) -> u64 {
        self.last_sent_state.load(Ordering::Acquire)
    }

    pub fn set_last_sent_state(&self, state: u64) {
        self.last_sent_state.store(state, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A failed write closes the connection: the read loop notices and tears it down.
    pub async fn send(&self, frame: &Frame) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("connection {:?} is closed", self);
        }

        let write = async {
            self.writer.lock().await
                .write_frame(frame).await
        };
        let result = match timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("write did not complete within {:?}", self.write_timeout)),
        };
        if let Err(e) = &result {
            debug!("writing to {:?} failed: {} - closing", self, e);
            self.close();
        }
        result
    }

    /// signals the read loop to terminate
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.send_replace(true);
        }
    }

    /// graceful close, telling the peer first
    pub async fn disconnect(&self) {
        let _ = self.send(&Frame::Disconnect).await;
        self.close();
    }

    #[tracing::instrument(name = "connection", skip_all, fields(peer = ?self.peer, id = %self.id))]
    pub async fn run(self: Arc<Self>, ctx: Arc<HubContext>, mut reader: FrameReader<BoxedReader>) {
        let mut shutdown = self.shutdown.subscribe();
        let closed_locally = async move {
            let _ = shutdown.wait_for(|&closed| closed).await;
        };
        tokio::pin!(closed_locally);

        loop {
            select! {
                _ = &mut closed_locally => {
                    debug!("connection closed locally");
                    break;
                }
                frame = reader.read_frame() => match frame {
                    Ok(Some(Frame::Disconnect)) => {
                        debug!("peer disconnected");
                        break;
                    }
                    Ok(Some(frame)) => {
                        if let Err(e) = self.on_frame(&ctx, frame).await {
                            warn!("error handling frame: {} - closing connection", e);
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!("error reading from connection: {} - closing", e);
                        break;
                    }
                }
            }
        }

        self.handle_disconnect(&ctx).await;
    }

    async fn on_frame(self: &Arc<Self>, ctx: &Arc<HubContext>, frame: Frame) -> anyhow::Result<()> {
        match (self.kind, frame) {
            (LinkKind::Hub, Frame::Gossip(entries)) => hub_link::on_gossip(ctx, self, &entries).await,
            (LinkKind::Hub, Frame::Ping) => hub_link::on_ping(ctx, self).await,

            (_, Frame::CreateVirtual(data)) => virtual_relay::on_create_virtual(ctx, self, data).await?,
            (_, Frame::CreateVirtualAck { index, credits }) => virtual_relay::on_create_virtual_ack(ctx, self, index, credits).await?,
            (_, Frame::CreateVirtualNack { index, reason }) => virtual_relay::on_create_virtual_nack(ctx, self, index, reason).await,
            (_, Frame::CreateVirtualAckAck { index, success }) => virtual_relay::on_create_virtual_ack_ack(ctx, self, index, success).await?,
            (_, Frame::CloseVirtual { index }) => virtual_relay::on_close_virtual(ctx, self, index).await,
            (_, Frame::MessageVirtual { index, data }) => virtual_relay::on_message_virtual(ctx, self, index, data).await?,
            (_, Frame::MessageVirtualAck { index, credits }) => virtual_relay::on_message_virtual_ack(ctx, self, index, credits).await,

            (_, Frame::Message(msg)) => routing::on_message(ctx, self, msg).await,

            (LinkKind::Client, Frame::RegisterProperty { request_id, tag, value }) => client_link::on_register_property(ctx, self, request_id, &tag, &value).await?,
            (LinkKind::Client, Frame::UpdateProperty { request_id, tag, value }) => client_link::on_update_property(ctx, self, request_id, &tag, &value).await?,
            (LinkKind::Client, Frame::RemoveProperty { request_id, tag }) => client_link::on_remove_property(ctx, self, request_id, &tag).await?,
            (LinkKind::Client, Frame::Hubs { request_id }) => client_link::on_hubs(ctx, self, request_id).await?,
            (LinkKind::Client, Frame::HubDetails { request_id }) => client_link::on_hub_details(ctx, self, request_id).await?,
            (LinkKind::Client, Frame::ClientsForHub { request_id, hub, tag }) => client_link::on_clients_for_hub(ctx, self, request_id, &hub, &tag).await?,
            (LinkKind::Client, Frame::AllClients { request_id, tag }) => client_link::on_all_clients(ctx, self, request_id, &tag).await?,
            (LinkKind::Client, Frame::Direction { request_id, client }) => client_link::on_direction(ctx, self, request_id, &client).await?,

            (kind, frame) => bail!("unexpected {:?} frame on a {:?} link", frame.opcode(), kind),
        }
        Ok(())
    }

    /// Tears the connection down exactly once: it leaves the connection table, every circuit
    ///  running over it is closed toward its surviving side, and the registry forgets the peer.
    ///
    /// The writer is shut down last. A write that is stuck on this connection holds the writer
    ///  lock until it times out, and must not delay the teardown of circuits on other connections.
    pub async fn handle_disconnect(&self, ctx: &HubContext) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close();

        let was_registered = ctx.connections.write().await.remove(self);

        let circuits = ctx.virtual_connections.remove_all_with_prefix(self.id).await;
        if !circuits.is_empty() {
            debug!("closing {} virtual connections running over {:?}", circuits.len(), self);
        }
        for vc in circuits {
            if let Some(other) = vc.surviving_side(self.id) {
                if other.connection.id() != self.id {
                    let _ = other.connection.send(&Frame::CloseVirtual { index: other.index }).await;
                }
            }
        }

        if was_registered {
            let mut registry = ctx.registry.write().await;
            match self.kind {
                LinkKind::Hub => registry.remove_direct_peer(&self.peer),
                LinkKind::Client => {
                    registry.remove_local_client(&self.peer);
                }
            }
        }

        match self.writer.try_lock() {
            Ok(mut writer) => {
                if timeout(self.write_timeout, writer.shutdown()).await.is_err() {
                    debug!("shutting down the writer of {:?} timed out", self);
                }
            }
            Err(_) => debug!("writer of {:?} is busy - leaving it to the pending write", self),
        }
        info!("{:?} disconnected", self);
    }
}
