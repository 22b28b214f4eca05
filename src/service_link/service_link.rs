use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::hub::hub_info::HubInfo;
use crate::node_addr::NodeAddr;
use crate::protocol::client_message::ClientMessage;
use crate::protocol::frame::{CreateVirtualData, Frame};
use crate::protocol::framing::{BoxedReader, BoxedWriter, FrameReader, FrameWriter};
use crate::protocol::opcodes::{NackReason, PropertyAckStatus};
use crate::service_link::callback::{ClientMessageHandler, VirtualConnectionCallback};
use crate::service_link::circuit::{Circuit, CircuitRole, SetupResult};
use crate::service_link::replies::{PendingReplies, Reply};
use crate::service_link::service_link_config::ServiceLinkConfig;
use crate::service_link::LinkError;
use crate::util::backoff::ExponentialBackoff;
use crate::virtual_conn::id_allocator::{ConnectionIdAllocator, Parity};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected(NodeAddr),
    /// the retry budget is exhausted, the link does not reconnect any more
    Failed,
}

impl LinkState {
    pub fn hub(&self) -> Option<NodeAddr> {
        match self {
            LinkState::Connected(hub) => Some(*hub),
            _ => None,
        }
    }
}

/// A client's connection to the overlay. The link keeps (and re-establishes) one session to a
///  hub in a background task, correlates control requests with the hub's replies, dispatches
///  envelopes to module handlers, and maintains the client end of virtual connections.
///
/// Virtual connection ids allocated by the client are odd, those allocated by the hub even.
pub struct ServiceLink {
    config: ServiceLinkConfig,
    state: watch::Sender<LinkState>,
    shutdown: watch::Sender<bool>,
    writer: Mutex<Option<FrameWriter<BoxedWriter>>>,
    allocator: ConnectionIdAllocator,
    circuits: Mutex<FxHashMap<u64, Arc<Circuit>>>,
    replies: PendingReplies,
    callback: RwLock<Option<Arc<dyn VirtualConnectionCallback>>>,
    modules: RwLock<FxHashMap<String, Arc<dyn ClientMessageHandler>>>,
}

impl ServiceLink {
    /// Validates the configuration and spawns the task that connects (and reconnects) to a hub.
    pub fn start(config: ServiceLinkConfig) -> anyhow::Result<Arc<ServiceLink>> {
        config.validate()?;

        let link = ServiceLink::new(config);
        tokio::spawn(link.clone().connection_loop());
        Ok(link)
    }

    fn new(config: ServiceLinkConfig) -> Arc<ServiceLink> {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Arc::new(ServiceLink {
            config,
            state,
            shutdown,
            writer: Default::default(),
            allocator: ConnectionIdAllocator::new(Parity::Odd),
            circuits: Default::default(),
            replies: Default::default(),
            callback: Default::default(),
            modules: Default::default(),
        })
    }

    pub fn local_addr(&self) -> NodeAddr {
        self.config.local_addr
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn hub_addr(&self) -> Option<NodeAddr> {
        self.state().hub()
    }

    /// Waits until a session with a hub is established, returning the hub's address.
    pub async fn wait_connected(&self, wait: Duration) -> Result<NodeAddr, LinkError> {
        let mut state = self.state.subscribe();
        let result = timeout(wait, async move {
            state.wait_for(|s| matches!(s, LinkState::Connected(_) | LinkState::Failed)).await
                .map(|s| *s)
        }).await;

        match result {
            Ok(Ok(LinkState::Connected(hub))) => Ok(hub),
            Ok(Ok(_)) => Err(LinkError::Failed),
            Ok(Err(_)) | Err(_) => Err(LinkError::NotConnected),
        }
    }

    /// Sends DISCONNECT to the hub and stops reconnecting. Open virtual connections are reported
    ///  as disconnected.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.write_frame(&Frame::Disconnect).await;
            let _ = writer.shutdown().await;
        }
    }

    #[tracing::instrument(skip_all, fields(client = ?self.config.local_addr))]
    async fn connection_loop(self: Arc<Self>) {
        let mut backoff = ExponentialBackoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut known_hub: Option<SocketAddr> = None;
        let mut shutdown = self.shutdown.subscribe();

        while !*shutdown.borrow() {
            self.state.send_replace(LinkState::Connecting);

            let candidates = match known_hub {
                Some(addr) => vec![addr],
                None => self.config.hub_candidates.clone(),
            };
            let mut session = None;
            for addr in candidates {
                match self.connect(addr).await {
                    Ok(s) => {
                        session = Some((addr, s));
                        break;
                    }
                    Err(e) => debug!("connecting to hub at {} failed: {}", addr, e),
                }
            }

            match session {
                Some((addr, (hub, reader, writer))) => {
                    backoff.reset();
                    known_hub = Some(addr);
                    *self.writer.lock().await = Some(writer);
                    self.state.send_replace(LinkState::Connected(hub));
                    info!("connected to hub {:?}", hub);

                    self.run_session(reader).await;

                    if let Some(mut writer) = self.writer.lock().await.take() {
                        let _ = writer.shutdown().await;
                    }
                    self.state.send_replace(LinkState::Disconnected);
                    info!("session with hub {:?} ended", hub);
                    self.on_link_lost().await;
                }
                None => {
                    self.state.send_replace(LinkState::Disconnected);
                    let delay = backoff.next_delay();

                    if let Some(budget) = self.config.max_retry_time {
                        if backoff.total_waited() > budget {
                            if self.config.force {
                                error!("could not connect to any hub within {:?} - terminating", budget);
                                std::process::exit(1);
                            }
                            warn!("could not connect to any hub within {:?} - giving up", budget);
                            self.state.send_replace(LinkState::Failed);
                            self.replies.fail_all().await;
                            return;
                        }
                    }

                    select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        self.state.send_replace(LinkState::Disconnected);
    }

    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<(NodeAddr, FrameReader<BoxedReader>, FrameWriter<BoxedWriter>)> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr)).await
            .map_err(|_| anyhow!("connecting to {} timed out", addr))??;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);
        let mut reader = FrameReader::new(reader, self.config.max_frame_len);
        let mut writer = FrameWriter::new(writer, self.config.max_frame_len);

        writer.write_frame(&Frame::ServiceLinkConnect { client: self.config.local_addr }).await?;

        let reply = timeout(self.config.connect_timeout, reader.read_frame()).await
            .map_err(|_| anyhow!("handshake with {} timed out", addr))??;
        match reply {
            Some(Frame::ConnectionAccepted { hub }) => Ok((hub, reader, writer)),
            Some(Frame::ConnectionDenied { reason }) => bail!("hub at {} denied the connection: {}", addr, reason),
            Some(other) => bail!("unexpected {:?} during handshake with {}", other.opcode(), addr),
            None => bail!("{} closed the connection during handshake", addr),
        }
    }

    async fn run_session(&self, mut reader: FrameReader<BoxedReader>) {
        let mut shutdown = self.shutdown.subscribe();
        let shut_down = async move {
            let _ = shutdown.wait_for(|&s| s).await;
        };
        tokio::pin!(shut_down);

        loop {
            select! {
                _ = &mut shut_down => return,
                frame = reader.read_frame() => match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.on_frame(frame).await {
                            warn!("closing session: {}", e);
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("hub closed the connection");
                        return;
                    }
                    Err(e) => {
                        warn!("error reading from hub: {}", e);
                        return;
                    }
                }
            }
        }
    }

    async fn on_link_lost(&self) {
        let circuits = self.circuits.lock().await
            .drain()
            .map(|(_, c)| c)
            .collect::<Vec<_>>();

        let callback = self.callback().await;
        for circuit in circuits {
            circuit.close().await;
            if let Some(callback) = &callback {
                callback.on_disconnect(circuit.index).await;
            }
        }
        self.replies.fail_all().await;
    }

    async fn on_frame(&self, frame: Frame) -> anyhow::Result<()> {
        match frame {
            Frame::InfoReply { request_id, entries } => {
                self.replies.complete(request_id, Reply::Info(entries)).await;
            }
            Frame::PropertyAck { request_id, status } => {
                self.replies.complete(request_id, Reply::PropertyAck(status)).await;
            }
            Frame::Message(msg) => self.on_message(msg).await,
            Frame::CreateVirtual(data) => self.on_create_virtual(data).await?,
            Frame::CreateVirtualAck { index, credits } => self.on_create_virtual_ack(index, credits).await?,
            Frame::CreateVirtualNack { index, reason } => self.on_create_virtual_nack(index, reason).await,
            Frame::CreateVirtualAckAck { index, success } => self.on_create_virtual_ack_ack(index, success).await,
            Frame::CloseVirtual { index } => self.on_close_virtual(index).await,
            Frame::MessageVirtual { index, data } => self.on_message_virtual(index, data).await?,
            Frame::MessageVirtualAck { index, credits } => self.on_message_virtual_ack(index, credits).await,
            Frame::Ping => {}
            Frame::Disconnect => bail!("hub ended the session"),
            other => bail!("unexpected {:?} from hub", other.opcode()),
        }
        Ok(())
    }

    async fn on_message(&self, msg: ClientMessage) {
        let handler = self.modules.read().await.get(&msg.module).cloned();
        match handler {
            Some(handler) => handler.on_message(msg).await,
            None => debug!("no handler for module {:?} - dropping message from {:?}", msg.module, msg.source),
        }
    }

    async fn on_create_virtual(&self, data: CreateVirtualData) -> anyhow::Result<()> {
        let Some(callback) = self.callback().await
        else {
            debug!("virtual connection request from {:?} without a registered callback", data.source);
            self.send_frame(&Frame::CreateVirtualNack { index: data.index, reason: NackReason::NoCallback }).await?;
            return Ok(());
        };

        {
            let mut circuits = self.circuits.lock().await;
            if circuits.contains_key(&data.index) {
                warn!("virtual connection request for index {} which is in use", data.index);
                drop(circuits);
                self.send_frame(&Frame::CreateVirtualNack { index: data.index, reason: NackReason::ConnectionRefused }).await?;
                return Ok(());
            }
            circuits.insert(data.index, Arc::new(Circuit::new_acceptor(data.index, data.buffer_size)));
        }

        callback.on_connect(data.index, data.source, data.info, Duration::from_millis(data.timeout_millis), data.buffer_size).await;
        Ok(())
    }

    async fn on_create_virtual_ack(&self, index: u64, credits: u32) -> anyhow::Result<()> {
        let circuit = match self.circuit(index).await {
            Some(c) if c.role == CircuitRole::Requester => c,
            _ => {
                debug!("ACK for unknown virtual connection {} - abandoning it", index);
                self.send_frame(&Frame::CreateVirtualAckAck { index, success: false }).await?;
                return Ok(());
            }
        };

        if !circuit.establish(credits).await {
            debug!("duplicate ACK for virtual connection {}", index);
            return Ok(());
        }
        self.send_frame(&Frame::CreateVirtualAckAck { index, success: true }).await?;

        if let Some(callback) = self.callback().await {
            callback.on_connect_ack(index, credits).await;
        }
        Ok(())
    }

    async fn on_create_virtual_nack(&self, index: u64, reason: NackReason) {
        let Some(circuit) = self.remove_circuit(index).await
        else {
            debug!("NACK for unknown virtual connection {}", index);
            return;
        };
        circuit.fail_setup(reason).await;
        circuit.close().await;

        if let Some(callback) = self.callback().await {
            callback.on_connect_nack(index, reason).await;
        }
    }

    async fn on_create_virtual_ack_ack(&self, index: u64, success: bool) {
        let Some(circuit) = self.circuit(index).await
        else {
            debug!("ACK_ACK for unknown virtual connection {}", index);
            return;
        };

        if success {
            circuit.establish_as_acceptor().await;
        }
        else if let Some(circuit) = self.remove_circuit(index).await {
            circuit.close().await;
        }

        if let Some(callback) = self.callback().await {
            callback.on_connect_ack_ack(index, success).await;
        }
    }

    async fn on_close_virtual(&self, index: u64) {
        let Some(circuit) = self.remove_circuit(index).await
        else {
            debug!("CLOSE for unknown virtual connection {} - already closed", index);
            return;
        };
        circuit.close().await;

        if let Some(callback) = self.callback().await {
            callback.on_disconnect(index).await;
        }
    }

    async fn on_message_virtual(&self, index: u64, data: Bytes) -> anyhow::Result<()> {
        if self.circuit(index).await.is_none() {
            debug!("data for unknown virtual connection {} - closing it", index);
            self.send_frame(&Frame::CloseVirtual { index }).await?;
            return Ok(());
        }

        match self.callback().await {
            Some(callback) => callback.on_message(index, data).await,
            None => {
                debug!("no callback registered - closing virtual connection {}", index);
                if let Some(circuit) = self.remove_circuit(index).await {
                    circuit.close().await;
                }
                self.send_frame(&Frame::CloseVirtual { index }).await?;
            }
        }
        Ok(())
    }

    async fn on_message_virtual_ack(&self, index: u64, credits: u32) {
        let Some(circuit) = self.circuit(index).await
        else {
            debug!("data ACK for unknown virtual connection {}", index);
            return;
        };
        circuit.add_credits(credits);

        if let Some(callback) = self.callback().await {
            callback.on_message_ack(index, credits).await;
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut()
        else {
            return Err(LinkError::NotConnected);
        };

        if let Err(e) = w.write_frame(frame).await {
            // the read loop notices the broken connection and cleans up
            writer.take();
            return Err(e.into());
        }
        Ok(())
    }

    async fn callback(&self) -> Option<Arc<dyn VirtualConnectionCallback>> {
        self.callback.read().await.clone()
    }

    async fn circuit(&self, index: u64) -> Option<Arc<Circuit>> {
        self.circuits.lock().await.get(&index).cloned()
    }

    async fn remove_circuit(&self, index: u64) -> Option<Arc<Circuit>> {
        self.circuits.lock().await.remove(&index)
    }

    async fn request(&self, wait: Option<Duration>, frame: impl FnOnce(u32) -> Frame) -> Result<Reply, LinkError> {
        let wait = wait.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + wait;
        self.wait_connected(wait).await?;

        let (request_id, reply) = self.replies.register().await;
        if let Err(e) = self.send_frame(&frame(request_id)).await {
            self.replies.cancel(request_id).await;
            return Err(e);
        }

        match timeout_at(deadline, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LinkError::NotConnected),
            Err(_) => {
                self.replies.cancel(request_id).await;
                Err(LinkError::Timeout)
            }
        }
    }

    async fn info_request(&self, wait: Option<Duration>, frame: impl FnOnce(u32) -> Frame) -> Result<Vec<String>, LinkError> {
        match self.request(wait, frame).await? {
            Reply::Info(entries) => Ok(entries),
            other => Err(LinkError::Protocol(format!("expected an info reply, received {:?}", other))),
        }
    }

    async fn property_request(&self, wait: Option<Duration>, frame: impl FnOnce(u32) -> Frame) -> Result<bool, LinkError> {
        match self.request(wait, frame).await? {
            Reply::PropertyAck(status) => Ok(status == PropertyAckStatus::Accepted),
            other => Err(LinkError::Protocol(format!("expected a property ack, received {:?}", other))),
        }
    }

    /// addresses of all hubs known to our hub
    pub async fn hubs(&self, wait: Option<Duration>) -> Result<Vec<NodeAddr>, LinkError> {
        parse_entries(self.info_request(wait, |request_id| Frame::Hubs { request_id }).await?)
    }

    pub async fn hub_details(&self, wait: Option<Duration>) -> Result<Vec<HubInfo>, LinkError> {
        parse_entries(self.info_request(wait, |request_id| Frame::HubDetails { request_id }).await?)
    }

    /// Clients connected to `hub`. A non-empty `tag` restricts the result to clients that
    ///  registered a property with that tag.
    pub async fn clients_for_hub(&self, hub: NodeAddr, tag: &str, wait: Option<Duration>) -> Result<Vec<NodeAddr>, LinkError> {
        let tag = tag.to_string();
        parse_entries(self.info_request(wait, |request_id| Frame::ClientsForHub { request_id, hub, tag }).await?)
    }

    pub async fn all_clients(&self, tag: &str, wait: Option<Duration>) -> Result<Vec<NodeAddr>, LinkError> {
        let tag = tag.to_string();
        parse_entries(self.info_request(wait, |request_id| Frame::AllClients { request_id, tag }).await?)
    }

    /// hubs through which `client` can be reached, best first
    pub async fn direction_to_client(&self, client: NodeAddr, wait: Option<Duration>) -> Result<Vec<NodeAddr>, LinkError> {
        parse_entries(self.info_request(wait, |request_id| Frame::Direction { request_id, client }).await?)
    }

    /// returns false if the hub rejected the property because the tag is registered already
    pub async fn register_property(&self, tag: &str, value: &str, wait: Option<Duration>) -> Result<bool, LinkError> {
        let (tag, value) = (tag.to_string(), value.to_string());
        self.property_request(wait, |request_id| Frame::RegisterProperty { request_id, tag, value }).await
    }

    pub async fn update_property(&self, tag: &str, value: &str, wait: Option<Duration>) -> Result<bool, LinkError> {
        let (tag, value) = (tag.to_string(), value.to_string());
        self.property_request(wait, |request_id| Frame::UpdateProperty { request_id, tag, value }).await
    }

    pub async fn remove_property(&self, tag: &str, wait: Option<Duration>) -> Result<bool, LinkError> {
        let tag = tag.to_string();
        self.property_request(wait, |request_id| Frame::RemoveProperty { request_id, tag }).await
    }

    pub async fn register_module(&self, module: &str, handler: Arc<dyn ClientMessageHandler>) -> Result<(), LinkError> {
        let mut modules = self.modules.write().await;
        if modules.contains_key(module) {
            return Err(LinkError::ModuleAlreadyRegistered(module.to_string()));
        }
        modules.insert(module.to_string(), handler);
        Ok(())
    }

    pub async fn deregister_module(&self, module: &str) -> bool {
        self.modules.write().await.remove(module).is_some()
    }

    pub async fn send_message(&self, target: NodeAddr, target_hub: Option<NodeAddr>, module: &str, opcode: u32, payload: Bytes) -> Result<(), LinkError> {
        let hub = self.hub_addr().ok_or(LinkError::NotConnected)?;
        let msg = ClientMessage::new(self.config.local_addr, hub, target, target_hub, module, opcode, payload);
        self.send_frame(&Frame::Message(msg)).await
    }

    pub async fn register_callback(&self, callback: Arc<dyn VirtualConnectionCallback>) -> Result<(), LinkError> {
        let mut registered = self.callback.write().await;
        if registered.is_some() {
            return Err(LinkError::CallbackAlreadyRegistered);
        }
        *registered = Some(callback);
        Ok(())
    }

    pub async fn unregister_callback(&self) -> bool {
        self.callback.write().await.take().is_some()
    }

    /// Requests a virtual connection to `target` and returns its index without waiting for the
    ///  outcome, which is reported to the registered callback.
    pub async fn create_virtual_connection(&self, target: NodeAddr, target_hub: Option<NodeAddr>, info: &str, setup_timeout: Duration) -> Result<u64, LinkError> {
        self.open_circuit(target, target_hub, info, setup_timeout, None).await
    }

    /// Like [ServiceLink::create_virtual_connection], but waits for the outcome: a refusal is
    ///  reported as [LinkError::Refused] with the NACK's reason.
    pub async fn connect_virtual(&self, target: NodeAddr, target_hub: Option<NodeAddr>, info: &str, setup_timeout: Duration) -> Result<u64, LinkError> {
        let (tx, rx) = oneshot::channel();
        let index = self.open_circuit(target, target_hub, info, setup_timeout, Some(tx)).await?;

        match timeout(setup_timeout, rx).await {
            Ok(Ok(Ok(_credits))) => Ok(index),
            Ok(Ok(Err(e))) => Err(e),
            // the waiter is dropped when the circuit is closed, either by the peer or with the link
            Ok(Err(_)) => match self.hub_addr() {
                Some(_) => Err(LinkError::CircuitClosed),
                None => Err(LinkError::NotConnected),
            },
            Err(_) => {
                let _ = self.close_virtual_connection(index).await;
                Err(LinkError::Timeout)
            }
        }
    }

    async fn open_circuit(&self, target: NodeAddr, target_hub: Option<NodeAddr>, info: &str, setup_timeout: Duration, waiter: Option<oneshot::Sender<SetupResult>>) -> Result<u64, LinkError> {
        let hub = self.hub_addr().ok_or(LinkError::NotConnected)?;
        let index = self.allocator.next_id();
        self.circuits.lock().await
            .insert(index, Arc::new(Circuit::new_requester(index, waiter)));

        let request = Frame::CreateVirtual(CreateVirtualData {
            index,
            source: self.config.local_addr,
            source_hub: hub,
            target,
            target_hub,
            info: info.to_string(),
            timeout_millis: u64::try_from(setup_timeout.as_millis()).unwrap_or(u64::MAX),
            buffer_size: self.config.receive_credits,
            hops_left: 0,
        });
        if let Err(e) = self.send_frame(&request).await {
            self.remove_circuit(index).await;
            return Err(e);
        }
        Ok(index)
    }

    /// Accepts a connection request reported through `on_connect`.
    pub async fn ack_virtual_connection(&self, index: u64) -> Result<(), LinkError> {
        match self.circuit(index).await {
            Some(c) if c.role == CircuitRole::Acceptor && !c.is_established() => {}
            _ => return Err(LinkError::UnknownCircuit(index)),
        }
        self.send_frame(&Frame::CreateVirtualAck { index, credits: self.config.receive_credits }).await
    }

    pub async fn nack_virtual_connection(&self, index: u64, reason: NackReason) -> Result<(), LinkError> {
        let circuit = self.remove_circuit(index).await
            .ok_or(LinkError::UnknownCircuit(index))?;
        circuit.close().await;
        self.send_frame(&Frame::CreateVirtualNack { index, reason }).await
    }

    /// Closing a virtual connection that is already closed is a no-op.
    pub async fn close_virtual_connection(&self, index: u64) -> Result<(), LinkError> {
        let Some(circuit) = self.remove_circuit(index).await
        else {
            return Ok(());
        };
        circuit.close().await;
        self.send_frame(&Frame::CloseVirtual { index }).await
    }

    /// Sends a data frame, waiting for a send credit if the peer has not acknowledged enough of
    ///  the previous frames.
    pub async fn send_virtual_message(&self, index: u64, data: Bytes) -> Result<(), LinkError> {
        let circuit = self.circuit(index).await
            .ok_or(LinkError::UnknownCircuit(index))?;
        if !circuit.is_established() {
            return Err(LinkError::NotEstablished(index));
        }

        circuit.acquire_credit().await?;
        self.send_frame(&Frame::MessageVirtual { index, data }).await
    }

    /// Returns `credits` send credits to the peer after consuming its data.
    pub async fn ack_virtual_message(&self, index: u64, credits: u32) -> Result<(), LinkError> {
        if self.circuit(index).await.is_none() {
            return Err(LinkError::UnknownCircuit(index));
        }
        self.send_frame(&Frame::MessageVirtualAck { index, credits }).await
    }

    pub async fn available_credits(&self, index: u64) -> Option<usize> {
        self.circuit(index).await
            .map(|c| c.available_credits())
    }
}

fn parse_entries<T: FromStr<Err = anyhow::Error>>(entries: Vec<String>) -> Result<Vec<T>, LinkError> {
    entries.iter()
        .map(|s| T::from_str(s).map_err(|e| LinkError::Protocol(format!("invalid entry {:?}: {}", s, e))))
        .collect()
}

#[cfg(test)]
mod test {
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    use crate::service_link::callback::{MockClientMessageHandler, MockVirtualConnectionCallback};
    use crate::protocol::framing::DEFAULT_MAX_FRAME_LEN;
    use crate::test_util::connection::TestFrameReader;
    use crate::test_util::node::test_node_addr_from_number;
    use super::*;

    const HUB: u16 = 900;

    fn link_config(hub: SocketAddr) -> ServiceLinkConfig {
        let mut config = ServiceLinkConfig::new(test_node_addr_from_number(1), vec![hub]);
        config.initial_backoff = Duration::from_millis(10);
        config.max_backoff = Duration::from_millis(50);
        config.default_timeout = Duration::from_secs(5);
        config
    }

    /// a link with a session that is not backed by a socket: frames the link sends arrive at the
    ///  returned reader, and tests feed inbound frames to `on_frame` directly
    async fn detached_link() -> (Arc<ServiceLink>, TestFrameReader) {
        let link = ServiceLink::new(link_config("127.0.0.1:1".parse().unwrap()));
        let (local, remote) = duplex(64*1024);
        let writer: BoxedWriter = Box::new(local);
        *link.writer.lock().await = Some(FrameWriter::new(writer, DEFAULT_MAX_FRAME_LEN));
        link.state.send_replace(LinkState::Connected(test_node_addr_from_number(HUB)));
        (link, FrameReader::new(remote, DEFAULT_MAX_FRAME_LEN))
    }

    fn create_request(index: u64) -> Frame {
        Frame::CreateVirtual(CreateVirtualData {
            index,
            source: test_node_addr_from_number(5),
            source_hub: test_node_addr_from_number(HUB),
            target: test_node_addr_from_number(1),
            target_hub: None,
            info: "svc".to_string(),
            timeout_millis: 1000,
            buffer_size: 4,
            hops_left: 3,
        })
    }

    async fn next_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Frame {
        timeout(Duration::from_secs(5), reader.read_frame()).await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_inbound_request_without_callback_is_nacked() {
        let (link, mut hub) = detached_link().await;
        link.on_frame(create_request(2)).await.unwrap();
        assert_eq!(next_frame(&mut hub).await, Frame::CreateVirtualNack { index: 2, reason: NackReason::NoCallback });
        assert!(link.circuit(2).await.is_none());
    }

    #[tokio::test]
    async fn test_inbound_request_accepted() {
        let (link, mut hub) = detached_link().await;

        let mut callback = MockVirtualConnectionCallback::new();
        callback.expect_on_connect()
            .withf(|index, source, info, timeout, credits| *index == 2
                && *source == test_node_addr_from_number(5)
                && info == "svc"
                && *timeout == Duration::from_secs(1)
                && *credits == 4)
            .times(1)
            .return_const(());
        callback.expect_on_connect_ack_ack()
            .withf(|index, success| *index == 2 && *success)
            .times(1)
            .return_const(());
        link.register_callback(Arc::new(callback)).await.unwrap();

        link.on_frame(create_request(2)).await.unwrap();
        assert!(matches!(link.send_virtual_message(2, Bytes::from_static(b"x")).await, Err(LinkError::NotEstablished(2))));

        link.ack_virtual_connection(2).await.unwrap();
        assert_eq!(next_frame(&mut hub).await, Frame::CreateVirtualAck { index: 2, credits: 16 });
        assert_eq!(link.available_credits(2).await, Some(0));

        link.on_frame(Frame::CreateVirtualAckAck { index: 2, success: true }).await.unwrap();
        assert_eq!(link.available_credits(2).await, Some(4));
    }

    #[tokio::test]
    async fn test_inbound_request_abandoned_by_requester() {
        let (link, _hub) = detached_link().await;

        let mut callback = MockVirtualConnectionCallback::new();
        callback.expect_on_connect().times(1).return_const(());
        callback.expect_on_connect_ack_ack()
            .withf(|index, success| *index == 2 && !*success)
            .times(1)
            .return_const(());
        link.register_callback(Arc::new(callback)).await.unwrap();

        link.on_frame(create_request(2)).await.unwrap();
        link.on_frame(Frame::CreateVirtualAckAck { index: 2, success: false }).await.unwrap();
        assert!(link.circuit(2).await.is_none());
    }

    #[tokio::test]
    async fn test_second_callback_is_rejected() {
        let (link, _hub) = detached_link().await;
        link.register_callback(Arc::new(MockVirtualConnectionCallback::new())).await.unwrap();
        assert!(matches!(
            link.register_callback(Arc::new(MockVirtualConnectionCallback::new())).await,
            Err(LinkError::CallbackAlreadyRegistered)
        ));

        assert!(link.unregister_callback().await);
        assert!(!link.unregister_callback().await);
        link.register_callback(Arc::new(MockVirtualConnectionCallback::new())).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_circuits() {
        let (link, mut hub) = detached_link().await;

        let mut callback = MockVirtualConnectionCallback::new();
        callback.expect_on_disconnect().never();
        callback.expect_on_message().never();
        callback.expect_on_message_ack().never();
        callback.expect_on_connect_nack().never();
        link.register_callback(Arc::new(callback)).await.unwrap();

        link.on_frame(Frame::CloseVirtual { index: 99 }).await.unwrap();
        link.on_frame(Frame::CreateVirtualNack { index: 99, reason: NackReason::UnknownHost }).await.unwrap();
        link.on_frame(Frame::MessageVirtualAck { index: 99, credits: 1 }).await.unwrap();

        link.on_frame(Frame::MessageVirtual { index: 7, data: Bytes::from_static(b"abc") }).await.unwrap();
        assert_eq!(next_frame(&mut hub).await, Frame::CloseVirtual { index: 7 });

        link.on_frame(Frame::CreateVirtualAck { index: 9, credits: 3 }).await.unwrap();
        assert_eq!(next_frame(&mut hub).await, Frame::CreateVirtualAckAck { index: 9, success: false });

        assert!(matches!(link.send_virtual_message(9, Bytes::new()).await, Err(LinkError::UnknownCircuit(9))));
        assert!(matches!(link.ack_virtual_message(9, 1).await, Err(LinkError::UnknownCircuit(9))));
        assert!(link.close_virtual_connection(9).await.is_ok());
    }

    #[tokio::test]
    async fn test_outbound_connection_with_credits() {
        let (link, mut hub) = detached_link().await;

        let mut callback = MockVirtualConnectionCallback::new();
        callback.expect_on_connect_ack()
            .withf(|index, credits| *index == 1 && *credits == 1)
            .times(1)
            .return_const(());
        callback.expect_on_message_ack().times(1).return_const(());
        link.register_callback(Arc::new(callback)).await.unwrap();

        let index = link.create_virtual_connection(test_node_addr_from_number(5), None, "svc", Duration::from_secs(1)).await.unwrap();
        assert_eq!(index, 1);
        match next_frame(&mut hub).await {
            Frame::CreateVirtual(data) => {
                assert_eq!(data.index, 1);
                assert_eq!(data.source, test_node_addr_from_number(1));
                assert_eq!(data.source_hub, test_node_addr_from_number(HUB));
                assert_eq!(data.target, test_node_addr_from_number(5));
                assert_eq!(data.buffer_size, 16);
            }
            other => panic!("unexpected {:?}", other),
        }

        link.on_frame(Frame::CreateVirtualAck { index: 1, credits: 1 }).await.unwrap();
        assert_eq!(next_frame(&mut hub).await, Frame::CreateVirtualAckAck { index: 1, success: true });

        link.send_virtual_message(1, Bytes::from_static(b"first")).await.unwrap();
        assert_eq!(next_frame(&mut hub).await, Frame::MessageVirtual { index: 1, data: Bytes::from_static(b"first") });

        // no credits left: the second send blocks until the peer acknowledges
        let l = link.clone();
        let second = tokio::spawn(async move { l.send_virtual_message(1, Bytes::from_static(b"second")).await });
        sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        link.on_frame(Frame::MessageVirtualAck { index: 1, credits: 1 }).await.unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(next_frame(&mut hub).await, Frame::MessageVirtual { index: 1, data: Bytes::from_static(b"second") });
    }

    #[tokio::test]
    async fn test_connect_virtual_refused() {
        let (link, mut hub) = detached_link().await;

        let l = link.clone();
        let connect = tokio::spawn(async move {
            l.connect_virtual(test_node_addr_from_number(5), None, "svc", Duration::from_secs(5)).await
        });
        let index = match next_frame(&mut hub).await {
            Frame::CreateVirtual(data) => data.index,
            other => panic!("unexpected {:?}", other),
        };

        link.on_frame(Frame::CreateVirtualNack { index, reason: NackReason::UnknownHost }).await.unwrap();
        assert!(matches!(connect.await.unwrap(), Err(LinkError::Refused(NackReason::UnknownHost))));
        assert!(link.circuit(index).await.is_none());
    }

    #[tokio::test]
    async fn test_connect_virtual_timeout_closes() {
        let (link, mut hub) = detached_link().await;

        let l = link.clone();
        let connect = tokio::spawn(async move {
            l.connect_virtual(test_node_addr_from_number(5), None, "svc", Duration::from_millis(50)).await
        });
        let index = match next_frame(&mut hub).await {
            Frame::CreateVirtual(data) => data.index,
            other => panic!("unexpected {:?}", other),
        };

        assert!(matches!(connect.await.unwrap(), Err(LinkError::Timeout)));
        assert_eq!(next_frame(&mut hub).await, Frame::CloseVirtual { index });
    }

    #[tokio::test]
    async fn test_connect_virtual_unbounded_setup_timeout() {
        let (link, mut hub) = detached_link().await;

        let l = link.clone();
        let connect = tokio::spawn(async move {
            l.connect_virtual(test_node_addr_from_number(5), None, "svc", Duration::MAX).await
        });
        let index = match next_frame(&mut hub).await {
            Frame::CreateVirtual(data) => {
                assert_eq!(data.timeout_millis, u64::MAX);
                data.index
            }
            other => panic!("unexpected {:?}", other),
        };

        link.on_frame(Frame::CreateVirtualNack { index, reason: NackReason::ServerOverload }).await.unwrap();
        assert!(matches!(connect.await.unwrap(), Err(LinkError::Refused(NackReason::ServerOverload))));
    }

    #[tokio::test]
    async fn test_connect_virtual_closed_during_setup() {
        let (link, mut hub) = detached_link().await;

        let l = link.clone();
        let connect = tokio::spawn(async move {
            l.connect_virtual(test_node_addr_from_number(5), None, "svc", Duration::from_secs(5)).await
        });
        let index = match next_frame(&mut hub).await {
            Frame::CreateVirtual(data) => data.index,
            other => panic!("unexpected {:?}", other),
        };

        link.on_frame(Frame::CloseVirtual { index }).await.unwrap();
        assert!(matches!(connect.await.unwrap(), Err(LinkError::CircuitClosed)));
        assert_eq!(link.state(), LinkState::Connected(test_node_addr_from_number(HUB)));
        assert!(link.circuit(index).await.is_none());
    }

    #[tokio::test]
    async fn test_data_without_callback_closes_circuit() {
        let (link, mut hub) = detached_link().await;

        let mut callback = MockVirtualConnectionCallback::new();
        callback.expect_on_connect().times(1).return_const(());
        callback.expect_on_connect_ack_ack().times(1).return_const(());
        link.register_callback(Arc::new(callback)).await.unwrap();

        link.on_frame(create_request(2)).await.unwrap();
        link.ack_virtual_connection(2).await.unwrap();
        assert_eq!(next_frame(&mut hub).await, Frame::CreateVirtualAck { index: 2, credits: 16 });
        link.on_frame(Frame::CreateVirtualAckAck { index: 2, success: true }).await.unwrap();

        assert!(link.unregister_callback().await);
        link.on_frame(Frame::MessageVirtual { index: 2, data: Bytes::from_static(b"abc") }).await.unwrap();

        assert_eq!(next_frame(&mut hub).await, Frame::CloseVirtual { index: 2 });
        assert!(link.circuit(2).await.is_none());
        assert!(matches!(link.send_virtual_message(2, Bytes::new()).await, Err(LinkError::UnknownCircuit(2))));
    }

    #[tokio::test]
    async fn test_link_loss_disconnects_circuits() {
        let (link, _hub) = detached_link().await;

        let mut callback = MockVirtualConnectionCallback::new();
        callback.expect_on_connect().return_const(());
        callback.expect_on_disconnect().times(2).return_const(());
        link.register_callback(Arc::new(callback)).await.unwrap();

        link.on_frame(create_request(2)).await.unwrap();
        link.create_virtual_connection(test_node_addr_from_number(5), None, "svc", Duration::from_secs(1)).await.unwrap();

        let (_, pending) = link.replies.register().await;
        link.on_link_lost().await;

        assert!(link.circuits.lock().await.is_empty());
        assert!(pending.await.is_err());
    }

    #[tokio::test]
    async fn test_module_dispatch() {
        let (link, _hub) = detached_link().await;

        let mut handler = MockClientMessageHandler::new();
        handler.expect_on_message()
            .withf(|msg| msg.opcode == 3 && msg.payload.as_ref() == b"hi")
            .times(1)
            .return_const(());
        link.register_module("chat", Arc::new(handler)).await.unwrap();
        assert!(matches!(
            link.register_module("chat", Arc::new(MockClientMessageHandler::new())).await,
            Err(LinkError::ModuleAlreadyRegistered(_))
        ));

        let msg = |module: &str| ClientMessage::new(
            test_node_addr_from_number(5),
            test_node_addr_from_number(HUB),
            test_node_addr_from_number(1),
            None,
            module,
            3,
            Bytes::from_static(b"hi"),
        );
        link.on_frame(Frame::Message(msg("chat"))).await.unwrap();
        link.on_frame(Frame::Message(msg("other"))).await.unwrap();

        assert!(link.deregister_module("chat").await);
        assert!(!link.deregister_module("chat").await);
    }

    #[tokio::test]
    async fn test_send_message() {
        let (link, mut hub) = detached_link().await;
        link.send_message(test_node_addr_from_number(5), None, "chat", 3, Bytes::from_static(b"hi")).await.unwrap();

        match next_frame(&mut hub).await {
            Frame::Message(msg) => {
                assert_eq!(msg.source, test_node_addr_from_number(1));
                assert_eq!(msg.source_hub, test_node_addr_from_number(HUB));
                assert_eq!(msg.target, test_node_addr_from_number(5));
                assert_eq!(msg.module, "chat");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_frame_ends_session() {
        let (link, _hub) = detached_link().await;
        assert!(link.on_frame(Frame::Disconnect).await.is_err());
        assert!(link.on_frame(Frame::Hubs { request_id: 1 }).await.is_err());
        assert!(link.on_frame(Frame::Ping).await.is_ok());
    }

    struct FakeHub {
        reader: FrameReader<BoxedReader>,
        writer: FrameWriter<BoxedWriter>,
    }

    impl FakeHub {
        async fn accept(listener: &TcpListener) -> FakeHub {
            let (stream, _) = timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
            let (read_half, write_half) = stream.into_split();
            let reader: BoxedReader = Box::new(read_half);
            let writer: BoxedWriter = Box::new(write_half);
            let mut hub = FakeHub {
                reader: FrameReader::new(reader, DEFAULT_MAX_FRAME_LEN),
                writer: FrameWriter::new(writer, DEFAULT_MAX_FRAME_LEN),
            };

            assert_eq!(next_frame(&mut hub.reader).await, Frame::ServiceLinkConnect { client: test_node_addr_from_number(1) });
            hub.writer.write_frame(&Frame::ConnectionAccepted { hub: test_node_addr_from_number(HUB) }).await.unwrap();
            hub
        }
    }

    #[tokio::test]
    async fn test_request_reply_and_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let link = ServiceLink::start(link_config(listener.local_addr().unwrap())).unwrap();

        let mut hub = FakeHub::accept(&listener).await;
        assert_eq!(link.wait_connected(Duration::from_secs(5)).await.unwrap(), test_node_addr_from_number(HUB));

        let l = link.clone();
        let request = tokio::spawn(async move { l.hubs(None).await });
        let request_id = match next_frame(&mut hub.reader).await {
            Frame::Hubs { request_id } => request_id,
            other => panic!("unexpected {:?}", other),
        };
        hub.writer.write_frame(&Frame::InfoReply {
            request_id,
            entries: vec![test_node_addr_from_number(HUB).to_string(), test_node_addr_from_number(901).to_string()],
        }).await.unwrap();
        assert_eq!(request.await.unwrap().unwrap(), vec![test_node_addr_from_number(HUB), test_node_addr_from_number(901)]);

        // a pending request fails when the session ends, and the link reconnects
        let l = link.clone();
        let request = tokio::spawn(async move { l.register_property("role", "db", None).await });
        assert!(matches!(next_frame(&mut hub.reader).await, Frame::RegisterProperty { .. }));
        drop(hub);
        assert!(matches!(request.await.unwrap(), Err(LinkError::NotConnected)));

        let mut hub = FakeHub::accept(&listener).await;
        link.wait_connected(Duration::from_secs(5)).await.unwrap();

        link.shutdown().await;
        assert_eq!(next_frame(&mut hub.reader).await, Frame::Disconnect);
    }

    #[tokio::test]
    async fn test_request_without_hub() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);

        let link = ServiceLink::start(link_config(addr)).unwrap();
        assert!(matches!(link.hubs(Some(Duration::from_millis(100))).await, Err(LinkError::NotConnected)));
        assert!(matches!(
            link.create_virtual_connection(test_node_addr_from_number(5), None, "svc", Duration::from_secs(1)).await,
            Err(LinkError::NotConnected)
        ));
        link.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);

        let mut config = link_config(addr);
        config.max_retry_time = Some(Duration::from_millis(30));
        let link = ServiceLink::start(config).unwrap();

        assert!(matches!(link.wait_connected(Duration::from_secs(5)).await, Err(LinkError::Failed)));
        assert_eq!(link.state(), LinkState::Failed);
    }
}
