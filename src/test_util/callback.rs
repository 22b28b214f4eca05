use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::node_addr::NodeAddr;
use crate::protocol::opcodes::NackReason;
use crate::service_link::callback::VirtualConnectionCallback;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CallbackEvent {
    Connect { index: u64, source: NodeAddr, info: String, credits: u32 },
    ConnectAck { index: u64, credits: u32 },
    ConnectNack { index: u64, reason: NackReason },
    ConnectAckAck { index: u64, success: bool },
    Disconnect { index: u64 },
    Message { index: u64, data: Bytes },
    MessageAck { index: u64, credits: u32 },
}

/// A [VirtualConnectionCallback] that forwards every event into a channel, so tests can await
///  and inspect events in the order they arrived.
pub struct RecordingCallback {
    events: mpsc::UnboundedSender<CallbackEvent>,
}

impl RecordingCallback {
    pub fn new() -> (Arc<RecordingCallback>, mpsc::UnboundedReceiver<CallbackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingCallback { events }), rx)
    }

    fn record(&self, event: CallbackEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl VirtualConnectionCallback for RecordingCallback {
    async fn on_connect(&self, index: u64, source: NodeAddr, info: String, _timeout: Duration, credits: u32) {
        self.record(CallbackEvent::Connect { index, source, info, credits });
    }

    async fn on_connect_ack(&self, index: u64, credits: u32) {
        self.record(CallbackEvent::ConnectAck { index, credits });
    }

    async fn on_connect_nack(&self, index: u64, reason: NackReason) {
        self.record(CallbackEvent::ConnectNack { index, reason });
    }

    async fn on_connect_ack_ack(&self, index: u64, success: bool) {
        self.record(CallbackEvent::ConnectAckAck { index, success });
    }

    async fn on_disconnect(&self, index: u64) {
        self.record(CallbackEvent::Disconnect { index });
    }

    async fn on_message(&self, index: u64, data: Bytes) {
        self.record(CallbackEvent::Message { index, data });
    }

    async fn on_message_ack(&self, index: u64, credits: u32) {
        self.record(CallbackEvent::MessageAck { index, credits });
    }
}

/// waits for the next recorded event, failing after a few seconds
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<CallbackEvent>) -> anyhow::Result<CallbackEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.recv()).await
        .map_err(|_| anyhow!("no callback event within timeout"))?
        .ok_or_else(|| anyhow!("callback was dropped"))
}
