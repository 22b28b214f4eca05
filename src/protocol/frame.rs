use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::TryFromPrimitive;

use crate::hub::gossip::GossipEntry;
use crate::node_addr::NodeAddr;
use crate::protocol::client_message::ClientMessage;
use crate::protocol::opcodes::{NackReason, Opcode, PropertyAckStatus};
use crate::util::buf::{BufExt, BufMutExt};

/// Request to set up a virtual connection, relayed hop by hop from the requesting client toward
///  the target. `index` is the circuit id on the link the frame travels over, so every relaying
///  hub replaces it with an id allocated on its outgoing link.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CreateVirtualData {
    pub index: u64,
    pub source: NodeAddr,
    pub source_hub: NodeAddr,
    pub target: NodeAddr,
    pub target_hub: Option<NodeAddr>,
    pub info: String,
    pub timeout_millis: u64,
    pub buffer_size: u32,
    pub hops_left: u32,
}

impl CreateVirtualData {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.index);
        self.source.ser(buf);
        self.source_hub.ser(buf);
        self.target.ser(buf);
        match &self.target_hub {
            Some(hub) => {
                buf.put_bool(true);
                hub.ser(buf);
            }
            None => buf.put_bool(false),
        }
        buf.put_string(&self.info);
        buf.put_u64(self.timeout_millis);
        buf.put_u32(self.buffer_size);
        buf.put_u32(self.hops_left);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CreateVirtualData> {
        let index = buf.try_get_u64()?;
        let source = NodeAddr::try_deser(buf)?;
        let source_hub = NodeAddr::try_deser(buf)?;
        let target = NodeAddr::try_deser(buf)?;
        let target_hub = if buf.try_get_bool()? {
            Some(NodeAddr::try_deser(buf)?)
        }
        else {
            None
        };

        Ok(CreateVirtualData {
            index,
            source,
            source_hub,
            target,
            target_hub,
            info: buf.try_get_string()?,
            timeout_millis: buf.try_get_u64()?,
            buffer_size: buf.try_get_u32()?,
            hops_left: buf.try_get_u32()?,
        })
    }
}

/// Everything that can travel over a physical connection, hub<->hub as well as client<->hub.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    ServiceLinkConnect { client: NodeAddr },
    HubConnect { hub: NodeAddr, name: String, color: String },
    ConnectionAccepted { hub: NodeAddr },
    ConnectionDenied { reason: String },
    Disconnect,

    Gossip(Vec<GossipEntry>),
    Ping,

    CreateVirtual(CreateVirtualData),
    CreateVirtualAck { index: u64, credits: u32 },
    CreateVirtualNack { index: u64, reason: NackReason },
    CreateVirtualAckAck { index: u64, success: bool },
    CloseVirtual { index: u64 },
    MessageVirtual { index: u64, data: Bytes },
    MessageVirtualAck { index: u64, credits: u32 },

    Message(ClientMessage),
    RegisterProperty { request_id: u32, tag: String, value: String },
    UpdateProperty { request_id: u32, tag: String, value: String },
    RemoveProperty { request_id: u32, tag: String },
    PropertyAck { request_id: u32, status: PropertyAckStatus },
    Hubs { request_id: u32 },
    HubDetails { request_id: u32 },
    ClientsForHub { request_id: u32, hub: NodeAddr, tag: String },
    AllClients { request_id: u32, tag: String },
    Direction { request_id: u32, client: NodeAddr },
    InfoReply { request_id: u32, entries: Vec<String> },
}

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::ServiceLinkConnect { .. } => Opcode::ServiceLinkConnect,
            Frame::HubConnect { .. } => Opcode::HubConnect,
            Frame::ConnectionAccepted { .. } => Opcode::ConnectionAccepted,
            Frame::ConnectionDenied { .. } => Opcode::ConnectionDenied,
            Frame::Disconnect => Opcode::Disconnect,
            Frame::Gossip(_) => Opcode::Gossip,
            Frame::Ping => Opcode::Ping,
            Frame::CreateVirtual(_) => Opcode::CreateVirtual,
            Frame::CreateVirtualAck { .. } => Opcode::CreateVirtualAck,
            Frame::CreateVirtualNack { .. } => Opcode::CreateVirtualNack,
            Frame::CreateVirtualAckAck { .. } => Opcode::CreateVirtualAckAck,
            Frame::CloseVirtual { .. } => Opcode::CloseVirtual,
            Frame::MessageVirtual { .. } => Opcode::MessageVirtual,
            Frame::MessageVirtualAck { .. } => Opcode::MessageVirtualAck,
            Frame::Message(_) => Opcode::Message,
            Frame::RegisterProperty { .. } => Opcode::RegisterProperty,
            Frame::UpdateProperty { .. } => Opcode::UpdateProperty,
            Frame::RemoveProperty { .. } => Opcode::RemoveProperty,
            Frame::PropertyAck { .. } => Opcode::PropertyAck,
            Frame::Hubs { .. } => Opcode::Hubs,
            Frame::HubDetails { .. } => Opcode::HubDetails,
            Frame::ClientsForHub { .. } => Opcode::ClientsForHub,
            Frame::AllClients { .. } => Opcode::AllClients,
            Frame::Direction { .. } => Opcode::Direction,
            Frame::InfoReply { .. } => Opcode::InfoReply,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode().into());
        match self {
            Frame::ServiceLinkConnect { client } => client.ser(buf),
            Frame::HubConnect { hub, name, color } => {
                hub.ser(buf);
                buf.put_string(name);
                buf.put_string(color);
            }
            Frame::ConnectionAccepted { hub } => hub.ser(buf),
            Frame::ConnectionDenied { reason } => buf.put_string(reason),
            Frame::Disconnect => {}
            Frame::Gossip(entries) => {
                buf.put_usize_varint(entries.len());
                for entry in entries {
                    entry.ser(buf);
                }
            }
            Frame::Ping => {}
            Frame::CreateVirtual(data) => data.ser(buf),
            Frame::CreateVirtualAck { index, credits } => {
                buf.put_u64(*index);
                buf.put_u32(*credits);
            }
            Frame::CreateVirtualNack { index, reason } => {
                buf.put_u64(*index);
                buf.put_u8((*reason).into());
            }
            Frame::CreateVirtualAckAck { index, success } => {
                buf.put_u64(*index);
                buf.put_bool(*success);
            }
            Frame::CloseVirtual { index } => buf.put_u64(*index),
            Frame::MessageVirtual { index, data } => {
                buf.put_u64(*index);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Frame::MessageVirtualAck { index, credits } => {
                buf.put_u64(*index);
                buf.put_u32(*credits);
            }
            Frame::Message(msg) => msg.ser(buf),
            Frame::RegisterProperty { request_id, tag, value } |
            Frame::UpdateProperty { request_id, tag, value } => {
                buf.put_u32(*request_id);
                buf.put_string(tag);
                buf.put_string(value);
            }
            Frame::RemoveProperty { request_id, tag } => {
                buf.put_u32(*request_id);
                buf.put_string(tag);
            }
            Frame::PropertyAck { request_id, status } => {
                buf.put_u32(*request_id);
                buf.put_u8((*status).into());
            }
            Frame::Hubs { request_id } |
            Frame::HubDetails { request_id } => buf.put_u32(*request_id),
            Frame::ClientsForHub { request_id, hub, tag } => {
                buf.put_u32(*request_id);
                hub.ser(buf);
                buf.put_string(tag);
            }
            Frame::AllClients { request_id, tag } => {
                buf.put_u32(*request_id);
                buf.put_string(tag);
            }
            Frame::Direction { request_id, client } => {
                buf.put_u32(*request_id);
                client.ser(buf);
            }
            Frame::InfoReply { request_id, entries } => {
                buf.put_u32(*request_id);
                buf.put_string_list(entries);
            }
        }
    }

    /// Decodes a single frame, requiring the buffer to be consumed completely: trailing bytes
    ///  mean the peer and we disagree about the layout, which is a protocol violation.
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let raw_opcode = buf.try_get_u8()?;
        let opcode = Opcode::try_from_primitive(raw_opcode)
            .map_err(|_| anyhow!("unknown opcode {}", raw_opcode))?;

        let frame = match opcode {
            Opcode::ServiceLinkConnect => Frame::ServiceLinkConnect { client: NodeAddr::try_deser(buf)? },
            Opcode::HubConnect => Frame::HubConnect {
                hub: NodeAddr::try_deser(buf)?,
                name: buf.try_get_string()?,
                color: buf.try_get_string()?,
            },
            Opcode::ConnectionAccepted => Frame::ConnectionAccepted { hub: NodeAddr::try_deser(buf)? },
            Opcode::ConnectionDenied => Frame::ConnectionDenied { reason: buf.try_get_string()? },
            Opcode::Disconnect => Frame::Disconnect,
            Opcode::Gossip => {
                let num_entries = buf.try_get_usize_varint()?;
                let mut entries = Vec::with_capacity(num_entries.min(256));
                for _ in 0..num_entries {
                    entries.push(GossipEntry::try_deser(buf)?);
                }
                Frame::Gossip(entries)
            }
            Opcode::Ping => Frame::Ping,
            Opcode::CreateVirtual => Frame::CreateVirtual(CreateVirtualData::try_deser(buf)?),
            Opcode::CreateVirtualAck => Frame::CreateVirtualAck {
                index: buf.try_get_u64()?,
                credits: buf.try_get_u32()?,
            },
            Opcode::CreateVirtualNack => {
                let index = buf.try_get_u64()?;
                let raw_reason = buf.try_get_u8()?;
                let reason = NackReason::try_from_primitive(raw_reason)
                    .map_err(|_| anyhow!("unknown nack reason {}", raw_reason))?;
                Frame::CreateVirtualNack { index, reason }
            }
            Opcode::CreateVirtualAckAck => Frame::CreateVirtualAckAck {
                index: buf.try_get_u64()?,
                success: buf.try_get_bool()?,
            },
            Opcode::CloseVirtual => Frame::CloseVirtual { index: buf.try_get_u64()? },
            Opcode::MessageVirtual => {
                let index = buf.try_get_u64()?;
                let len = buf.try_get_u32()? as usize;
                Frame::MessageVirtual { index, data: buf.try_get_bytes(len)? }
            }
            Opcode::MessageVirtualAck => Frame::MessageVirtualAck {
                index: buf.try_get_u64()?,
                credits: buf.try_get_u32()?,
            },
            Opcode::Message => Frame::Message(ClientMessage::try_deser(buf)?),
            Opcode::RegisterProperty => Frame::RegisterProperty {
                request_id: buf.try_get_u32()?,
                tag: buf.try_get_string()?,
                value: buf.try_get_string()?,
            },
            Opcode::UpdateProperty => Frame::UpdateProperty {
                request_id: buf.try_get_u32()?,
                tag: buf.try_get_string()?,
                value: buf.try_get_string()?,
            },
            Opcode::RemoveProperty => Frame::RemoveProperty {
                request_id: buf.try_get_u32()?,
                tag: buf.try_get_string()?,
            },
            Opcode::PropertyAck => {
                let request_id = buf.try_get_u32()?;
                let raw_status = buf.try_get_u8()?;
                let status = PropertyAckStatus::try_from_primitive(raw_status)
                    .map_err(|_| anyhow!("invalid property ack status {}", raw_status))?;
                Frame::PropertyAck { request_id, status }
            }
            Opcode::Hubs => Frame::Hubs { request_id: buf.try_get_u32()? },
            Opcode::HubDetails => Frame::HubDetails { request_id: buf.try_get_u32()? },
            Opcode::ClientsForHub => Frame::ClientsForHub {
                request_id: buf.try_get_u32()?,
                hub: NodeAddr::try_deser(buf)?,
                tag: buf.try_get_string()?,
            },
            Opcode::AllClients => Frame::AllClients {
                request_id: buf.try_get_u32()?,
                tag: buf.try_get_string()?,
            },
            Opcode::Direction => Frame::Direction {
                request_id: buf.try_get_u32()?,
                client: NodeAddr::try_deser(buf)?,
            },
            Opcode::InfoReply => Frame::InfoReply {
                request_id: buf.try_get_u32()?,
                entries: buf.try_get_string_list()?,
            },
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after {:?} frame", buf.remaining(), opcode));
        }
        Ok(frame)
    }
}
