use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::node_addr::NodeAddr;
use crate::util::buf::{BufExt, BufMutExt};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Direction {
    Forward = 0,
    ReturnToSender = 1,
}

/// Control-plane envelope for application messages between clients. Envelopes are never
///  modified in place: every routing step (assigning a hop budget, taking a hop, bouncing back
///  to the sender) produces a new envelope, and bouncing is only possible for an envelope that
///  travels in [Direction::Forward].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientMessage {
    pub source: NodeAddr,
    pub source_hub: NodeAddr,
    pub target: NodeAddr,
    pub target_hub: Option<NodeAddr>,
    pub hops_left: u32,
    pub direction: Direction,
    pub module: String,
    pub opcode: u32,
    pub payload: Bytes,
}

impl ClientMessage {
    pub fn new(
        source: NodeAddr,
        source_hub: NodeAddr,
        target: NodeAddr,
        target_hub: Option<NodeAddr>,
        module: &str,
        opcode: u32,
        payload: Bytes,
    ) -> ClientMessage {
        ClientMessage {
            source,
            source_hub,
            target,
            target_hub,
            hops_left: 0,
            direction: Direction::Forward,
            module: module.to_string(),
            opcode,
            payload,
        }
    }

    pub fn is_returned(&self) -> bool {
        self.direction == Direction::ReturnToSender
    }

    /// The client (and its hub, if known) this envelope currently travels toward: the target
    ///  on the way there, the source on the way back.
    pub fn destination(&self) -> (NodeAddr, Option<NodeAddr>) {
        match self.direction {
            Direction::Forward => (self.target, self.target_hub),
            Direction::ReturnToSender => (self.source, Some(self.source_hub)),
        }
    }

    pub fn with_hop_budget(&self, hops: u32) -> ClientMessage {
        ClientMessage {
            hops_left: hops,
            ..self.clone()
        }
    }

    /// returns the envelope as it continues after one more hop, or `None` if its hop budget is
    ///  used up
    pub fn next_hop(&self) -> Option<ClientMessage> {
        let hops_left = self.hops_left.checked_sub(1)?;
        Some(ClientMessage {
            hops_left,
            ..self.clone()
        })
    }

    /// returns the envelope redirected toward its sender, or `None` if it is already on its way
    ///  back - an envelope bounces at most once
    pub fn bounced(&self) -> Option<ClientMessage> {
        match self.direction {
            Direction::Forward => Some(ClientMessage {
                direction: Direction::ReturnToSender,
                ..self.clone()
            }),
            Direction::ReturnToSender => None,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
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
        buf.put_u32(self.hops_left);
        buf.put_u8(self.direction.into());
        buf.put_string(&self.module);
        buf.put_u32(self.opcode);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ClientMessage> {
        let source = NodeAddr::try_deser(buf)?;
        let source_hub = NodeAddr::try_deser(buf)?;
        let target = NodeAddr::try_deser(buf)?;
        let target_hub = if buf.try_get_bool()? {
            Some(NodeAddr::try_deser(buf)?)
        }
        else {
            None
        };
        let hops_left = buf.try_get_u32()?;
        let direction = Direction::try_from_primitive(buf.try_get_u8()?)?;
        let module = buf.try_get_string()?;
        let opcode = buf.try_get_u32()?;
        let len = buf.try_get_u32()? as usize;
        let payload = buf.try_get_bytes(len)?;

        Ok(ClientMessage {
            source,
            source_hub,
            target,
            target_hub,
            hops_left,
            direction,
            module,
            opcode,
            payload,
        })
    }
}

#[cfg(test)]
mod test {
    use crate::test_util::node::test_node_addr_from_number;
    use super::*;

    fn message() -> ClientMessage {
        ClientMessage::new(
            test_node_addr_from_number(1),
            test_node_addr_from_number(101),
            test_node_addr_from_number(2),
            Some(test_node_addr_from_number(102)),
            "chat",
            7,
            Bytes::from_static(b"hello"),
        )
    }

    #[test]
    fn test_destination() {
        let msg = message();
        assert_eq!(msg.destination(), (test_node_addr_from_number(2), Some(test_node_addr_from_number(102))));

        let bounced = msg.bounced().unwrap();
        assert_eq!(bounced.destination(), (test_node_addr_from_number(1), Some(test_node_addr_from_number(101))));
        assert!(bounced.is_returned());
    }

    #[test]
    fn test_bounces_at_most_once() {
        let bounced = message().bounced().unwrap();
        assert!(bounced.bounced().is_none());
    }

    #[test]
    fn test_bounce_leaves_original_untouched() {
        let msg = message();
        let _ = msg.bounced();
        assert_eq!(msg.direction, Direction::Forward);
    }

    #[test]
    fn test_next_hop() {
        let msg = message().with_hop_budget(2);
        let msg = msg.next_hop().unwrap();
        assert_eq!(msg.hops_left, 1);
        let msg = msg.next_hop().unwrap();
        assert_eq!(msg.hops_left, 0);
        assert!(msg.next_hop().is_none());
    }

    #[test]
    fn test_deser_truncated_payload() {
        let mut buf = bytes::BytesMut::new();
        message().ser(&mut buf);
        buf.truncate(buf.len() - 1);
        let mut b: &[u8] = &buf;
        assert!(ClientMessage::try_deser(&mut b).is_err());
    }
}
