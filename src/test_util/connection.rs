use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, DuplexStream};

use crate::connection::forwarding::ForwardingConnection;
use crate::connection::{ConnectionId, LinkKind};
use crate::node_addr::NodeAddr;
use crate::protocol::framing::{BoxedWriter, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN};
use crate::test_util::node::test_node_addr_from_number;
use crate::virtual_conn::id_allocator::Parity;

pub type TestFrameReader = FrameReader<DuplexStream>;

/// A connection as the hub side sees it, writing into an in-memory stream instead of a socket.
///  The returned reader sees the frames the connection sends, i.e. it plays the peer.
///
/// Parities are those of the accepting side: client links allocate even ids, hub links odd ones.
pub fn test_connection_to(id: u64, kind: LinkKind, peer: NodeAddr) -> (Arc<ForwardingConnection>, TestFrameReader) {
    test_connection_with_buffer(id, kind, peer, 64*1024, Duration::from_secs(5))
}

/// A connection whose in-memory stream holds only `buffer_size` bytes: writes block as soon as
///  the returned reader falls behind by more than that.
pub fn test_connection_with_buffer(id: u64, kind: LinkKind, peer: NodeAddr, buffer_size: usize, write_timeout: Duration) -> (Arc<ForwardingConnection>, TestFrameReader) {
    let (local, remote) = duplex(buffer_size);
    let writer: BoxedWriter = Box::new(local);
    let parity = match kind {
        LinkKind::Client => Parity::Even,
        LinkKind::Hub => Parity::Odd,
    };

    let conn = ForwardingConnection::new(
        ConnectionId(id),
        kind,
        peer,
        FrameWriter::new(writer, DEFAULT_MAX_FRAME_LEN),
        parity,
        write_timeout,
    );
    (conn, FrameReader::new(remote, DEFAULT_MAX_FRAME_LEN))
}

/// like [test_connection_to], with a peer address derived from the connection id
pub fn test_connection(id: u64, kind: LinkKind) -> (Arc<ForwardingConnection>, TestFrameReader) {
    test_connection_to(id, kind, test_node_addr_from_number(id as u16))
}
