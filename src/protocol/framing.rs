use std::io::ErrorKind;

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::protocol::frame::Frame;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16*1024*1024;

/// Reads `[len:u32][opcode][fields]` frames from a byte stream.
pub struct FrameReader<R> {
    reader: R,
    max_frame_len: usize,
}

impl <R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_len: usize) -> FrameReader<R> {
        FrameReader {
            reader,
            max_frame_len,
        }
    }

    /// returns `None` if the peer closed the stream cleanly at a frame boundary
    pub async fn read_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        let frame_len = match self.reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if frame_len > self.max_frame_len {
            bail!("received a frame that was longer than the configured maximum ({} > {}) - closing connection", frame_len, self.max_frame_len);
        }

        let mut buf = vec![0u8; frame_len];
        self.reader.read_exact(&mut buf).await?;

        let frame = Frame::try_deser(&mut buf.as_slice())?;
        trace!("received {:?}", frame.opcode());
        Ok(Some(frame))
    }
}

/// Writes frames to a byte stream. Callers that share a writer between tasks wrap it in a
///  mutex so that frames are never interleaved.
pub struct FrameWriter<W> {
    writer: W,
    max_frame_len: usize,
    buf: BytesMut,
}

impl <W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, max_frame_len: usize) -> FrameWriter<W> {
        FrameWriter {
            writer,
            max_frame_len,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.buf.clear();
        self.buf.put_u32(0);
        frame.ser(&mut self.buf);

        let frame_len = self.buf.len() - 4;
        if frame_len > self.max_frame_len {
            bail!("frame longer than configured max length: {} > {}", frame_len, self.max_frame_len);
        }
        self.buf[..4].copy_from_slice(&(frame_len as u32).to_be_bytes());

        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        trace!("sent {:?}", frame.opcode());
        Ok(())
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
