//! Varint length-prefixed framing over any byte stream.
//!
//! Every frame is an unsigned varint byte length followed by that many
//! bytes of protobuf payload. The reader accumulates partial reads until
//! a whole frame is available; end-of-stream inside a frame is a
//! protocol error, end-of-stream between frames is a clean close.

use bytes::{Buf, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::UdfError;

/// Encode and write one length-delimited frame.
pub async fn write_frame<W, M>(writer: &mut W, msg: &M) -> Result<(), UdfError>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let mut buf = Vec::with_capacity(msg.encoded_len() + 10);
    msg.encode_length_delimited(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Try to decode a varint from the front of `buf`.
///
/// Returns `(value, bytes consumed)` when a full varint is present,
/// `None` when more bytes are needed.
fn peek_varint(buf: &[u8]) -> Result<Option<(usize, usize)>, UdfError> {
    let mut value: u64 = 0;
    for (i, b) in buf.iter().take(10).enumerate() {
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((value as usize, i + 1)));
        }
    }
    if buf.len() >= 10 {
        return Err(UdfError::Protocol("length varint too long".into()));
    }
    Ok(None)
}

/// Reads length-delimited frames from a byte stream.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read the next frame. Returns `None` on clean end-of-stream.
    pub async fn read_frame<M: Message + Default>(&mut self) -> Result<Option<M>, UdfError> {
        loop {
            if let Some((len, prefix)) = peek_varint(&self.buf)? {
                if self.buf.len() >= prefix + len {
                    let mut frame = self.buf.split_to(prefix + len);
                    frame.advance(prefix);
                    let msg = M::decode(frame.freeze())?;
                    return Ok(Some(msg));
                }
            }
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(UdfError::Protocol(
                    "stream ended in the middle of a frame".into(),
                ));
            }
        }
    }
}
