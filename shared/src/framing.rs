//! Length-delimited framing over a byte stream.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.
//! Reads never assume that one socket read holds one message: several frames
//! may arrive together and a single frame may be split across reads.

use crate::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload accepted by default. Game messages are well under 1 KiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Prepends the length prefix to `payload`.
pub fn encode_frame(payload: &[u8], max_size: usize) -> Result<Bytes, ProtocolError> {
    if payload.len() > max_size || payload.len() > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: max_size,
        });
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Reads the next frame's payload.
///
/// Returns `Ok(None)` when the stream closes cleanly between frames. A close
/// inside a frame is an `UnexpectedEof` error, and an oversized length prefix
/// is `FrameTooLarge`; in both cases the stream can no longer be trusted.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Bytes>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;

    while filled < LENGTH_PREFIX_SIZE {
        let read = reader.read(&mut prefix[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside a length prefix",
            )
            .into());
        }
        filled += read;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_size {
        return Err(ProtocolError::FrameTooLarge { len, max: max_size });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Writes an already-encoded frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
