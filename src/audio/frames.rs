//! Length-prefixed frame stream produced by the encode stage.
//!
//! Each frame is a little-endian `u16` payload length followed by that many
//! bytes of Opus payload. At 48 kHz stereo every frame carries 20 ms.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;

/// Playback time carried by one frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

const HEADER_LEN: usize = 2;
const READ_CHUNK: usize = 16 * 1024;

/// Incremental frame parser over any async byte stream.
///
/// Partial reads are kept in an internal buffer, so [`FrameReader::next_frame`]
/// is cancel safe and can sit in a `select!` next to the control channel.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Next complete frame, `Ok(None)` on a clean end of stream.
    ///
    /// A stream that ends inside a header or payload yields
    /// [`FrameError::Truncated`].
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            if let Some(frame) = self.split_frame() {
                return Ok(Some(frame));
            }

            self.buf.reserve(READ_CHUNK);
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated {
                        buffered: self.buf.len(),
                    })
                };
            }
        }
    }

    fn split_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }

        self.buf.advance(HEADER_LEN);
        Some(self.buf.split_to(len).freeze())
    }
}

/// Appends `payload` to `out` with its length prefix.
///
/// Payloads longer than `u16::MAX` cannot be framed and are truncated.
pub fn encode_frame(payload: &[u8], out: &mut BytesMut) {
    let len = payload.len().min(u16::MAX as usize);
    out.reserve(HEADER_LEN + len);
    out.put_u16_le(len as u16);
    out.extend_from_slice(&payload[..len]);
}
