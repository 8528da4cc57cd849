use anyhow::{Context, bail};
use bytes::BytesMut;
use serde::Serialize;

use tether_core::listener::Connection;
use tether_core::protocol::{Frame, MessageType, encode_payload_frame, try_decode_frame};

const READ_CHUNK: usize = 4096;

/// Accumulates bytes from a [`Connection`] and yields whole frames.
///
/// [`next_frame`](Self::next_frame) is cancel-safe: bytes already read stay
/// in the accumulator, so it can sit in a `select!` next to an outbox.
pub struct FrameReader {
    accum: BytesMut,
    buf: Vec<u8>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            accum: BytesMut::with_capacity(READ_CHUNK),
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Returns the next complete frame, or `None` once the peer closed
    /// cleanly between frames.
    ///
    /// # Errors
    ///
    /// Returns an error on a read failure, a protocol violation, or EOF in
    /// the middle of a frame.
    pub async fn next_frame<C: Connection>(&mut self, conn: &mut C) -> anyhow::Result<Option<Frame>> {
        loop {
            if let Some(frame) = try_decode_frame(&mut self.accum)? {
                return Ok(Some(frame));
            }
            let n = conn.read(&mut self.buf).await?;
            if n == 0 {
                if self.accum.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed mid-frame ({} bytes pending)", self.accum.len());
            }
            self.accum.extend_from_slice(&self.buf[..n]);
        }
    }
}

/// Serializes `payload` as JSON and writes it as one frame.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn write_frame<C: Connection, T: Serialize>(
    conn: &mut C,
    msg_type: MessageType,
    payload: &T,
) -> anyhow::Result<()> {
    let frame = encode_payload_frame(msg_type, payload)
        .with_context(|| format!("failed to encode {msg_type:?} frame"))?;
    conn.write_all(&frame).await
}
