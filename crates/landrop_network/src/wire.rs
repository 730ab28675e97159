//! Envelope codec and framing.
//!
//! UDP: one JSON envelope per datagram, no prefix.
//! TCP: `[4-byte length (u32 little-endian)][JSON envelope]`, the same framing
//! for the request and response legs. Frames above [`MAX_FRAME_SIZE`] are
//! rejected before any allocation.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;
use crate::message::Envelope;

/// Maximum allowed frame size (4MB).
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Width of the TCP length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Serialize an envelope to JSON bytes.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    // Every field serializes to a JSON string, number or object with string keys.
    serde_json::to_vec(envelope).unwrap_or_default()
}

/// Deserialize an envelope from JSON bytes.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize an envelope into a complete length-prefixed frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let payload = encode(envelope);
    let len = frame_len(payload.len())?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one complete frame held in memory.
///
/// Returns the envelope and the number of bytes consumed; trailing bytes after
/// the frame are left to the caller.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), CodecError> {
    let Some(prefix) = bytes.get(..LENGTH_PREFIX_LEN) else {
        return Err(CodecError::Truncated {
            expected: LENGTH_PREFIX_LEN,
            actual: bytes.len(),
        });
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }

    let end = LENGTH_PREFIX_LEN + len as usize;
    let body = bytes.get(LENGTH_PREFIX_LEN..end).ok_or(CodecError::Truncated {
        expected: len as usize,
        actual: bytes.len() - LENGTH_PREFIX_LEN,
    })?;
    Ok((decode(body)?, end))
}

/// Write an envelope as a length-prefixed frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), CodecError> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, waiting until the whole body is available.
///
/// Returns `Ok(None)` on a clean EOF before the length prefix. An EOF part
/// way through the prefix is a truncated frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Envelope>, CodecError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::Truncated {
                expected: LENGTH_PREFIX_LEN,
                actual: filled,
            });
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    let mut filled = 0;
    while filled < payload.len() {
        let n = reader.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(CodecError::Truncated {
                expected: payload.len(),
                actual: filled,
            });
        }
        filled += n;
    }

    Ok(Some(decode(&payload)?))
}

fn frame_len(len: usize) -> Result<u32, CodecError> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_FRAME_SIZE => Ok(len),
        _ => Err(CodecError::FrameTooLarge(u32::try_from(len).unwrap_or(u32::MAX))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
