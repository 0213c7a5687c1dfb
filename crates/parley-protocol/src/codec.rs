//! Wire and bus codecs.
//!
//! A client frame on the wire is a big-endian `u32` body length followed by
//! the MessagePack body. Bus payloads travel between processes as JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::frames::Frame;

/// Hard cap on a frame body, whatever a transport configures (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes taken by the body length.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// The buffer ends before the frame does.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The body is not a valid frame.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether the byte stream is still aligned on a frame boundary.
    ///
    /// A frame whose body fails to decode has already been consumed from the
    /// buffer, so the next frame can still be read. Framing errors leave the
    /// stream unusable.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::Decode(_) | ProtocolError::Json(_))
    }
}

/// Length of the body announced by `data`, if the prefix is there yet.
fn body_len(data: &[u8], limit: usize) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len > limit.min(MAX_FRAME_SIZE) {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

/// Encode a frame with its length prefix.
///
/// # Errors
///
/// Returns an error if the body exceeds [`MAX_FRAME_SIZE`] or cannot be
/// serialized.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Append a length-prefixed frame to `buf`.
///
/// # Errors
///
/// Same as [`encode`]; `buf` is left untouched on error.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = rmp_serde::to_vec_named(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

/// Decode exactly one frame from the start of `data`.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if `data` is shorter than the
/// announced frame, or an error if the frame is oversized or malformed.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let len = body_len(data, MAX_FRAME_SIZE)?
        .ok_or(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE.saturating_sub(data.len())))?;

    let end = LENGTH_PREFIX_SIZE + len;
    let body = data
        .get(LENGTH_PREFIX_SIZE..end)
        .ok_or_else(|| ProtocolError::Incomplete(end - data.len()))?;
    Ok(rmp_serde::from_slice(body)?)
}

/// Take the next frame off a stream buffer.
///
/// Returns `Ok(None)` until a whole frame is buffered. Once the frame is
/// complete its bytes are consumed, even when the body fails to decode.
///
/// # Errors
///
/// Returns an error if the announced body exceeds `max_size` or the body is
/// malformed.
pub fn decode_from(buf: &mut BytesMut, max_size: usize) -> Result<Option<Frame>, ProtocolError> {
    let Some(len) = body_len(buf, max_size)? else {
        return Ok(None);
    };
    if buf.len() < LENGTH_PREFIX_SIZE + len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(len);
    Ok(Some(rmp_serde::from_slice(&body)?))
}

/// Serialize a bus payload as JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Deserialize a JSON bus payload.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON for `T`.
pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}
