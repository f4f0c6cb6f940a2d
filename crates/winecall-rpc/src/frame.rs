//! Length-prefixed JSON frames.
//!
//! Each frame is a 4-byte little-endian payload length followed by that many
//! bytes of JSON.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{Envelope, MAX_FRAME_LEN, PROTOCOL_VERSION};
use crate::{Result, RpcError};

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, envelope: &Envelope<T>) -> Result<()> {
    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. Returns `None` if the peer closed the stream cleanly
/// between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<Envelope<T>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let envelope: serde_json::Value = serde_json::from_slice(&payload)?;
    let version = envelope.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
    if version != u64::from(PROTOCOL_VERSION) {
        return Err(RpcError::Version {
            expected: PROTOCOL_VERSION,
            found: version,
        });
    }
    Ok(Some(serde_json::from_value(envelope)?))
}
