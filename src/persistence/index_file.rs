//! Framed binary container for saved indices.
//!
//! Layout: `[magic "ANNX"][version: u16][length: u32][crc32: u32][payload]`,
//! all integers little-endian, payload is bincode. Any framing or decoding
//! failure is reported as [`AnnError::CorruptIndex`].

use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AnnError, Result};
use crate::persistence::serialization;

pub const MAGIC: &[u8; 4] = b"ANNX";
pub const FORMAT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 14;

/// Write `value` as one frame.
pub fn write_frame<W: Write, V: Serialize>(writer: &mut W, value: &V) -> Result<()> {
    let payload = serialization::to_bincode(value)?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        AnnError::SerializationError(format!("Index of {} bytes is too large to frame", payload.len()))
    })?;
    let crc = crc32fast::hash(&payload);

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[6..10].copy_from_slice(&len.to_le_bytes());
    header[10..14].copy_from_slice(&crc.to_le_bytes());

    writer.write_all(&header)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read and verify one frame.
pub fn read_frame<R: Read, V: DeserializeOwned>(reader: &mut R) -> Result<V> {
    let payload = read_payload(reader)?;
    decode_payload(&payload)
}

/// Decode a verified payload, or a leading part of it.
pub fn decode_payload<V: DeserializeOwned>(payload: &[u8]) -> Result<V> {
    serialization::from_bincode(payload).map_err(|e| AnnError::CorruptIndex(e.to_string()))
}

/// Read one frame and return its checksum-verified payload.
pub fn read_payload<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    read_exact(reader, &mut header, "header")?;

    if &header[0..4] != MAGIC {
        return Err(AnnError::CorruptIndex("Bad magic bytes".to_string()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(AnnError::CorruptIndex(format!(
            "Unsupported format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
    let crc = u32::from_le_bytes([header[10], header[11], header[12], header[13]]);

    let mut payload = Vec::new();
    payload
        .try_reserve_exact(len)
        .map_err(|e| AnnError::OutOfMemory(e.to_string()))?;
    payload.resize(len, 0);
    read_exact(reader, &mut payload, "payload")?;

    if crc32fast::hash(&payload) != crc {
        return Err(AnnError::CorruptIndex("Checksum mismatch".to_string()));
    }
    Ok(payload)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => AnnError::CorruptIndex(format!("Truncated {}", what)),
        _ => AnnError::IoError(e),
    })
}
