//! Encoding of transport packets and operation payloads.
//!
//! Packets are JSON `SyncMessage`s bounded at [`MAX_MESSAGE_SIZE`]. Stream
//! transports frame them with a 4-byte big-endian length prefix.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{MAX_MESSAGE_SIZE, SyncMessage};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use peersync_crdt::CrdtOperation;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encodes a message into a packet.
pub fn encode_message(message: &SyncMessage) -> SyncResult<Vec<u8>> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::Network(format!(
            "message too large: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decodes a packet into a message.
pub fn decode_message(bytes: &[u8]) -> SyncResult<SyncMessage> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::Network(format!(
            "message too large: {} bytes",
            bytes.len()
        )));
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Serializes operations as a UTF-8 JSON array.
pub fn serialize_operations(operations: &[CrdtOperation]) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(operations)?)
}

/// Parses the output of [`serialize_operations`].
pub fn parse_operations(bytes: &[u8]) -> SyncResult<Vec<CrdtOperation>> {
    serde_json::from_slice(bytes).map_err(|e| SyncError::OperationParseFailure(e.to_string()))
}

/// Gzip-compresses a payload.
pub fn compress(data: &[u8]) -> SyncResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| SyncError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SyncError::Compression(e.to_string()))
}

/// Decompresses a gzip payload, refusing output beyond the message bound.
pub fn decompress(data: &[u8]) -> SyncResult<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| SyncError::Compression(e.to_string()))?;
    if out.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::Compression(
            "decompressed payload exceeds size limit".to_string(),
        ));
    }
    Ok(out)
}

/// Reads a length-prefixed message from a byte stream.
pub async fn read_message<T: AsyncRead + Unpin>(io: &mut T) -> SyncResult<SyncMessage> {
    let len = io
        .read_u32()
        .await
        .map_err(|e| SyncError::Network(e.to_string()))? as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(SyncError::Network(format!("message too large: {len} bytes")));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf)
        .await
        .map_err(|e| SyncError::Network(e.to_string()))?;
    decode_message(&buf)
}

/// Writes a length-prefixed message to a byte stream.
pub async fn write_message<T: AsyncWrite + Unpin>(
    io: &mut T,
    message: &SyncMessage,
) -> SyncResult<()> {
    let bytes = encode_message(message)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| SyncError::Network("message length overflows frame".to_string()))?;
    io.write_u32(len)
        .await
        .map_err(|e| SyncError::Network(e.to_string()))?;
    io.write_all(&bytes)
        .await
        .map_err(|e| SyncError::Network(e.to_string()))?;
    io.flush()
        .await
        .map_err(|e| SyncError::Network(e.to_string()))
}
