//! Frame-level transport logic shared by the server and the test clients
//!
//! Format: MAGIC (4) | VERSION (2, le) | TYPE (1) | LENGTH (4, le) | payload

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{MAGIC, MAX_FRAME_SIZE, VERSION};

pub const HEADER_LEN: usize = 11;

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!("frame payload too large: {} bytes (max: {})", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

/// Build frame header (11 bytes)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header, returning (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        bail!("invalid magic in frame header");
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        bail!("protocol version mismatch: got {}, expected {}", version, VERSION);
    }
    Ok((header[6], u32::from_le_bytes([header[7], header[8], header[9], header[10]])))
}

/// Read one complete frame from the stream
pub async fn read_frame<S>(stream: &mut S) -> Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    stream.read_exact(&mut hdr).await?;
    let (typ, len_u32) = parse_frame_header(&hdr)?;
    let len = len_u32 as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    Ok((typ, payload))
}

/// Write one complete frame to the stream
pub async fn write_frame<S>(stream: &mut S, t: u8, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    validate_frame_size(payload.len())?;
    let hdr = build_frame_header(t, payload.len() as u32);
    stream.write_all(&hdr).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}
