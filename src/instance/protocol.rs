//! Client Wire Protocol
//!
//! Requests:
//!
//! ```text
//! get: ['g'][key_len u32 LE][key]
//! set: ['s'][key_len u32 LE][key][value_len u32 LE][value]
//! ```
//!
//! Replies: a set answers one byte (1 stored, 0 failed); a get answers
//! `[len u32 LE][value]` where a zero length means the key is absent.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const OP_GET: u8 = b'g';
pub const OP_SET: u8 = b's';

/// Decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get { key: Bytes },
    Set { key: Bytes, value: Bytes },
}

impl Request {
    pub fn key(&self) -> &[u8] {
        match self {
            Request::Get { key } | Request::Set { key, .. } => key,
        }
    }
}

/// Limits enforced while decoding
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_key_size: usize,
    pub max_value_size: usize,
}

async fn read_block<T>(stream: &mut T, max: usize, what: &str) -> Result<Bytes>
where
    T: AsyncRead + Unpin,
{
    let len = stream.read_u32_le().await? as usize;
    if len > max {
        return Err(Error::Protocol(format!(
            "{} of {} bytes exceeds the {} byte limit",
            what, len, max
        )));
    }
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}

/// Read one request; `Ok(None)` is a clean end of stream
pub async fn read_request<T>(stream: &mut T, limits: FrameLimits) -> Result<Option<Request>>
where
    T: AsyncRead + Unpin,
{
    let mut op = [0u8; 1];
    if stream.read(&mut op).await? == 0 {
        return Ok(None);
    }

    match op[0] {
        OP_GET => {
            let key = read_block(stream, limits.max_key_size, "Key").await?;
            Ok(Some(Request::Get { key }))
        }
        OP_SET => {
            let key = read_block(stream, limits.max_key_size, "Key").await?;
            let value = read_block(stream, limits.max_value_size, "Value").await?;
            Ok(Some(Request::Set { key, value }))
        }
        other => Err(Error::Protocol(format!("Unknown opcode 0x{:02x}", other))),
    }
}

pub async fn write_set_reply<T>(stream: &mut T, stored: bool) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    stream.write_u8(u8::from(stored)).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn write_get_reply<T>(stream: &mut T, value: Option<&[u8]>) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let value = value.unwrap_or_default();
    let len = u32::try_from(value.len())
        .map_err(|_| Error::Protocol(format!("Value of {} bytes cannot be framed", value.len())))?;
    stream.write_u32_le(len).await?;
    stream.write_all(value).await?;
    stream.flush().await?;
    Ok(())
}

// =============================================================================
// Client Side
// =============================================================================

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Protocol(format!("Block of {} bytes cannot be framed", len)))
}

pub async fn write_request<T>(stream: &mut T, request: &Request) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    match request {
        Request::Get { key } => {
            stream.write_u8(OP_GET).await?;
            stream.write_u32_le(frame_len(key.len())?).await?;
            stream.write_all(key).await?;
        }
        Request::Set { key, value } => {
            stream.write_u8(OP_SET).await?;
            stream.write_u32_le(frame_len(key.len())?).await?;
            stream.write_all(key).await?;
            stream.write_u32_le(frame_len(value.len())?).await?;
            stream.write_all(value).await?;
        }
    }
    stream.flush().await?;
    Ok(())
}

pub async fn read_set_reply<T>(stream: &mut T) -> Result<bool>
where
    T: AsyncRead + Unpin,
{
    Ok(stream.read_u8().await? == 1)
}

/// Read a get reply; an empty value reads as a miss
pub async fn read_get_reply<T>(stream: &mut T) -> Result<Option<Bytes>>
where
    T: AsyncRead + Unpin,
{
    let len = stream.read_u32_le().await? as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(Some(Bytes::from(buffer)))
}
