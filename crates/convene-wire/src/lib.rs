//! Framed RPC transport — length-prefixed JSON call/reply.
//!
//! Both the bootstrap lock RPC and the raft RPC speak the same framing:
//! a `u32` big-endian payload length followed by a JSON payload. Servers
//! read request frames off an accepted connection and answer each with
//! exactly one reply frame; clients either dial per call ([`call`]) or
//! hold a connection open and use [`read_frame`]/[`write_frame`]
//! directly.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a single frame payload. A peer announcing more than
/// this is malformed, not just large.
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Errors produced by the framed transport.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME} byte limit")]
    FrameTooLarge(u32),
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<S, T>(stream: &mut S, value: &T) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME {
        return Err(WireError::FrameTooLarge(len));
    }
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
///
/// Returns `Ok(None)` on a clean EOF before the length prefix, which is
/// how peers hang up between calls.
pub async fn read_frame<S, T>(stream: &mut S) -> Result<Option<T>, WireError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// One-shot call: dial, send a single request frame, read a single
/// reply frame.
pub async fn call<Req, Resp>(addr: &str, request: &Req) -> Result<Resp, WireError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, request).await?;
    match read_frame(&mut stream).await? {
        Some(resp) => Ok(resp),
        None => Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before reply",
        ))),
    }
}
