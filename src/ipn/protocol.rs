//! Wire protocol for the daemon's local socket
//!
//! Uses length-prefixed JSON framing:
//! - 4-byte big-endian length prefix
//! - JSON payload (max 1MB)
//!
//! Every request gets exactly one response, except [`Request::WatchIpnBus`]:
//! the daemon answers [`Response::Ok`] once the subscription is in place and
//! then keeps sending [`Response::Notify`] frames until either side closes
//! the connection.

use super::{MaskedPrefs, Notify, Prefs, StartOptions, Status};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Requests from the CLI to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Status,
    GetPrefs,
    EditPrefs(MaskedPrefs),
    Start(StartOptions),
    StartLoginInteractive,
    RequestEngineStatus,
    WatchIpnBus,
    CheckIpForwarding,
}

/// Responses from the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Status(Status),
    Prefs(Prefs),
    Ok,
    Notify(Notify),
    Error(String),
}

/// Read a length-prefixed JSON message from an async reader
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes (max {})", len, MAX_MESSAGE_SIZE),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("JSON parse error: {}", e))
    })
}

/// Write a length-prefixed JSON message to an async writer
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(message).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON serialize error: {}", e),
        )
    })?;

    if json.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Message too large: {} bytes (max {})",
                json.len(),
                MAX_MESSAGE_SIZE
            ),
        ));
    }

    let len_buf = (json.len() as u32).to_be_bytes();
    writer.write_all(&len_buf).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}
