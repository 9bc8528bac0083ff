/**
 * protocol.rs
 *
 * Control channel messages exchanged with the rendezvous server
 *
 * Each direction carries exactly one JSON object, terminated by a newline.
 */

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single control message
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Client -> rendezvous registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialRequest {
    pub peer_id: String,
    pub my_id: String,
    #[serde(default)]
    pub my_private_addr: String,
}

impl DialRequest {
    pub fn new(my_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            my_id: my_id.into(),
            my_private_addr: String::new(),
        }
    }
}

/// Rendezvous -> client: where the counterpart can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialResponse {
    pub peer_id: String,
    pub peer_public_addr: String,
    pub peer_private_addr: String,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("connection closed before a complete message arrived")]
    ConnectionClosed,

    #[error("message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },
}

/// Serialize `message` as one JSON line and flush it
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    bytes.push(b'\n');

    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read bytes until one complete JSON value has arrived and decode it.
///
/// The value may span several reads. Anything after it in the last read is
/// discarded, which is fine for a channel carrying a single message.
pub async fn read_message<R, T>(reader: &mut R, limit: usize) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        if !buf.is_empty() {
            let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<T>();
            match values.next() {
                Some(Ok(value)) => return Ok(value),
                // Incomplete value, wait for more bytes
                Some(Err(e)) if e.is_eof() => {}
                Some(Err(e)) => return Err(ProtocolError::Decode(e)),
                // Whitespace only so far
                None => {}
            }
        }

        if buf.len() >= limit {
            return Err(ProtocolError::MessageTooLarge { limit });
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
