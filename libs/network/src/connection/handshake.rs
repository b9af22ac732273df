//! Hub identity exchange
//!
//! The dialer writes its handshake first and then reads the peer's; the
//! acceptor does the reverse. The whole exchange runs under one timeout and
//! the stream is dropped (closing the socket) when it expires.

use crate::{Result, TransportError};
use hublink_codec::{HandshakeMessage, HubId, WireHeader, WIRE_HEADER_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Which side of the handshake this end plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Acceptor,
}

/// Exchange hub ids over `stream`, returning it with the peer's id
pub async fn handshake<S>(stream: S, local_hub: &HubId, role: Role, timeout: Duration) -> Result<(S, HubId)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async move {
        let mut stream = stream;
        let remote_hub = match role {
            Role::Dialer => {
                write_handshake(&mut stream, local_hub).await?;
                read_handshake(&mut stream).await?
            }
            Role::Acceptor => {
                let remote_hub = read_handshake(&mut stream).await?;
                write_handshake(&mut stream, local_hub).await?;
                remote_hub
            }
        };
        Ok::<_, TransportError>((stream, remote_hub))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => {
            if let Ok((_, remote_hub)) = &result {
                debug!(local = %local_hub, remote = %remote_hub, ?role, "Handshake complete");
            }
            result
        }
        Err(_) => Err(TransportError::timeout("handshake", timeout.as_millis() as u64)),
    }
}

async fn write_handshake<S>(stream: &mut S, local_hub: &HubId) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let frame = HandshakeMessage::new(local_hub.clone()).encode()?;
    stream
        .write_all(&frame)
        .await
        .map_err(|e| TransportError::handshake_with_source("Failed to send handshake", e))?;
    stream
        .flush()
        .await
        .map_err(|e| TransportError::handshake_with_source("Failed to flush handshake", e))
}

async fn read_handshake<S>(stream: &mut S) -> Result<HubId>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; WIRE_HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| TransportError::handshake_with_source("Peer closed before handshake header", e))?;

    let header = WireHeader::decode(&header)
        .map_err(|e| TransportError::handshake_with_source("Invalid handshake header", e))?;
    HandshakeMessage::check_header(&header)
        .map_err(|e| TransportError::handshake_with_source("Unexpected handshake frame", e))?;

    let mut payload = vec![0u8; header.payload_len()];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| TransportError::handshake_with_source("Peer closed before handshake payload", e))?;

    HandshakeMessage::from_payload(&payload)
        .map(HandshakeMessage::into_hub_id)
        .map_err(|e| TransportError::handshake_with_source("Invalid handshake payload", e))
}
