//! Framed reader and writer halves of an established connection

use super::within;
use crate::tls::BoxedStream;
use crate::{Result, TransportError};
use hublink_codec::{BufferPool, HubId, Message, PooledBuffer, WireHeader, WIRE_HEADER_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Buffer size of each half
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Receiving half; owned by a channel's reader loop
pub struct ConnectionReader {
    reader: BufReader<ReadHalf<BoxedStream>>,
    remote_hub: HubId,
    remote_addr: Option<SocketAddr>,
    receive_timeout: Option<Duration>,
    max_message_size: usize,
}

impl ConnectionReader {
    pub(super) fn new(
        half: ReadHalf<BoxedStream>,
        remote_hub: HubId,
        remote_addr: Option<SocketAddr>,
        receive_timeout: Option<Duration>,
        max_message_size: usize,
    ) -> Self {
        Self {
            reader: BufReader::with_capacity(IO_BUFFER_SIZE, half),
            remote_hub,
            remote_addr,
            receive_timeout,
            max_message_size,
        }
    }

    pub fn remote_hub(&self) -> &HubId {
        &self.remote_hub
    }

    /// Read exactly `n` bytes into `buffer`
    pub async fn receive(&mut self, buffer: &mut PooledBuffer, n: usize, cancel: &CancellationToken) -> Result<()> {
        let remote_addr = self.remote_addr;
        let reader = &mut self.reader;
        let fill = async {
            let mut remaining = n;
            while remaining > 0 {
                let read = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TransportError::Canceled),
                    read = buffer.write_from(&mut *reader, remaining) => read.map_err(|e| {
                        TransportError::connection_with_source("Failed to read payload", remote_addr, e)
                    })?,
                };
                if read == 0 {
                    return Err(TransportError::connection(
                        format!("Connection closed with {} payload bytes outstanding", remaining),
                        remote_addr,
                    ));
                }
                remaining -= read;
            }
            Ok(())
        };
        within(self.receive_timeout, "receive payload", fill).await
    }

    async fn read_header(&mut self, cancel: &CancellationToken) -> Result<WireHeader> {
        let remote_addr = self.remote_addr;
        let reader = &mut self.reader;
        let mut bytes = [0u8; WIRE_HEADER_SIZE];
        let read = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Canceled),
                read = reader.read_exact(&mut bytes) => read.map(|_| ()).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        TransportError::connection("Connection closed by peer", remote_addr)
                    } else {
                        TransportError::connection_with_source("Failed to read header", remote_addr, e)
                    }
                }),
            }
        };
        within(self.receive_timeout, "receive header", read).await?;

        WireHeader::decode(&bytes).map_err(|e| TransportError::protocol_with_source("Invalid wire header", e))
    }

    /// Read the next application message, renting its payload from `pool`
    pub async fn read_message(&mut self, pool: &BufferPool, cancel: &CancellationToken) -> Result<Message> {
        let wire = self.read_header(cancel).await?;

        if wire.header.type_id.is_handshake() {
            return Err(TransportError::protocol("Handshake type id on an established connection"));
        }
        let size = wire.payload_len();
        if size > self.max_message_size {
            return Err(TransportError::protocol(format!(
                "Message size {} exceeds maximum {}",
                size, self.max_message_size
            )));
        }

        let mut payload = pool.rent();
        self.receive(&mut payload, size, cancel).await?;

        trace!(
            remote = %self.remote_hub,
            message_id = %wire.header.message_id,
            bytes = size,
            "Received message"
        );

        Message::new(wire.header, payload).map_err(|e| TransportError::protocol_with_source("Invalid message", e))
    }
}

/// Sending half; owned by a channel's writer loop
pub struct ConnectionWriter {
    writer: BufWriter<WriteHalf<BoxedStream>>,
    remote_hub: HubId,
    remote_addr: Option<SocketAddr>,
    send_timeout: Option<Duration>,
}

impl ConnectionWriter {
    pub(super) fn new(
        half: WriteHalf<BoxedStream>,
        remote_hub: HubId,
        remote_addr: Option<SocketAddr>,
        send_timeout: Option<Duration>,
    ) -> Self {
        Self {
            writer: BufWriter::with_capacity(IO_BUFFER_SIZE, half),
            remote_hub,
            remote_addr,
            send_timeout,
        }
    }

    pub fn remote_hub(&self) -> &HubId {
        &self.remote_hub
    }

    /// Buffer the header and payload of `message`; returns bytes written
    pub async fn write_message(&mut self, message: &Message) -> Result<usize> {
        let payload = message.payload();
        let wire = WireHeader::for_payload(*message.header(), payload.remaining())?;
        let remote_addr = self.remote_addr;
        let writer = &mut self.writer;

        let write = async {
            writer.write_all(&wire.encode()).await?;
            payload.write_to(&mut *writer).await
        };
        within(self.send_timeout, "send message", async {
            write
                .await
                .map_err(|e| TransportError::connection_with_source("Failed to write message", remote_addr, e))
        })
        .await?;

        trace!(
            remote = %self.remote_hub,
            message_id = %message.header().message_id,
            bytes = wire.payload_len(),
            "Buffered message"
        );
        Ok(WIRE_HEADER_SIZE + wire.payload_len())
    }

    /// Push buffered bytes to the socket
    pub async fn flush(&mut self) -> Result<()> {
        let remote_addr = self.remote_addr;
        let writer = &mut self.writer;
        within(self.send_timeout, "flush", async {
            writer
                .flush()
                .await
                .map_err(|e| TransportError::connection_with_source("Failed to flush", remote_addr, e))
        })
        .await
    }

    /// Flush and close the write direction
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        self.writer
            .shutdown()
            .await
            .map_err(|e| TransportError::connection_with_source("Failed to shut down", self.remote_addr, e))
    }
}
