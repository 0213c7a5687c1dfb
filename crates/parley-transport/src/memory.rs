//! In-process transport.
//!
//! A [`pair`] yields a server-side [`MemoryConnection`] and the matching
//! [`MemoryClient`]. Frames cross the pair as encoded bytes, so the same
//! codec path as the network transports is exercised.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parley_protocol::{codec, Frame};
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};

/// Create a connected client/server pair.
#[must_use]
pub fn pair(max_frame_size: usize) -> (MemoryConnection, MemoryClient) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: server_rx,
        outbound: server_tx,
        max_frame_size,
    };
    let client = MemoryClient {
        outbound: Some(client_tx),
        inbound: client_rx,
        read_buffer: BytesMut::new(),
    };
    (conn, client)
}

/// Server side of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
    max_frame_size: usize,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let reader = MemoryReader {
            inbound: self.inbound,
            read_buffer: BytesMut::new(),
            max_frame_size: self.max_frame_size,
        };
        let writer = MemoryWriter {
            outbound: Some(self.outbound),
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Bytes>,
    read_buffer: BytesMut,
    max_frame_size: usize,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = codec::decode_from(&mut self.read_buffer, self.max_frame_size)? {
                return Ok(Some(frame));
            }
            match self.inbound.recv().await {
                Some(data) => self.read_buffer.extend_from_slice(&data),
                None => return Ok(None),
            }
        }
    }
}

struct MemoryWriter {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(data).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        Ok(())
    }
}

/// Client side of an in-memory connection.
pub struct MemoryClient {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    read_buffer: BytesMut,
}

impl MemoryClient {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone or encoding fails.
    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let data = codec::encode(frame)?;
        self.send_raw(data)
    }

    /// Send raw bytes to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone.
    pub fn send_raw(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(data.into()).map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame from the server.
    ///
    /// Returns `None` once the server closed its write half.
    ///
    /// # Errors
    ///
    /// Returns an error if the server sent an undecodable frame.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = codec::decode_from(&mut self.read_buffer, codec::MAX_FRAME_SIZE)? {
                return Ok(Some(frame));
            }
            match self.inbound.recv().await {
                Some(data) => self.read_buffer.extend_from_slice(&data),
                None => return Ok(None),
            }
        }
    }

    /// Close the client's sending side, as a client hanging up would.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchanges_frames() {
        let (conn, mut client) = pair(64 * 1024);
        let (mut reader, mut writer) = Box::new(conn).split();

        client.send(&Frame::ping()).unwrap();
        assert_eq!(reader.recv().await.unwrap(), Some(Frame::ping()));

        writer.send(Frame::pong(None)).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Some(Frame::pong(None)));
    }

    #[tokio::test]
    async fn test_client_close_ends_reader() {
        let (conn, mut client) = pair(64 * 1024);
        let (mut reader, _writer) = Box::new(conn).split();

        client.close();
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writer_close_ends_client() {
        let (conn, mut client) = pair(64 * 1024);
        let (_reader, mut writer) = Box::new(conn).split();

        writer.close().await.unwrap();
        assert!(client.recv().await.unwrap().is_none());
        assert!(writer.send(Frame::ping()).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (conn, client) = pair(16);
        let (mut reader, _writer) = Box::new(conn).split();

        client
            .send(&Frame::error(1, "a message that is longer than sixteen bytes"))
            .unwrap();
        assert!(!reader.recv().await.unwrap_err().is_recoverable());
    }
}
