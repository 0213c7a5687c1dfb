//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum WebSocket into Parley frame halves. Binary
//! messages carry length-prefixed frames; the bytes of text messages are
//! read the same way.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use parley_protocol::{codec, Frame, ProtocolError};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};

/// Default maximum frame size accepted from clients (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// An upgraded WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_frame_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>, max_frame_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr,
            max_frame_size,
        }
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (sink, stream) = self.socket.split();
        let reader = WebSocketReader::new(stream, self.max_frame_size);
        let writer = WebSocketWriter { sink, open: true };
        (Box::new(reader), Box::new(writer))
    }
}

/// Read half of a WebSocket connection.
///
/// One WebSocket message may carry several frames, and a frame may span
/// messages. The size limit applies to each frame's announced length; the
/// size of a whole message is bounded by the upgrade.
pub struct WebSocketReader<S = SplitStream<WebSocket>> {
    stream: S,
    read_buffer: BytesMut,
    max_frame_size: usize,
}

impl<S> WebSocketReader<S> {
    fn new(stream: S, max_frame_size: usize) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    fn next_buffered(&mut self) -> Result<Option<Frame>, TransportError> {
        codec::decode_from(&mut self.read_buffer, self.max_frame_size).map_err(|e| {
            if let ProtocolError::FrameTooLarge(len) = e {
                warn!(len, max = self.max_frame_size, "Frame too large");
            }
            TransportError::from(e)
        })
    }
}

#[async_trait]
impl<S> FrameReader for WebSocketReader<S>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + Sync,
{
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            // Frames left over from an earlier message go first
            if let Some(frame) = self.next_buffered()? {
                return Ok(Some(frame));
            }

            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => self.read_buffer.extend_from_slice(&data),
                Some(Ok(Message::Text(text))) => self.read_buffer.extend_from_slice(text.as_bytes()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

/// Write half of a WebSocket connection.
pub struct WebSocketWriter {
    sink: SplitSink<WebSocket, Message>,
    open: bool,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(()); // Already closed
        }

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}
