// control-server/src/ws/connection.rs
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use common::{MessagePayload, WebSocketMessage};

use crate::ws::frame::{
    close_code, close_frame, decode_frame, encode_frame, Frame, FrameError, Opcode,
};
use crate::ws::manager::WebSocketManager;

/// Outbound frames queued per connection before sends start failing.
const OUTBOUND_QUEUE_CAPACITY: usize = 100;

const READ_CHUNK_BYTES: usize = 4096;

/// Per-connection transport failure. Isolated to the connection that hit
/// it; the manager reacts by marking the connection not-alive.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection send queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// Write side of one connection, abstract so the manager can be driven
/// over any transport.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send_frame(&self, opcode: Opcode, payload: Vec<u8>) -> Result<(), SinkError>;
    async fn close(&self, code: u16, reason: &str) -> Result<(), SinkError>;
}

enum SinkCommand {
    Frame(Vec<u8>),
    Close(Vec<u8>),
}

/// Production sink: a bounded queue in front of a writer task that owns
/// the socket write half, so concurrent senders never interleave bytes
/// and a stalled peer surfaces as a full queue instead of a blocked task.
pub struct BufferedSink {
    sender: mpsc::Sender<SinkCommand>,
}

impl BufferedSink {
    pub fn spawn<W>(mut write_half: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    SinkCommand::Frame(bytes) => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            debug!("Connection writer stopping: {}", e);
                            break;
                        }
                    }
                    SinkCommand::Close(bytes) => {
                        let _ = write_half.write_all(&bytes).await;
                        break;
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });
        Self { sender }
    }

    fn push(&self, command: SinkCommand) -> Result<(), SinkError> {
        self.sender.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[async_trait]
impl ConnectionSink for BufferedSink {
    async fn send_frame(&self, opcode: Opcode, payload: Vec<u8>) -> Result<(), SinkError> {
        self.push(SinkCommand::Frame(encode_frame(opcode, &payload)))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), SinkError> {
        self.push(SinkCommand::Close(close_frame(code, reason)))
    }
}

enum Disconnect {
    PeerClose(Option<u16>),
    PeerGone,
    IdleTimeout,
    Protocol(FrameError),
    Read(std::io::Error),
}

impl Disconnect {
    fn reason(&self) -> String {
        match self {
            Disconnect::PeerClose(Some(code)) => format!("client close (code {})", code),
            Disconnect::PeerClose(None) => "client close".to_string(),
            Disconnect::PeerGone => "peer disconnected".to_string(),
            Disconnect::IdleTimeout => "idle timeout".to_string(),
            Disconnect::Protocol(e) => format!("protocol error: {}", e),
            Disconnect::Read(e) => format!("read error: {}", e),
        }
    }
}

enum FrameFlow {
    Continue,
    PeerClose(Option<u16>),
}

/// Own an upgraded socket for the rest of its life: register with the
/// manager, pump inbound frames, and deregister on the way out. The 101
/// response has already been written by the caller.
pub async fn serve(stream: TcpStream, manager: Arc<WebSocketManager>, client_id: Option<String>) {
    let (mut read_half, write_half) = stream.into_split();
    let sink: Arc<dyn ConnectionSink> = Arc::new(BufferedSink::spawn(write_half));

    let connection_id = match manager.handle_connection(sink.clone(), client_id).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Refused WebSocket connection: {}", e);
            let _ = sink.close(1013, "not accepting connections").await;
            return;
        }
    };

    let disconnect = read_loop(&mut read_half, &sink, &manager, &connection_id).await;
    match &disconnect {
        Disconnect::PeerClose(_) | Disconnect::PeerGone | Disconnect::Read(_) => {}
        Disconnect::Protocol(e) => {
            warn!("Connection {} violated framing: {}", connection_id, e);
            let _ = sink.close(1002, "protocol error").await;
        }
        Disconnect::IdleTimeout => {
            info!("Connection {} idle past the timeout", connection_id);
            let _ = sink.close(1000, "idle timeout").await;
        }
    }
    manager.remove_connection(&connection_id, &sink, &disconnect.reason());
}

async fn read_loop(
    read_half: &mut OwnedReadHalf,
    sink: &Arc<dyn ConnectionSink>,
    manager: &Arc<WebSocketManager>,
    connection_id: &str,
) -> Disconnect {
    let idle_timeout = manager.connection_timeout();
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_BYTES];

    loop {
        // Drain every complete frame already buffered before reading again
        loop {
            match decode_frame(&mut buffer) {
                Ok(Some(frame)) => {
                    match handle_frame(frame, sink, manager, connection_id).await {
                        Ok(FrameFlow::Continue) => {}
                        Ok(FrameFlow::PeerClose(code)) => return Disconnect::PeerClose(code),
                        Err(e) => return Disconnect::Protocol(e),
                    }
                }
                Ok(None) => break,
                Err(e) => return Disconnect::Protocol(e),
            }
        }

        match timeout(idle_timeout, read_half.read(&mut chunk)).await {
            Err(_) => return Disconnect::IdleTimeout,
            Ok(Err(e)) => return Disconnect::Read(e),
            Ok(Ok(0)) => return Disconnect::PeerGone,
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

async fn handle_frame(
    frame: Frame,
    sink: &Arc<dyn ConnectionSink>,
    manager: &Arc<WebSocketManager>,
    connection_id: &str,
) -> Result<FrameFlow, FrameError> {
    manager.record_activity(connection_id);

    match frame.opcode {
        Opcode::Text => {
            let text = String::from_utf8(frame.payload).map_err(|_| FrameError::InvalidUtf8)?;
            manager.record_message_received(connection_id);

            match serde_json::from_str::<WebSocketMessage>(&text) {
                Ok(message) => match message.payload {
                    MessagePayload::Ping => {
                        let pong = WebSocketMessage::new(MessagePayload::Pong);
                        manager.send_to_client(connection_id, pong).await;
                    }
                    _ => debug!("Inbound control message from {}", connection_id),
                },
                // A buggy page script is not a reason to drop the channel
                Err(e) => warn!("Unparseable message from {}: {}", connection_id, e),
            }
            Ok(FrameFlow::Continue)
        }
        Opcode::Binary => {
            debug!(
                "Ignoring {}-byte binary frame from {}",
                frame.payload.len(),
                connection_id
            );
            Ok(FrameFlow::Continue)
        }
        Opcode::Ping => {
            let _ = sink.send_frame(Opcode::Pong, frame.payload).await;
            Ok(FrameFlow::Continue)
        }
        Opcode::Pong => {
            manager.handle_pong(connection_id);
            Ok(FrameFlow::Continue)
        }
        Opcode::Close => {
            let code = close_code(&frame.payload);
            let _ = sink.close(code.unwrap_or(1000), "").await;
            Ok(FrameFlow::PeerClose(code))
        }
        // decode_frame already rejects continuations
        Opcode::Continuation => Err(FrameError::UnexpectedContinuation),
    }
}
