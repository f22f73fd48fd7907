// TCP Transport Implementation
// Request/reply over TCP: every call is one length-prefixed postcard frame each way

use crate::identity::NodeId;
use crate::protocol::{Envelope, ProtocolError, Rejection, Reply};
use crate::transport::{
    Connection, InboundHandler, Listener, Transport, TransportConfig, TransportError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ============================================================================
// TCP TRANSPORT CONFIG
// ============================================================================

/// Configuration for TCP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Enable TCP_NODELAY
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            nodelay: true,
        }
    }
}

impl TcpTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

// ============================================================================
// FRAMING
// ============================================================================

async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(bytes.len())
        .map_err(|_| TransportError::Protocol(ProtocolError::MessageTooLarge(bytes.len())))?;
    writer.write_u32(len).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > max_frame_size {
        return Err(TransportError::Protocol(ProtocolError::MessageTooLarge(len)));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

// ============================================================================
// TCP CONNECTION
// ============================================================================

/// Outbound TCP connection to one peer
///
/// Calls are serialized on the stream. Any IO failure or timeout poisons the
/// connection; the owner is expected to reconnect.
pub struct TcpConnection {
    peer: NodeId,
    config: TransportConfig,
    stream: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl TcpConnection {
    async fn exchange(
        stream: &mut TcpStream,
        request: &[u8],
        max_frame_size: usize,
    ) -> Result<Reply, TransportError> {
        write_frame(stream, request)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let frame = read_frame(stream, max_frame_size)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        Ok(Reply::from_bytes(&frame)?)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn peer(&self) -> &NodeId {
        &self.peer
    }

    async fn send(&self, envelope: &Envelope) -> Result<Reply, TransportError> {
        let request = envelope.to_bytes()?;

        let mut guard = self.stream.lock().await;
        if self.is_closed() {
            guard.take();
            return Err(TransportError::Closed);
        }
        let stream = guard.as_mut().ok_or(TransportError::Closed)?;

        let result = timeout(
            self.config.message_timeout,
            Self::exchange(stream, &request, self.config.max_frame_size),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));

        if result.is_err() {
            // The stream may hold half a frame now
            guard.take();
            self.closed.store(true, Ordering::Release);
        }
        result
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // A send in flight drops the stream itself once it sees the flag
        if let Ok(mut guard) = self.stream.try_lock() {
            guard.take();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// TCP TRANSPORT
// ============================================================================

/// TCP transport implementation
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<dyn InboundHandler>,
        config: TcpTransportConfig,
        cancel: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    stream.set_nodelay(config.nodelay).ok();
                    tracing::trace!(remote = %addr, "accepted connection");
                    tokio::spawn(Self::serve_stream(
                        stream,
                        Arc::clone(&handler),
                        config.base.max_frame_size,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::debug!(error = %e, "accept failed");
                }
            }
        }
        tracing::debug!("tcp accept loop stopped");
    }

    async fn serve_stream(
        mut stream: TcpStream,
        handler: Arc<dyn InboundHandler>,
        max_frame_size: usize,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut stream, max_frame_size) => frame,
            };

            let reply = match frame {
                Ok(bytes) => match Envelope::from_bytes(&bytes) {
                    Ok(envelope) => handler.handle(envelope).await,
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping malformed envelope");
                        Reply::Rejected(Rejection::Malformed)
                    }
                },
                Err(TransportError::Protocol(e)) => {
                    // Oversized frame: the stream cannot be resynchronized
                    tracing::debug!(error = %e, "closing stream after oversized frame");
                    if let Ok(bytes) = Reply::Rejected(Rejection::Malformed).to_bytes() {
                        let _ = write_frame(&mut stream, &bytes).await;
                    }
                    break;
                }
                Err(_) => break, // peer hung up
            };

            let bytes = match reply.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot encode reply");
                    break;
                }
            };
            if write_frame(&mut stream, &bytes).await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn dial(&self, node: &NodeId) -> Result<TcpConnection, TransportError> {
        let addr = node
            .to_socket_addr()
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;

        let stream = timeout(self.config.base.connection_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", node, e)))?;
        stream.set_nodelay(self.config.nodelay).ok();

        Ok(TcpConnection {
            peer: node.clone(),
            config: self.config.base.clone(),
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        })
    }

    async fn listen(
        &self,
        bind: &NodeId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Listener, TransportError> {
        self.config.base.validate()?;
        let addr = bind
            .to_socket_addr()
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", bind, e)))?;
        let local_id = NodeId::from(listener.local_addr()?);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::accept_loop(
            listener,
            handler,
            self.config.clone(),
            cancel.clone(),
        ));

        tracing::info!(listen = %local_id, "tcp transport listening");
        Ok(Listener::new(local_id, cancel, task))
    }
}
