// Transport Traits and Core Types
// Defines the collaborator contract the gossip engine dials, sends and listens through

use crate::identity::NodeId;
use crate::protocol::{Envelope, ProtocolError, Reply, MAX_FRAME_SIZE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Base configuration shared by transport implementations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connection establishment timeout
    pub connection_timeout: Duration,
    /// Timeout for one request/reply exchange
    pub message_timeout: Duration,
    /// Largest frame accepted in either direction
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            message_timeout: Duration::from_secs(10),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.connection_timeout.is_zero() || self.message_timeout.is_zero() {
            return Err(TransportError::InvalidConfig("timeouts cannot be zero".to_string()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_FRAME_SIZE {
            return Err(TransportError::InvalidConfig(format!(
                "max_frame_size must be within 1..={}",
                MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Cannot bind {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    IoError(String),
}

impl TransportError {
    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Closed | Self::Timeout | Self::IoError(_)
        )
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

// ============================================================================
// LISTENER
// ============================================================================

/// Handle to a running accept loop
///
/// Dropping the handle stops the loop; in-flight requests finish on their own.
#[derive(Debug)]
pub struct Listener {
    local_id: NodeId,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Wrap an accept-loop task that exits when `cancel` fires
    pub fn new(local_id: NodeId, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            local_id,
            cancel,
            task: Some(task),
        }
    }

    /// The id the listener is actually bound to
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Check if the accept loop is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop accepting and wait for the accept loop to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(listener = %self.local_id, error = %e, "accept loop ended abnormally");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// TRANSPORT TRAITS
// ============================================================================

/// Receiver side of the protocol, implemented by the gossip engine
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Serve one inbound envelope
    async fn handle(&self, envelope: Envelope) -> Reply;
}

/// An established channel to one peer
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// The peer this connection was dialed to
    fn peer(&self) -> &NodeId;

    /// Deliver an envelope and wait for the peer's reply
    async fn send(&self, envelope: &Envelope) -> Result<Reply, TransportError>;

    /// Release the connection; idempotent
    fn close(&self);

    /// Check if `close` was called or the channel broke
    fn is_closed(&self) -> bool;
}

/// Abstract transport for dialing peers and accepting their calls
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a connection to a peer
    async fn dial(&self, node: &NodeId) -> Result<Self::Connection, TransportError>;

    /// Bind `bind` and serve inbound envelopes with `handler`
    async fn listen(
        &self,
        bind: &NodeId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Listener, TransportError>;
}
