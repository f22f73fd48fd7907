// Envelope - Message types exchanged between gossip nodes
//
// Every protocol call carries an Envelope and is answered with a Reply:
// - PeerRequest/PeerResponse: membership discovery
// - Data: application payload being published or relayed

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Largest encoded frame accepted from the wire (5 MiB)
pub const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

// ============================================================================
// MESSAGE HASH
// ============================================================================

/// Deduplication key of a data message: SHA-256 over `nonce ‖ payload`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHash([u8; 32]);

impl MessageHash {
    /// Hash a nonce and payload
    pub fn compute(nonce: u64, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(nonce.to_be_bytes());
        hasher.update(payload);
        Self(hasher.finalize().into())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Discriminant of an envelope body
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    PeerRequest,
    PeerResponse,
    Data,
}

/// Content of an envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// Ask the receiver for up to `max_requested` of its neighbors
    PeerRequest { max_requested: u32 },
    /// Peers offered by the sender
    PeerResponse { peers: Vec<NodeId> },
    /// Application payload; `origin` is the publisher and survives relaying
    Data {
        origin: NodeId,
        nonce: u64,
        payload: Vec<u8>,
    },
}

/// A topic-scoped protocol message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    topic: String,
    /// Immediate hop: the requester or the relaying node
    sender: NodeId,
    body: Body,
}

impl Envelope {
    /// Create an envelope
    pub fn new(topic: impl Into<String>, sender: NodeId, body: Body) -> Self {
        Self {
            topic: topic.into(),
            sender,
            body,
        }
    }

    /// Create a peer-list request
    pub fn peer_request(topic: impl Into<String>, sender: NodeId, max_requested: u32) -> Self {
        Self::new(topic, sender, Body::PeerRequest { max_requested })
    }

    /// Create a data envelope published by `origin`
    pub fn data(topic: impl Into<String>, origin: NodeId, nonce: u64, payload: Vec<u8>) -> Self {
        let sender = origin.clone();
        Self::new(
            topic,
            sender,
            Body::Data {
                origin,
                nonce,
                payload,
            },
        )
    }

    /// Get the topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the immediate sender
    pub fn sender(&self) -> &NodeId {
        &self.sender
    }

    /// Get the body
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Consume into the body
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Get the message kind
    pub fn kind(&self) -> MessageKind {
        match self.body {
            Body::PeerRequest { .. } => MessageKind::PeerRequest,
            Body::PeerResponse { .. } => MessageKind::PeerResponse,
            Body::Data { .. } => MessageKind::Data,
        }
    }

    /// Dedup hash of a data envelope, `None` for membership messages
    pub fn hash(&self) -> Option<MessageHash> {
        match &self.body {
            Body::Data { nonce, payload, .. } => Some(MessageHash::compute(*nonce, payload)),
            _ => None,
        }
    }

    /// Copy of this envelope with the sender rewritten for the next hop
    pub fn relayed_by(&self, sender: NodeId) -> Self {
        Self {
            topic: self.topic.clone(),
            sender,
            body: self.body.clone(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

// ============================================================================
// REPLY
// ============================================================================

/// Why a node refused an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    /// The envelope belongs to a different topic
    TopicMismatch,
    /// The data message was already processed within the dedup window
    Duplicate,
    /// The frame could not be decoded
    Malformed,
    /// The node is shutting down
    Unavailable,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TopicMismatch => f.write_str("topic mismatch"),
            Self::Duplicate => f.write_str("duplicate message"),
            Self::Malformed => f.write_str("malformed envelope"),
            Self::Unavailable => f.write_str("node unavailable"),
        }
    }
}

/// Answer to an inbound envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    Peers(Vec<NodeId>),
    Rejected(Rejection),
}

impl Reply {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>, ProtocolError> {
    let bytes = postcard::to_allocvec(message)
        .map_err(|e| ProtocolError::SerializationFailed(e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge(bytes.len()));
    }
    Ok(bytes)
}

fn decode<M: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<M, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge(bytes.len()));
    }
    postcard::from_bytes(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
}
