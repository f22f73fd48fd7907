// Memory Transport Implementation
// In-process network for simulations and tests: dialing looks up the target's
// handler, sending runs it directly after a full encode/decode round trip

use crate::identity::NodeId;
use crate::protocol::{Envelope, Reply};
use crate::transport::{Connection, InboundHandler, Listener, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Registration {
    generation: u64,
    handler: Arc<dyn InboundHandler>,
}

#[derive(Default)]
struct NetworkState {
    listeners: RwLock<HashMap<NodeId, Registration>>,
    next_generation: AtomicU64,
}

/// Shared registry of in-process listeners
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this network
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
        }
    }

    /// Check if a node is accepting calls
    pub fn is_listening(&self, node: &NodeId) -> bool {
        self.state.listeners.read().contains_key(node)
    }

    /// Number of listening nodes
    pub fn listener_count(&self) -> usize {
        self.state.listeners.read().len()
    }

    /// Drop a node off the network as if it crashed; returns false if it was not listening
    pub fn disconnect(&self, node: &NodeId) -> bool {
        self.state.listeners.write().remove(node).is_some()
    }

    fn handler(&self, node: &NodeId) -> Option<Arc<dyn InboundHandler>> {
        self.state
            .listeners
            .read()
            .get(node)
            .map(|registration| Arc::clone(&registration.handler))
    }

    fn register(
        &self,
        node: &NodeId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<u64, TransportError> {
        let mut listeners = self.state.listeners.write();
        if listeners.contains_key(node) {
            return Err(TransportError::BindFailed(format!("{}: address in use", node)));
        }
        let generation = self.state.next_generation.fetch_add(1, Ordering::Relaxed);
        listeners.insert(
            node.clone(),
            Registration {
                generation,
                handler,
            },
        );
        Ok(generation)
    }

    fn deregister(&self, node: &NodeId, generation: u64) {
        let mut listeners = self.state.listeners.write();
        if listeners.get(node).is_some_and(|r| r.generation == generation) {
            listeners.remove(node);
        }
    }
}

/// Connection to a node on a [`MemoryNetwork`]
pub struct MemoryConnection {
    peer: NodeId,
    network: MemoryNetwork,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn peer(&self) -> &NodeId {
        &self.peer
    }

    async fn send(&self, envelope: &Envelope) -> Result<Reply, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let handler = self.network.handler(&self.peer).ok_or_else(|| {
            TransportError::ConnectionFailed(format!("{}: not listening", self.peer))
        })?;

        // Same bytes a socket would carry
        let request = Envelope::from_bytes(&envelope.to_bytes()?)?;
        let reply = handler.handle(request).await;
        Ok(Reply::from_bytes(&reply.to_bytes()?)?)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Transport over a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Get the network this transport is attached to
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn dial(&self, node: &NodeId) -> Result<MemoryConnection, TransportError> {
        if !self.network.is_listening(node) {
            return Err(TransportError::ConnectionFailed(format!("{}: not listening", node)));
        }
        Ok(MemoryConnection {
            peer: node.clone(),
            network: self.network.clone(),
            closed: AtomicBool::new(false),
        })
    }

    async fn listen(
        &self,
        bind: &NodeId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Listener, TransportError> {
        let generation = self.network.register(bind, handler)?;

        let cancel = CancellationToken::new();
        let network = self.network.clone();
        let node = bind.clone();
        let stopped = cancel.clone();
        let task = tokio::spawn(async move {
            stopped.cancelled().await;
            network.deregister(&node, generation);
        });

        Ok(Listener::new(bind.clone(), cancel, task))
    }
}
