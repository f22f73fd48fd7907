// Gossip Engine - The heart of epidemic broadcast
//
// Orchestrates one node of a topic-scoped gossip network:
// - Join: seed the partial view from bootstrap nodes
// - Discovery: periodically ask sampled neighbors for more peers
// - Publish: deliver locally, then push to a wide sample of neighbors
// - Relay: deliver first-seen messages and push them to a narrower sample
//
// Every peer interaction runs as its own task; a failing peer only ever
// affects itself.

use crate::buffer::DeliveryQueue;
use crate::filter::DedupFilter;
use crate::gossip::config::peer_request_size;
use crate::gossip::{GossipConfig, NodeState};
use crate::identity::NodeId;
use crate::membership::NeighborList;
use crate::protocol::{Body, Envelope, MessageHash, ProtocolError, Rejection, Reply};
use crate::transport::{InboundHandler, Listener, Transport, TransportError};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Gossip-related errors
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("Topic mismatch")]
    TopicMismatch,

    #[error("Message already seen")]
    DuplicateMessage,

    #[error("Connection failure: {0}")]
    Connection(#[from] TransportError),

    #[error("Cannot bind listen endpoint: {0}")]
    Bind(TransportError),

    #[error("Malformed envelope: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("Peer rejected envelope: {0}")]
    PeerRejected(Rejection),

    #[error("Cannot {operation} while node is {state}")]
    InvalidState {
        state: NodeState,
        operation: &'static str,
    },

    #[error("Peer discovery already started")]
    AlreadyDiscovering,

    #[error("Node stopped")]
    Stopped,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GossipError {
    /// Check if the failure should make us re-dial the peer
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Malformed(_) | Self::PeerRejected(_)
        )
    }

    /// Map a peer's reply onto the send contract: rejections become errors
    pub fn check_reply(reply: Reply) -> Result<Reply, GossipError> {
        match reply {
            Reply::Rejected(Rejection::TopicMismatch) => Err(Self::TopicMismatch),
            Reply::Rejected(Rejection::Duplicate) => Err(Self::DuplicateMessage),
            Reply::Rejected(rejection) => Err(Self::PeerRejected(rejection)),
            reply => Ok(reply),
        }
    }
}

/// Statistics about the gossip engine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GossipStats {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub duplicates_rejected: u64,
    pub relays_sent: u64,
    pub relay_failures: u64,
    pub reconnects: u64,
    pub discovery_rounds: u64,
    pub topic_mismatches: u64,
}

#[derive(Default)]
struct Counters {
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    duplicates_rejected: AtomicU64,
    relays_sent: AtomicU64,
    relay_failures: AtomicU64,
    reconnects: AtomicU64,
    discovery_rounds: AtomicU64,
    topic_mismatches: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> GossipStats {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        GossipStats {
            messages_published: read(&self.messages_published),
            messages_delivered: read(&self.messages_delivered),
            messages_dropped: read(&self.messages_dropped),
            duplicates_rejected: read(&self.duplicates_rejected),
            relays_sent: read(&self.relays_sent),
            relay_failures: read(&self.relay_failures),
            reconnects: read(&self.reconnects),
            discovery_rounds: read(&self.discovery_rounds),
            topic_mismatches: read(&self.topic_mismatches),
        }
    }
}

struct DiscoveryTask {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

struct Inner<T: Transport> {
    id: NodeId,
    topic: String,
    config: GossipConfig,
    transport: Arc<T>,
    neighbors: NeighborList<T>,
    filter: DedupFilter,
    inbox: DeliveryQueue<Vec<u8>>,
    state: Mutex<NodeState>,
    /// Fires on close; parent of every background task's token
    shutdown: CancellationToken,
    discovery: Mutex<Option<DiscoveryTask>>,
    listener: Mutex<Option<Listener>>,
    counters: Counters,
}

/// One node of a topic-scoped gossip network
///
/// Cheap to clone; all clones drive the same node. Publishing and relaying
/// spawn tasks, so the engine must be used inside a tokio runtime.
pub struct GossipEngine<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for GossipEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> GossipEngine<T> {
    /// Create a node identified by `id` serving `topic`
    ///
    /// `id` is both the listen address and the address peers dial back, so
    /// it must name a concrete port.
    pub fn new(
        id: NodeId,
        topic: impl Into<String>,
        transport: T,
        config: GossipConfig,
    ) -> Result<Self, GossipError> {
        config.validate()?;
        if id.port() == 0 {
            return Err(GossipError::InvalidConfig(format!(
                "node id {} needs a fixed port",
                id
            )));
        }

        let transport = Arc::new(transport);
        let neighbors = NeighborList::new(config.neighbor_capacity, Arc::clone(&transport));
        neighbors.add_blacklist(&id);

        let inner = Inner {
            id,
            topic: topic.into(),
            filter: DedupFilter::new(config.dedup_window),
            inbox: DeliveryQueue::new(config.queue_capacity),
            config,
            transport,
            neighbors,
            state: Mutex::new(NodeState::Created),
            shutdown: CancellationToken::new(),
            discovery: Mutex::new(None),
            listener: Mutex::new(None),
            counters: Counters::default(),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Get our node id
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Get the topic
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Get the configuration
    pub fn config(&self) -> &GossipConfig {
        &self.inner.config
    }

    /// Get the lifecycle state
    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    /// Get statistics
    pub fn stats(&self) -> GossipStats {
        self.inner.counters.snapshot()
    }

    /// Get the membership view
    pub fn neighbors(&self) -> &NeighborList<T> {
        &self.inner.neighbors
    }

    /// Current neighbors, most recently used first
    pub fn peers(&self) -> Vec<NodeId> {
        self.inner.neighbors.peers()
    }

    /// Number of neighbors
    pub fn neighbor_count(&self) -> usize {
        self.inner.neighbors.len()
    }

    /// Payloads waiting for [`get_msg`](Self::get_msg)
    pub fn pending_messages(&self) -> usize {
        self.inner.inbox.len()
    }

    /// Check if the discovery loop is running
    pub fn is_discovering(&self) -> bool {
        self.inner.discovery.lock().is_some()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Bind our id on the transport and start serving inbound calls
    ///
    /// Returns the id actually bound. Failing to bind is fatal for the node.
    pub async fn listen(&self) -> Result<NodeId, GossipError> {
        self.inner.expect_state(NodeState::Created, "listen")?;

        let handler: Arc<dyn InboundHandler> = Arc::new(InboundService {
            inner: Arc::downgrade(&self.inner),
        });
        let listener = self
            .inner
            .transport
            .listen(&self.inner.id, handler)
            .await
            .map_err(GossipError::Bind)?;
        let local_id = listener.local_id().clone();

        // Store first so a racing close() can shut it down
        *self.inner.listener.lock() = Some(listener);
        if let Err(e) = self.inner.transition(NodeState::Listening, "listen") {
            let listener = self.inner.listener.lock().take();
            if let Some(listener) = listener {
                listener.shutdown().await;
            }
            return Err(e);
        }

        info!(node = %self.inner.id, topic = %self.inner.topic, "listening");
        Ok(local_id)
    }

    /// Seed the view from bootstrap nodes and start peer discovery
    ///
    /// Unreachable bootstrap nodes are skipped. Returns how many were admitted.
    pub async fn join(&self, bootstrap: &[NodeId]) -> Result<usize, GossipError> {
        self.inner.transition(NodeState::Joining, "join")?;

        let admitted = join_all(bootstrap.iter().map(|id| self.inner.neighbors.update(id)))
            .await
            .into_iter()
            .filter(|is_new| *is_new)
            .count();
        if admitted < bootstrap.len() {
            warn!(
                requested = bootstrap.len(),
                admitted,
                "some bootstrap nodes were not admitted"
            );
        }

        self.inner.start_discovery()?;
        self.inner.transition(NodeState::SteadyState, "join")?;

        info!(node = %self.inner.id, admitted, "joined network");
        Ok(admitted)
    }

    /// Restart peer discovery after [`stop_discover`](Self::stop_discover)
    pub fn start_discover(&self) -> Result<(), GossipError> {
        self.inner.expect_state(NodeState::SteadyState, "start discovery")?;
        self.inner.start_discovery()
    }

    /// Stop the discovery loop; returns false if it was not running
    pub fn stop_discover(&self) -> bool {
        match self.inner.discovery.lock().take() {
            Some(discovery) => {
                discovery.cancel.cancel();
                debug!(node = %self.inner.id, "stopping peer discovery");
                true
            }
            None => false,
        }
    }

    /// Run one discovery round now; returns how many peers were asked
    pub fn discover(&self) -> usize {
        self.inner.discovery_round()
    }

    /// Stop discovery, release the listen endpoint and all neighbor connections
    ///
    /// Relays already in flight are not cancelled. Pending [`get_msg`](Self::get_msg)
    /// calls drain what is queued and then fail with [`GossipError::Stopped`].
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), NodeState::Stopped);
        if previous == NodeState::Stopped {
            return;
        }

        self.inner.shutdown.cancel();
        self.stop_discover();

        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            listener.shutdown().await;
        }
        self.inner.neighbors.clear();

        info!(node = %self.inner.id, "node stopped");
    }

    // ========================================================================
    // MESSAGES
    // ========================================================================

    /// Publish a payload to the network
    ///
    /// The payload is delivered to our own queue first, then pushed to up to
    /// `broadcast_fanout` neighbors, each in its own task.
    pub fn gossip(&self, payload: impl Into<Vec<u8>>) -> Result<MessageHash, GossipError> {
        let inner = &self.inner;
        if !inner.state().is_active() {
            return Err(GossipError::Stopped);
        }

        let payload = payload.into();
        let nonce: u64 = rand::random();
        let hash = MessageHash::compute(nonce, &payload);

        inner.filter.check(&hash);
        inner.deliver(payload.clone());
        Counters::bump(&inner.counters.messages_published);

        let envelope = Envelope::data(inner.topic.clone(), inner.id.clone(), nonce, payload);
        let targets = inner.neighbors.sample_connections(inner.config.broadcast_fanout());
        debug!(hash = %hash, targets = targets.len(), "publishing message");
        inner.relay(envelope, targets);

        Ok(hash)
    }

    /// Wait for the next delivered payload, oldest first
    pub async fn get_msg(&self) -> Result<Vec<u8>, GossipError> {
        self.inner
            .inbox
            .pop_or_cancel(&self.inner.shutdown)
            .await
            .ok_or(GossipError::Stopped)
    }

    /// Take the next delivered payload if one is queued
    pub fn try_get_msg(&self) -> Option<Vec<u8>> {
        self.inner.inbox.try_pop()
    }
}

// ============================================================================
// NODE INTERNALS
// ============================================================================

impl<T: Transport> Inner<T> {
    fn state(&self) -> NodeState {
        *self.state.lock()
    }

    fn expect_state(&self, expected: NodeState, operation: &'static str) -> Result<(), GossipError> {
        match self.state() {
            state if state == expected => Ok(()),
            NodeState::Stopped => Err(GossipError::Stopped),
            state => Err(GossipError::InvalidState { state, operation }),
        }
    }

    fn transition(&self, target: NodeState, operation: &'static str) -> Result<(), GossipError> {
        let mut state = self.state.lock();
        if *state == NodeState::Stopped {
            return Err(GossipError::Stopped);
        }
        if !state.can_transition_to(target) {
            return Err(GossipError::InvalidState {
                state: *state,
                operation,
            });
        }
        *state = target;
        Ok(())
    }

    fn deliver(&self, payload: Vec<u8>) {
        if let Some(dropped) = self.inbox.push(payload) {
            Counters::bump(&self.counters.messages_dropped);
            debug!(bytes = dropped.len(), "delivery queue full, dropped oldest payload");
        }
        Counters::bump(&self.counters.messages_delivered);
    }

    /// Admit `peer` unless the node is stopped
    ///
    /// A dial that was in flight when `close` cleared the view is undone.
    async fn admit(&self, peer: &NodeId) {
        if !self.state().is_active() {
            return;
        }
        if self.neighbors.update(peer).await {
            if !self.state().is_active() {
                self.neighbors.delete(peer);
                return;
            }
            debug!(node = %self.id, peer = %peer, "new neighbor");
        }
    }

    async fn reconnect(&self, peer: &NodeId, failed: &Arc<T::Connection>) {
        Counters::bump(&self.counters.reconnects);
        if !self.neighbors.reconnect(peer, failed).await {
            debug!(peer = %peer, "neighbor dropped after failed reconnect");
        }
    }

    fn expel(&self, peer: &NodeId) {
        Counters::bump(&self.counters.topic_mismatches);
        warn!(peer = %peer, topic = %self.topic, "peer serves another topic, blacklisting");
        self.neighbors.add_blacklist(peer);
    }

    /// One request/reply exchange bounded by the configured timeout
    async fn call(
        &self,
        connection: &T::Connection,
        envelope: &Envelope,
    ) -> Result<Reply, GossipError> {
        use crate::transport::Connection as _;

        let reply = tokio::time::timeout(self.config.request_timeout, connection.send(envelope))
            .await
            .map_err(|_| TransportError::Timeout)??;
        GossipError::check_reply(reply)
    }

    // ------------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------------

    fn relay(self: &Arc<Self>, envelope: Envelope, targets: Vec<(NodeId, Arc<T::Connection>)>) {
        if targets.is_empty() {
            return;
        }
        let envelope = Arc::new(envelope);
        for (peer, connection) in targets {
            let inner = Arc::clone(self);
            let envelope = Arc::clone(&envelope);
            tokio::spawn(async move {
                inner.relay_to(&peer, &connection, &envelope).await;
            });
        }
    }

    /// Push one envelope to one neighbor
    ///
    /// Duplicates count as delivered. A peer answering `TopicMismatch` is
    /// blacklisted instead of re-dialed: it belongs to another network and
    /// reconnecting would only repeat the rejection.
    async fn relay_to(
        &self,
        peer: &NodeId,
        connection: &Arc<T::Connection>,
        envelope: &Envelope,
    ) {
        match self.call(connection, envelope).await {
            Ok(_) => Counters::bump(&self.counters.relays_sent),
            Err(GossipError::DuplicateMessage) => {
                Counters::bump(&self.counters.relays_sent);
                trace!(peer = %peer, "peer already had message");
            }
            Err(GossipError::TopicMismatch) => self.expel(peer),
            Err(e) => {
                Counters::bump(&self.counters.relay_failures);
                debug!(peer = %peer, error = %e, "relay failed, reconnecting");
                self.reconnect(peer, connection).await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    fn start_discovery(self: &Arc<Self>) -> Result<(), GossipError> {
        let mut slot = self.discovery.lock();
        if slot.is_some() {
            return Err(GossipError::AlreadyDiscovering);
        }

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(discovery_loop(
            Arc::downgrade(self),
            cancel.clone(),
            self.config.discovery_interval,
        ));
        *slot = Some(DiscoveryTask {
            cancel,
            _task: task,
        });

        debug!(node = %self.id, "peer discovery started");
        Ok(())
    }

    fn discovery_round(self: &Arc<Self>) -> usize {
        let members = self.neighbors.len();
        let capacity = self.config.neighbor_capacity;
        if members >= capacity {
            trace!(node = %self.id, "neighbor list full, skipping discovery");
            return 0;
        }

        let fanout = self.config.discovery_fanout.min(members);
        if fanout == 0 {
            trace!(node = %self.id, "no neighbors to ask for peers");
            return 0;
        }

        let wanted = peer_request_size(capacity - members, fanout);
        let request = Arc::new(Envelope::peer_request(
            self.topic.clone(),
            self.id.clone(),
            u32::try_from(wanted).unwrap_or(u32::MAX),
        ));

        let targets = self.neighbors.sample_connections(fanout);
        let asked = targets.len();
        for (peer, connection) in targets {
            let inner = Arc::clone(self);
            let request = Arc::clone(&request);
            tokio::spawn(async move {
                inner.request_peers(&peer, &connection, &request).await;
            });
        }

        Counters::bump(&self.counters.discovery_rounds);
        trace!(node = %self.id, asked, wanted, "discovery round");
        asked
    }

    /// Ask one neighbor for peers; mismatched topics are blacklisted as in relay
    async fn request_peers(
        &self,
        peer: &NodeId,
        connection: &Arc<T::Connection>,
        request: &Envelope,
    ) {
        match self.call(connection, request).await {
            Ok(Reply::Peers(offered)) => {
                trace!(peer = %peer, offered = offered.len(), "peer list received");
                for candidate in &offered {
                    self.admit(candidate).await;
                }
            }
            Ok(reply) => {
                debug!(peer = %peer, ?reply, "unexpected reply to peer request");
            }
            Err(GossipError::TopicMismatch) => self.expel(peer),
            Err(e) => {
                debug!(peer = %peer, error = %e, "peer request failed, reconnecting");
                self.reconnect(peer, connection).await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn serve(self: &Arc<Self>, envelope: Envelope) -> Reply {
        if !self.state().is_active() {
            return Reply::Rejected(Rejection::Unavailable);
        }
        if envelope.topic() != self.topic {
            Counters::bump(&self.counters.topic_mismatches);
            debug!(
                peer = %envelope.sender(),
                topic = envelope.topic(),
                "rejecting envelope for another topic"
            );
            return Reply::Rejected(Rejection::TopicMismatch);
        }

        let sender = envelope.sender().clone();
        match envelope.body() {
            Body::PeerRequest { max_requested } => {
                self.admit(&sender).await;
                Reply::Peers(self.neighbors.sample(*max_requested as usize))
            }
            Body::PeerResponse { peers } => {
                for peer in peers {
                    self.admit(peer).await;
                }
                self.admit(&sender).await;
                Reply::Ack
            }
            Body::Data { nonce, payload, .. } => {
                self.admit(&sender).await;

                let hash = MessageHash::compute(*nonce, payload);
                if !self.filter.check(&hash) {
                    Counters::bump(&self.counters.duplicates_rejected);
                    trace!(hash = %hash, peer = %sender, "duplicate message");
                    return Reply::Rejected(Rejection::Duplicate);
                }

                trace!(hash = %hash, peer = %sender, "new message");
                self.deliver(payload.clone());
                let targets = self.neighbors.sample_connections(self.config.gossip_fanout);
                self.relay(envelope.relayed_by(self.id.clone()), targets);
                Reply::Ack
            }
        }
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn discovery_loop<T: Transport>(
    inner: Weak<Inner<T>>,
    cancel: CancellationToken,
    interval: Duration,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match inner.upgrade() {
            Some(inner) => {
                inner.discovery_round();
            }
            None => break,
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("peer discovery stopped");
}

/// Inbound side handed to the transport; holds the node weakly so a
/// forgotten listener never keeps a dropped node alive
struct InboundService<T: Transport> {
    inner: Weak<Inner<T>>,
}

#[async_trait]
impl<T: Transport> InboundHandler for InboundService<T> {
    async fn handle(&self, envelope: Envelope) -> Reply {
        match self.inner.upgrade() {
            Some(inner) => inner.serve(envelope).await,
            None => Reply::Rejected(Rejection::Unavailable),
        }
    }
}
