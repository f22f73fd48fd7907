// gossipmesh - Topic-scoped epidemic broadcast
//
// Modules, leaves first:
// - identity: peer ids that double as dial addresses
// - protocol: envelopes and replies exchanged between nodes
// - filter: time-windowed duplicate suppression
// - buffer: bounded delivery queue for the application
// - transport: dial/send/listen contract with TCP and in-process backends
// - membership: bounded, recency-ordered neighbor list
// - gossip: the node itself

pub mod buffer;
pub mod filter;
pub mod gossip;
pub mod identity;
pub mod membership;
pub mod protocol;
pub mod transport;

pub use gossip::{GossipConfig, GossipEngine, GossipError, GossipStats, NodeState};
pub use identity::NodeId;
