// Gossip module - HOW MESSAGES SPREAD
// Epidemic broadcast over a bounded partial view, with periodic peer discovery

mod config;
mod engine;
mod state;

pub use config::GossipConfig;
pub use engine::{GossipEngine, GossipError, GossipStats};
pub use state::NodeState;
