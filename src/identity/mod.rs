// Identity module - WHO A PEER IS
// Peer identities double as dial addresses

mod node_id;

pub use node_id::{NodeId, NodeIdError};
