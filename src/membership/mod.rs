// Membership module - WHO WE KNOW
// Bounded partial view of the network used for relaying and discovery

mod neighbor;

pub use neighbor::{NeighborList, DEFAULT_NEIGHBOR_CAPACITY};
