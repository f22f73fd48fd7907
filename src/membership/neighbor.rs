// Neighbor List - Bounded, recency-ordered partial view of the network
//
// Each member owns one connection. New members are admitted only after a
// successful dial; when the view is full the least recently touched member
// is evicted and its connection released.

use crate::identity::NodeId;
use crate::transport::{Connection, Transport};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Default number of neighbors a node keeps
pub const DEFAULT_NEIGHBOR_CAPACITY: usize = 256;

struct Membership<C> {
    /// Front is most recently used
    order: VecDeque<NodeId>,
    connections: HashMap<NodeId, Arc<C>>,
    blacklist: HashSet<NodeId>,
}

impl<C> Membership<C> {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.order.iter().position(|member| member == id)
    }

    fn promote(&mut self, id: &NodeId) {
        if let Some(index) = self.position(id) {
            if let Some(member) = self.order.remove(index) {
                self.order.push_front(member);
            }
        }
    }

    fn demote(&mut self, id: &NodeId) {
        if let Some(index) = self.position(id) {
            if let Some(member) = self.order.remove(index) {
                self.order.push_back(member);
            }
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Arc<C>> {
        let connection = self.connections.remove(id)?;
        if let Some(index) = self.position(id) {
            self.order.remove(index);
        }
        Some(connection)
    }

    fn pop_least_recent(&mut self) -> Option<(NodeId, Arc<C>)> {
        let id = self.order.pop_back()?;
        let connection = self.connections.remove(&id)?;
        Some((id, connection))
    }

    /// Positions `0..len` chosen uniformly without replacement, ascending
    fn sample_positions(&self, k: usize) -> Vec<usize> {
        let len = self.order.len();
        let k = k.min(len);
        let mut positions = rand::seq::index::sample(&mut rand::thread_rng(), len, k).into_vec();
        positions.sort_unstable();
        positions
    }
}

enum Admission<C> {
    Rejected,
    AlreadyMember,
    Admitted { evicted: Option<(NodeId, Arc<C>)> },
}

/// Capacity-bounded membership table with blacklist and connection ownership
///
/// A single lock guards the table since sampling and reads reorder it too.
/// Dialing happens outside the lock: a slow peer never stalls other
/// membership operations, and concurrent admissions of the same id keep the
/// first connection and close the rest.
pub struct NeighborList<T: Transport> {
    capacity: usize,
    transport: Arc<T>,
    state: Mutex<Membership<T::Connection>>,
}

impl<T: Transport> NeighborList<T> {
    /// Create an empty list holding at most `capacity` members (minimum 1)
    pub fn new(capacity: usize, transport: Arc<T>) -> Self {
        Self {
            capacity: capacity.max(1),
            transport,
            state: Mutex::new(Membership {
                order: VecDeque::new(),
                connections: HashMap::new(),
                blacklist: HashSet::new(),
            }),
        }
    }

    /// Get the capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    /// Check if there are no members
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if `id` is a member
    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.lock().connections.contains_key(id)
    }

    /// Check if `id` can never become a member
    pub fn is_blacklisted(&self, id: &NodeId) -> bool {
        self.state.lock().blacklist.contains(id)
    }

    /// Bar `id` from membership, evicting it if present
    pub fn add_blacklist(&self, id: &NodeId) {
        let removed = {
            let mut state = self.state.lock();
            state.blacklist.insert(id.clone());
            state.remove(id)
        };
        if let Some(connection) = removed {
            connection.close();
        }
    }

    /// Touch `id`; returns true only when it was admitted as a new member
    ///
    /// Known members move to the most-recently-used position. Unknown ids are
    /// dialed first; a failed dial leaves the list untouched.
    pub async fn update(&self, id: &NodeId) -> bool {
        {
            let mut state = self.state.lock();
            if state.blacklist.contains(id) {
                return false;
            }
            if state.connections.contains_key(id) {
                state.promote(id);
                return false;
            }
        }

        let connection = match self.transport.dial(id).await {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                tracing::debug!(peer = %id, error = %e, "cannot dial node");
                return false;
            }
        };

        let admission = {
            let mut state = self.state.lock();
            if state.blacklist.contains(id) {
                Admission::Rejected
            } else if state.connections.contains_key(id) {
                state.promote(id);
                Admission::AlreadyMember
            } else {
                state.order.push_front(id.clone());
                state.connections.insert(id.clone(), Arc::clone(&connection));
                let evicted = if state.order.len() > self.capacity {
                    state.pop_least_recent()
                } else {
                    None
                };
                Admission::Admitted { evicted }
            }
        };

        match admission {
            Admission::Rejected | Admission::AlreadyMember => {
                connection.close();
                false
            }
            Admission::Admitted { evicted } => {
                if let Some((lru, lru_connection)) = evicted {
                    tracing::debug!(peer = %lru, "evicted least recently used neighbor");
                    lru_connection.close();
                }
                true
            }
        }
    }

    /// Re-dial a member after `failed` broke
    ///
    /// On success the member stays but moves to the least-recently-used
    /// position; on failure it is evicted. A failure reported on a connection
    /// that was already replaced is ignored, so a stale sender never tears
    /// down a healthy link. Returns whether `id` is still a member afterwards.
    pub async fn reconnect(&self, id: &NodeId, failed: &Arc<T::Connection>) -> bool {
        let old = match self.state.lock().connections.get(id) {
            Some(current) if Arc::ptr_eq(current, failed) => Arc::clone(current),
            Some(_) => {
                tracing::trace!(peer = %id, "ignoring failure on replaced connection");
                return true;
            }
            None => return false,
        };
        old.close();

        match self.transport.dial(id).await {
            Ok(connection) => {
                let connection = Arc::new(connection);
                let replaced = {
                    let mut state = self.state.lock();
                    match state.connections.get_mut(id) {
                        Some(current) if Arc::ptr_eq(current, &old) => {
                            *current = Arc::clone(&connection);
                            state.demote(id);
                            true
                        }
                        // Deleted or replaced while we were dialing
                        _ => false,
                    }
                };
                if !replaced {
                    connection.close();
                    return self.contains(id);
                }
                true
            }
            Err(e) => {
                tracing::debug!(peer = %id, error = %e, "reconnect failed, evicting neighbor");
                let mut state = self.state.lock();
                let stale = state
                    .connections
                    .get(id)
                    .is_some_and(|current| Arc::ptr_eq(current, &old));
                if stale {
                    state.remove(id);
                    false
                } else {
                    state.connections.contains_key(id)
                }
            }
        }
    }

    /// Remove a member and release its connection
    pub fn delete(&self, id: &NodeId) -> bool {
        let removed = self.state.lock().remove(id);
        match removed {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Up to `k` distinct members chosen uniformly at random
    pub fn sample(&self, k: usize) -> Vec<NodeId> {
        let state = self.state.lock();
        state
            .sample_positions(k)
            .into_iter()
            .filter_map(|position| state.order.get(position).cloned())
            .collect()
    }

    /// Like [`sample`](Self::sample), paired with each member's connection
    pub fn sample_connections(&self, k: usize) -> Vec<(NodeId, Arc<T::Connection>)> {
        let state = self.state.lock();
        state
            .sample_positions(k)
            .into_iter()
            .filter_map(|position| {
                let id = state.order.get(position)?;
                let connection = state.connections.get(id)?;
                Some((id.clone(), Arc::clone(connection)))
            })
            .collect()
    }

    /// Connection owned for a member
    pub fn connection(&self, id: &NodeId) -> Option<Arc<T::Connection>> {
        self.state.lock().connections.get(id).cloned()
    }

    /// Current members, most recently used first
    pub fn peers(&self) -> Vec<NodeId> {
        self.state.lock().order.iter().cloned().collect()
    }

    /// Remove every member, releasing all connections
    pub fn clear(&self) {
        let released: Vec<Arc<T::Connection>> = {
            let mut state = self.state.lock();
            state.order.clear();
            state.connections.drain().map(|(_, connection)| connection).collect()
        };
        for connection in released {
            connection.close();
        }
    }
}

impl<T: Transport> Drop for NeighborList<T> {
    fn drop(&mut self) {
        for connection in self.state.get_mut().connections.values() {
            connection.close();
        }
    }
}
