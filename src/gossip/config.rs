// Gossip Config - Fixed parameters of a gossip node

use crate::buffer::DEFAULT_QUEUE_CAPACITY;
use crate::filter::DEFAULT_DEDUP_WINDOW;
use crate::gossip::GossipError;
use crate::membership::DEFAULT_NEIGHBOR_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the gossip engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Maximum neighbors kept in the partial view
    pub neighbor_capacity: usize,
    /// How long a seen message hash suppresses duplicates
    pub dedup_window: Duration,
    /// Payloads buffered for the application before the oldest is dropped
    pub queue_capacity: usize,
    /// Peers a received message is relayed to
    pub gossip_fanout: usize,
    /// Peers a fresh publish is sent to; `None` follows `neighbor_capacity`
    pub broadcast_fanout: Option<usize>,
    /// Peers asked for neighbors per discovery round
    pub discovery_fanout: usize,
    /// Pause between discovery rounds
    pub discovery_interval: Duration,
    /// Deadline for one relay or discovery call
    pub request_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            neighbor_capacity: DEFAULT_NEIGHBOR_CAPACITY,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            gossip_fanout: 16,
            broadcast_fanout: None,
            discovery_fanout: 8,
            discovery_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl GossipConfig {
    /// Create a new config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set neighbor capacity
    pub fn with_neighbor_capacity(mut self, capacity: usize) -> Self {
        self.neighbor_capacity = capacity;
        self
    }

    /// Set dedup window
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Set delivery queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set relay fanout
    pub fn with_gossip_fanout(mut self, fanout: usize) -> Self {
        self.gossip_fanout = fanout;
        self
    }

    /// Set publish fanout
    pub fn with_broadcast_fanout(mut self, fanout: usize) -> Self {
        self.broadcast_fanout = Some(fanout);
        self
    }

    /// Set discovery fanout
    pub fn with_discovery_fanout(mut self, fanout: usize) -> Self {
        self.discovery_fanout = fanout;
        self
    }

    /// Set discovery interval
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Set per-call timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Effective publish fanout
    pub fn broadcast_fanout(&self) -> usize {
        self.broadcast_fanout.unwrap_or(self.neighbor_capacity)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), GossipError> {
        let invalid = |reason: &str| Err(GossipError::InvalidConfig(reason.to_string()));

        if self.neighbor_capacity == 0 {
            return invalid("neighbor_capacity cannot be 0");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity cannot be 0");
        }
        if self.discovery_fanout == 0 {
            return invalid("discovery_fanout cannot be 0");
        }
        if self.dedup_window.is_zero() {
            return invalid("dedup_window cannot be zero");
        }
        if self.discovery_interval.is_zero() || self.request_timeout.is_zero() {
            return invalid("discovery_interval and request_timeout cannot be zero");
        }
        Ok(())
    }
}

/// Ids requested from each peer so one round can refill the view with 20% slack
pub(crate) fn peer_request_size(missing: usize, fanout: usize) -> usize {
    if fanout == 0 {
        return 0;
    }
    (missing * 6).div_ceil(fanout * 5)
}
