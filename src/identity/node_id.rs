use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("Invalid node id format: {0}")]
    InvalidFormat(String),

    #[error("Invalid port in node id: {0}")]
    InvalidPort(String),

    #[error("Cannot resolve node id {0}: {1}")]
    Unresolvable(String, String),
}

/// Opaque peer identity in the form `host:port`
///
/// The id doubles as the dial address of the peer, so two ids are equal
/// exactly when their strings are equal. No normalization is applied.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Parse a node id from a `host:port` string
    pub fn parse(s: &str) -> Result<Self, NodeIdError> {
        if s.is_empty() {
            return Err(NodeIdError::InvalidFormat("Node id cannot be empty".into()));
        }

        // Split on the last ':' so bracketed IPv6 hosts keep their colons
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NodeIdError::InvalidFormat(format!("Missing port in '{}'", s)))?;

        if host.is_empty() {
            return Err(NodeIdError::InvalidFormat(format!("Missing host in '{}'", s)));
        }

        port.parse::<u16>()
            .map_err(|_| NodeIdError::InvalidPort(port.to_string()))?;

        Ok(Self(s.to_string()))
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the port component
    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or_default()
    }

    /// Resolve the id to a socket address
    pub fn to_socket_addr(&self) -> Result<SocketAddr, NodeIdError> {
        self.0
            .to_socket_addrs()
            .map_err(|e| NodeIdError::Unresolvable(self.0.clone(), e.to_string()))?
            .next()
            .ok_or_else(|| NodeIdError::Unresolvable(self.0.clone(), "no addresses".into()))
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
