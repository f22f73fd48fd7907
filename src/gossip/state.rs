use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a gossip node
///
/// `Created → Listening → Joining → SteadyState`, and any state may move to
/// the terminal `Stopped`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    Created,
    Listening,
    Joining,
    SteadyState,
    Stopped,
}

impl NodeState {
    /// Check if transition to another state is valid
    pub fn can_transition_to(&self, target: NodeState) -> bool {
        matches!(
            (self, target),
            (Self::Created, Self::Listening)
                | (Self::Listening, Self::Joining)
                | (Self::Joining, Self::SteadyState)
                | (Self::Created, Self::Stopped)
                | (Self::Listening, Self::Stopped)
                | (Self::Joining, Self::Stopped)
                | (Self::SteadyState, Self::Stopped)
        )
    }

    /// Check if the node still serves and publishes
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Listening => "listening",
            Self::Joining => "joining",
            Self::SteadyState => "steady",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
