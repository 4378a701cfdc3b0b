use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Lifetime of a node relative to the session that wrote it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Survives the writing session.
    Persistent,
    /// Removed by the store when the writing session ends.
    Ephemeral,
}

/// Metadata kept alongside a node's payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Bumped on every write or replace; 0 for a freshly created node.
    pub version: u64,
    /// Session that owns the node if it is ephemeral.
    pub ephemeral_owner: Option<SessionId>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Stat {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner.is_some()
    }
}

/// A node's payload together with its metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub data: Vec<u8>,
    pub stat: Stat,
}

/// Outcome of a one-shot watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    DataChanged,
    Deleted,
    /// The watching connection lost its session. No further events will
    /// arrive for this connection.
    Disconnected,
}

/// Session lifecycle as observed by the connection that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    /// The link to the store is down; the session may still expire.
    Disconnected,
    /// The store expired the session and removed its ephemeral nodes.
    Expired,
    /// The session was closed by its owner.
    Closed,
}

impl SessionState {
    /// True for every state in which the connection can no longer be used.
    pub fn is_lost(&self) -> bool {
        !matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Expired => write!(f, "expired"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
