//! Supervised child state
//!
//! The supervisor and its exit watchers are the only writers; the status
//! server reads snapshots.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The two supervised children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildRole {
    Mesh,
    Proxy,
}

impl fmt::Display for ChildRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildRole::Mesh => write!(f, "mesh"),
            ChildRole::Proxy => write!(f, "proxy"),
        }
    }
}

/// Lifecycle of one child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChildState {
    NotStarted,
    Running { pid: u32 },
    /// `code` is `None` when the child was killed by a signal
    Exited { code: Option<i32> },
}

impl Default for ChildState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl ChildState {
    pub fn is_running(&self) -> bool {
        matches!(self, ChildState::Running { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            ChildState::Running { pid } => Some(*pid),
            _ => None,
        }
    }
}

/// Aggregate state shown on the status page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overall {
    /// At least one child has not been started yet
    Initializing,
    /// Both children are running
    Online,
    /// Both were started but at least one has exited
    Degraded,
}

impl fmt::Display for Overall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Overall::Initializing => write!(f, "System Initializing..."),
            Overall::Online => write!(f, "System Online"),
            Overall::Degraded => write!(f, "System Degraded"),
        }
    }
}

/// Point-in-time copy of both children
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub mesh: ChildState,
    pub proxy: ChildState,
}

impl StatusSnapshot {
    pub fn overall(&self) -> Overall {
        match (self.mesh, self.proxy) {
            (ChildState::NotStarted, _) | (_, ChildState::NotStarted) => Overall::Initializing,
            (m, p) if m.is_running() && p.is_running() => Overall::Online,
            _ => Overall::Degraded,
        }
    }
}

/// Shared handle on the children's state
#[derive(Debug, Clone, Default)]
pub struct SupervisorStatus {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl SupervisorStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, role: ChildRole) -> ChildState {
        let inner = self.inner.read();
        match role {
            ChildRole::Mesh => inner.mesh,
            ChildRole::Proxy => inner.proxy,
        }
    }

    pub fn set(&self, role: ChildRole, state: ChildState) {
        let mut inner = self.inner.write();
        match role {
            ChildRole::Mesh => inner.mesh = state,
            ChildRole::Proxy => inner.proxy = state,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        *self.inner.read()
    }
}
