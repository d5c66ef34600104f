//! Public status surface of the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coordinator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Idle,
    Syncing,
    /// Both sides have data and they differ; waiting for `resolve_conflict`
    Conflict,
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "IDLE",
            SyncState::Syncing => "SYNCING",
            SyncState::Conflict => "CONFLICT",
            SyncState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Snapshot of the coordinator's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Recursive node count of the local tree, set when a conflict is found
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_local: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_remote: Option<usize>,
    /// Milliseconds since epoch of the last successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<u64>,
}

impl SyncStatus {
    pub fn idle() -> Self {
        Self::with_state(SyncState::Idle)
    }

    pub fn with_state(state: SyncState) -> Self {
        Self {
            state,
            error: None,
            items_local: None,
            items_remote: None,
            last_synced: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::with_state(SyncState::Error)
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// How to settle a conflict between a non-empty local and remote tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Union of both trees, written to both sides
    Merge,
    /// Local tree overwrites remote
    Local,
    /// Remote tree overwrites local
    Remote,
    /// Wipe both sides
    Clear,
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "clear" => Ok(Self::Clear),
            other => Err(format!(
                "unknown strategy '{}' (expected merge, local, remote or clear)",
                other
            )),
        }
    }
}

/// Outcome of one `sync_now` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Nodes applied locally from the remote tree
    pub pulled: usize,
    /// Nodes written to the remote store
    pub pushed: usize,
    /// Diverged histories settled by an automatic merge
    pub conflicts: usize,
}
