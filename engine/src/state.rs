//! Orchestrator states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    /// Nothing running
    #[default]
    Stopped,
    /// Local reads and writes only; no remote API configured
    LocalOnly,
    /// Local writes are published and remote changes merged
    SyncViaApi,
}

impl OrchestratorState {
    pub fn is_started(self) -> bool {
        self != OrchestratorState::Stopped
    }

    pub fn syncs(self) -> bool {
        self == OrchestratorState::SyncViaApi
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Stopped => "STOPPED",
            OrchestratorState::LocalOnly => "LOCAL_ONLY",
            OrchestratorState::SyncViaApi => "SYNC_VIA_API",
        };
        f.write_str(name)
    }
}
