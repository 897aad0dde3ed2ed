//! Version-compare merge rule for remote records.
//!
//! Remote data (sync pages, subscription notifications, mutation responses)
//! is only applied when it is at least as new as the local copy. When the
//! host still has an unsent change to the record, only the remote version
//! and timestamps are adopted so the local edit is not lost.

use crate::Record;
use serde::{Deserialize, Serialize};

/// How incoming versions are compared against the local version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionRule {
    /// Apply only if strictly newer (subscriptions, mutation responses)
    Newer,
    /// Apply if newer or equal (sync queries)
    NewerOrEqual,
    /// Always apply (conflict resolution with remote wins)
    Always,
}

/// What the merger should do with an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Write the incoming record
    Save,
    /// Write the incoming tombstone
    Delete,
    /// Keep local fields, adopt remote version and timestamps
    MetadataOnly,
    /// Incoming data is stale
    Skip,
}

impl VersionRule {
    /// Whether `incoming` passes this rule against the local version.
    pub fn accepts(self, local: Option<u64>, incoming: Option<u64>) -> bool {
        match (self, local, incoming) {
            (VersionRule::Always, _, _) => true,
            (_, None, _) => true,
            (_, Some(_), None) => false,
            (VersionRule::Newer, Some(l), Some(i)) => i > l,
            (VersionRule::NewerOrEqual, Some(l), Some(i)) => i >= l,
        }
    }
}

/// Decide how to merge `incoming` into the local copy.
pub fn decide(
    local: Option<&Record>,
    incoming: &Record,
    rule: VersionRule,
    has_pending: bool,
) -> MergeAction {
    let local_version = local.and_then(|r| r.version);
    if !rule.accepts(local_version, incoming.version) {
        return MergeAction::Skip;
    }

    if has_pending && rule != VersionRule::Always {
        return match local {
            Some(_) => MergeAction::MetadataOnly,
            None => MergeAction::Skip,
        };
    }

    if incoming.deleted {
        MergeAction::Delete
    } else {
        MergeAction::Save
    }
}
