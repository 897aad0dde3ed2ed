//! Conflict data, host decisions and resolution plans.
//!
//! When the remote API rejects a mutation because the server holds a newer
//! version, the host's conflict handler chooses a decision. Turning that
//! decision into concrete work is pure and lives here; executing the plan
//! is the datastore's job.

use crate::{error::Result, Error, Record, Version};
use serde::{Deserialize, Serialize};

/// Local and remote copies of a conflicting record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictData {
    pub local: Record,
    pub remote: Record,
}

impl ConflictData {
    pub fn new(local: Record, remote: Record) -> Self {
        Self { local, remote }
    }
}

/// Decision returned by a conflict handler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "record", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolutionDecision {
    /// Discard the local change and keep the server copy
    #[default]
    ApplyRemote,
    /// Publish the local copy again on top of the server version
    RetryLocal,
    /// Publish a custom record on top of the server version
    Retry(Record),
}

impl ConflictResolutionDecision {
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::ApplyRemote => "APPLY_REMOTE",
            Self::RetryLocal => "RETRY_LOCAL",
            Self::Retry(_) => "RETRY",
        }
    }
}

/// Work needed to carry out a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPlan {
    /// Force the remote record into the local store and drop the outbox entry
    ApplyRemote(Record),
    /// Republish the record conditioned on the remote version
    Publish { record: Record, version: Option<Version> },
    /// Save the custom record locally and enqueue a fresh update for it
    Requeue(Record),
}

impl ConflictData {
    /// Build the plan for a decision.
    pub fn plan(&self, decision: ConflictResolutionDecision) -> Result<ResolutionPlan> {
        match decision {
            ConflictResolutionDecision::ApplyRemote => {
                Ok(ResolutionPlan::ApplyRemote(self.remote.clone()))
            }
            ConflictResolutionDecision::RetryLocal => {
                let mut record = self.local.clone();
                record.version = self.remote.version;
                Ok(ResolutionPlan::Publish {
                    record,
                    version: self.remote.version,
                })
            }
            ConflictResolutionDecision::Retry(mut custom) => {
                let expected = self.local.key();
                let actual = custom.key();
                if expected != actual {
                    return Err(Error::ConflictKeyMismatch {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
                custom.version = self.remote.version;
                custom.deleted = false;
                Ok(ResolutionPlan::Requeue(custom))
            }
        }
    }
}
