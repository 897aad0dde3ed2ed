//! Sync watermarks.

use crate::{error::Result, Error, ModelName, Record, Timestamp, LAST_SYNC_METADATA_MODEL};
use serde::{Deserialize, Serialize};

/// Time of the last successful sync for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "at")]
pub enum SyncTime {
    #[default]
    Never,
    At(Timestamp),
}

impl SyncTime {
    pub fn from_option(time: Option<Timestamp>) -> Self {
        time.map_or(SyncTime::Never, SyncTime::At)
    }

    pub fn as_option(self) -> Option<Timestamp> {
        match self {
            SyncTime::Never => None,
            SyncTime::At(t) => Some(t),
        }
    }

    pub fn exists(self) -> bool {
        matches!(self, SyncTime::At(_))
    }

    /// Keep the watermark only if it is recent enough for a delta sync.
    pub fn within(self, now: Timestamp, interval_ms: u64) -> SyncTime {
        match self {
            SyncTime::At(t) if now.saturating_sub(t) < interval_ms => self,
            _ => SyncTime::Never,
        }
    }
}

/// Kind of the last sync query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    /// Full query from scratch
    Base,
    /// Changes since the last watermark
    Delta,
}

impl SyncType {
    /// A watermark means a delta query.
    pub fn for_time(time: SyncTime) -> Self {
        if time.exists() {
            SyncType::Delta
        } else {
            SyncType::Base
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSyncMetadata {
    pub model: ModelName,
    pub last_sync_time: Option<Timestamp>,
    pub last_sync_type: Option<SyncType>,
}

impl LastSyncMetadata {
    pub fn never(model: impl Into<ModelName>) -> Self {
        Self {
            model: model.into(),
            last_sync_time: None,
            last_sync_type: None,
        }
    }

    pub fn synced(model: impl Into<ModelName>, at: Timestamp, sync_type: SyncType) -> Self {
        Self {
            model: model.into(),
            last_sync_time: Some(at),
            last_sync_type: Some(sync_type),
        }
    }

    pub fn sync_time(&self) -> SyncTime {
        SyncTime::from_option(self.last_sync_time)
    }

    /// Encode as a `LastSyncMetadata` system record keyed by model name.
    pub fn to_record(&self) -> Result<Record> {
        let mut payload =
            serde_json::to_value(self).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("id".into(), serde_json::Value::String(self.model.clone()));
        }
        Ok(Record::new(LAST_SYNC_METADATA_MODEL, self.model.clone(), payload))
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        serde_json::from_value(record.payload.clone())
            .map_err(|e| Error::InvalidPayload(e.to_string()))
    }
}
