//! Persistence shapes and drivers.
//!
//! JSON shapes cover the legacy snapshot generations (V1-V4); new snapshots
//! are written in the binary V5 layout defined in [`codec`]. Legacy ID keys
//! are signed on disk; negative keys are dropped during migration.

pub mod codec;
pub mod cold;
pub mod compress;
pub mod file;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::StatRecord;

/// V2/V3 per-fingerprint entry. Older writers emitted the capitalized field
/// name of an untagged struct, so both spellings are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalEntry {
    #[serde(rename = "data", alias = "Data", default)]
    pub data: HashMap<i64, StatRecord>,
}

/// V3 per-channel payload (also the V2 root, minus the channel wrapper).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelData {
    #[serde(rename = "trend_stats", default)]
    pub trend_stats: HashMap<i64, StatRecord>,
    #[serde(rename = "personal_stats", default)]
    pub personal_stats: HashMap<String, PersonalEntry>,
}

/// V3 envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Storage {
    #[serde(rename = "channels", default)]
    pub channels: HashMap<String, ChannelData>,
}

/// V4 per-fingerprint payload. A JSON superset of [`PersonalEntry`]: V3
/// entries deserialize into this struct with `last_seen` unset, which the
/// restore path backfills.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintPersistence {
    #[serde(rename = "data", alias = "Data", default)]
    pub data: HashMap<i64, StatRecord>,
    #[serde(rename = "last_seen", default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// V4 per-channel payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelDataV4 {
    #[serde(rename = "trend_stats", default)]
    pub trend_stats: HashMap<i64, StatRecord>,
    #[serde(rename = "personal_stats", default)]
    pub personal_stats: HashMap<String, FingerprintPersistence>,
}

/// V4 envelope with an explicit version marker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageV4 {
    #[serde(rename = "version", default)]
    pub version: i32,
    #[serde(rename = "channels", default)]
    pub channels: HashMap<String, ChannelDataV4>,
}

/// Narrows legacy signed IDs to the engine's u32 space, dropping the rest.
pub fn sanitize_ids(map: HashMap<i64, StatRecord>) -> HashMap<u32, StatRecord> {
    map.into_iter()
        .filter_map(|(id, rec)| u32::try_from(id).ok().map(|id| (id, rec)))
        .collect()
}

/// Widens engine IDs to the signed on-disk key space.
pub fn widen_ids(map: HashMap<u32, StatRecord>) -> HashMap<i64, StatRecord> {
    map.into_iter().map(|(id, rec)| (i64::from(id), rec)).collect()
}
