pub mod fingerprint;
pub mod personal;
pub mod stat_store;

use serde::{Deserialize, Serialize};

/// Channel used when an ingested event carries no channel name.
pub const DEFAULT_CHANNEL: &str = "default";

/// Trend counters saturate at this many views before halving decay kicks in.
pub const VIEWS_CEILING: i32 = 512;

/// Counter triple for a single content ID.
///
/// `ftr` records how many times the counters were halved; callers may
/// reconstruct an approximate absolute count as `views * 2^ftr`.
///
/// Field names on the wire are capitalized for compatibility with snapshots
/// written by earlier builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRecord {
    #[serde(rename = "Views", default)]
    pub views: i32,
    #[serde(rename = "Clicks", default)]
    pub clicks: i32,
    #[serde(rename = "Ftr", default)]
    pub ftr: i32,
}

impl StatRecord {
    /// Applies one round of trend decay if `views` exceeded the ceiling.
    ///
    /// Both counters are ceil-halved so that stale records fade while fresh
    /// signal dominates. `(n + 1) >> 1` is ceil division by two for the
    /// non-negative values held here.
    pub fn halve_if_saturated(&mut self) {
        if self.views > VIEWS_CEILING {
            self.views = (self.views + 1) >> 1;
            self.clicks = (self.clicks + 1) >> 1;
            self.ftr += 1;
        }
    }
}

/// One ingested interaction batch, as posted by a client.
///
/// `views` and `clicks` carry content IDs as strings; malformed IDs are
/// dropped during aggregation, never rejected at ingest. An empty `channel`
/// is coerced to [`DEFAULT_CHANNEL`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputStats {
    #[serde(rename = "f", default)]
    pub fingerprint: String,
    #[serde(rename = "v", default)]
    pub views: Vec<String>,
    #[serde(rename = "c", default)]
    pub clicks: Vec<String>,
    #[serde(rename = "ch", default)]
    pub channel: String,
}

/// Parses a content ID from its wire form.
///
/// Empty, non-numeric, negative, and out-of-u32-range strings all yield
/// `None`; callers drop them without raising.
pub(crate) fn parse_content_id(raw: &str) -> Option<u32> {
    if raw.is_empty() {
        return None;
    }
    raw.parse::<u32>().ok()
}
