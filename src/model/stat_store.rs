use std::collections::HashMap;
use std::io;

use parking_lot::RwLock;

use crate::storage::codec;

use super::{parse_content_id, InputStats, StatRecord};

/// Per-channel trending counters, bounded by batch eviction.
///
/// A record is created on the first view or click of its ID. Repeated views
/// push `views` toward the ceiling; crossing it triggers halving decay.
/// When the table is full, inserting a new ID first evicts the entries with
/// the fewest views.
pub struct StatStore {
    data: RwLock<HashMap<u32, StatRecord>>,
    max_records: i32,
    eviction_percent: u32,
}

impl StatStore {
    /// Creates a store bounded at `max_records` entries (-1 = unlimited).
    pub fn new(max_records: i32, eviction_percent: u32) -> Self {
        let eviction_percent = if eviction_percent == 0 {
            10
        } else {
            eviction_percent
        };
        Self {
            data: RwLock::new(HashMap::new()),
            max_records,
            eviction_percent,
        }
    }

    /// Applies one ingested batch to the trend counters.
    ///
    /// Malformed content IDs are dropped. Views trigger halving decay and
    /// eviction; clicks never do either on their own.
    pub fn inc_stats(&self, input: &InputStats) {
        let mut data = self.data.write();

        for raw in &input.views {
            let Some(id) = parse_content_id(raw) else {
                continue;
            };
            if let Some(rec) = data.get_mut(&id) {
                rec.views += 1;
                rec.halve_if_saturated();
            } else {
                Self::evict_if_needed(&mut data, self.max_records, self.eviction_percent);
                data.insert(
                    id,
                    StatRecord {
                        views: 1,
                        ..StatRecord::default()
                    },
                );
            }
        }

        for raw in &input.clicks {
            let Some(id) = parse_content_id(raw) else {
                continue;
            };
            if let Some(rec) = data.get_mut(&id) {
                rec.clicks += 1;
            } else {
                Self::evict_if_needed(&mut data, self.max_records, self.eviction_percent);
                data.insert(
                    id,
                    StatRecord {
                        clicks: 1,
                        ..StatRecord::default()
                    },
                );
            }
        }
    }

    /// Evicts the lowest-viewed entries when the table is at capacity.
    fn evict_if_needed(data: &mut HashMap<u32, StatRecord>, max_records: i32, percent: u32) {
        if max_records < 0 || data.len() < max_records as usize {
            return;
        }

        let target = eviction_target(max_records as u64, percent);

        let mut entries: Vec<(u32, i32)> = data.iter().map(|(id, rec)| (*id, rec.views)).collect();
        entries.sort_unstable_by_key(|(_, views)| *views);

        for (id, _) in entries.into_iter().take(target) {
            data.remove(&id);
        }
    }

    /// Returns a copy of the record for `id`, if present.
    pub fn get(&self, id: u32) -> Option<StatRecord> {
        self.data.read().get(&id).copied()
    }

    /// Number of tracked content IDs.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store tracks no IDs.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Replaces the entire table, used on snapshot restore.
    pub fn put_data(&self, data: HashMap<u32, StatRecord>) {
        *self.data.write() = data;
    }

    /// Returns a deep copy of the table; callers may mutate it freely.
    pub fn get_data(&self) -> HashMap<u32, StatRecord> {
        self.data.read().clone()
    }

    /// Serializes the table in the binary snapshot layout.
    pub fn write_binary_to(&self, w: &mut impl io::Write) -> io::Result<()> {
        let data = self.data.read();
        codec::write_stat_records(w, &data)
    }
}

/// Batch size for one eviction pass: `ceil(max * percent / 100)`, at least 1.
pub(crate) fn eviction_target(max_records: u64, percent: u32) -> usize {
    let target = (max_records * u64::from(percent)).div_ceil(100);
    target.max(1) as usize
}
