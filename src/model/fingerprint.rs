use std::collections::HashMap;
use std::io;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use roaring::RoaringBitmap;

use crate::storage::codec;

use super::stat_store::eviction_target;
use super::{parse_content_id, InputStats, StatRecord};

/// Sparse per-fingerprint counters.
///
/// Two bitmaps record which content IDs were viewed or clicked at least once;
/// the `counts` map holds only records that deviate from the bitmap default
/// (`views > 1`, `clicks > 1`, or `ftr > 0`). For typical traffic where most
/// IDs are seen exactly once this keeps per-user state to a few bits per ID.
pub struct FingerprintRecord {
    inner: RwLock<State>,
}

struct State {
    viewed: RoaringBitmap,
    clicked: RoaringBitmap,
    counts: HashMap<u32, StatRecord>,
    last_seen: DateTime<Utc>,
}

impl State {
    /// The logical record for `id`: the counts override if present, else the
    /// bitmap default.
    fn logical(&self, id: u32) -> StatRecord {
        if let Some(rec) = self.counts.get(&id) {
            return *rec;
        }
        StatRecord {
            views: i32::from(self.viewed.contains(id)),
            clicks: i32::from(self.clicked.contains(id)),
            ftr: 0,
        }
    }
}

impl Default for FingerprintRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintRecord {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(State {
                viewed: RoaringBitmap::new(),
                clicked: RoaringBitmap::new(),
                counts: HashMap::new(),
                last_seen: Utc::now(),
            }),
        }
    }

    /// Rebuilds the sparse form from a dense ID map, as produced by cold
    /// storage or a legacy snapshot. Records matching the bitmap default are
    /// not materialized into `counts`.
    pub fn from_dense(data: &HashMap<u32, StatRecord>) -> Self {
        let mut viewed = RoaringBitmap::new();
        let mut clicked = RoaringBitmap::new();
        let mut counts = HashMap::new();

        for (&id, rec) in data {
            if rec.views > 0 {
                viewed.insert(id);
            }
            if rec.clicks > 0 {
                clicked.insert(id);
            }
            if rec.views > 1 || rec.clicks > 1 || rec.ftr > 0 {
                counts.insert(id, *rec);
            }
        }

        Self {
            inner: RwLock::new(State {
                viewed,
                clicked,
                counts,
                last_seen: Utc::now(),
            }),
        }
    }

    /// Assembles a record from decoded snapshot parts.
    pub(crate) fn from_parts(
        viewed: RoaringBitmap,
        clicked: RoaringBitmap,
        counts: HashMap<u32, StatRecord>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            inner: RwLock::new(State {
                viewed,
                clicked,
                counts,
                last_seen,
            }),
        }
    }

    /// Applies one ingested batch to this fingerprint and refreshes
    /// `last_seen`.
    pub fn inc_stats(&self, input: &InputStats, max_records_per_fp: i32, eviction_percent: u32) {
        let mut state = self.inner.write();
        state.last_seen = Utc::now();
        Self::inc_views(&mut state, &input.views, max_records_per_fp, eviction_percent);
        Self::inc_clicks(&mut state, &input.clicks);
    }

    fn inc_views(state: &mut State, ids: &[String], max_records_per_fp: i32, percent: u32) {
        for raw in ids {
            let Some(id) = parse_content_id(raw) else {
                continue;
            };
            if state.viewed.contains(id) {
                // Repeated view: promote the bitmap default into counts, or
                // bump the existing overflow record.
                if let Some(rec) = state.counts.get_mut(&id) {
                    rec.views += 1;
                    rec.halve_if_saturated();
                } else {
                    let clicks = i32::from(state.clicked.contains(id));
                    state.counts.insert(
                        id,
                        StatRecord {
                            views: 2,
                            clicks,
                            ftr: 0,
                        },
                    );
                }
            } else {
                Self::evict_records(state, max_records_per_fp, percent);
                state.viewed.insert(id);
                // A click-only overflow record gains its first view.
                if let Some(rec) = state.counts.get_mut(&id) {
                    rec.views = 1;
                }
            }
        }
    }

    fn inc_clicks(state: &mut State, ids: &[String]) {
        for raw in ids {
            let Some(id) = parse_content_id(raw) else {
                continue;
            };
            if state.clicked.contains(id) {
                if let Some(rec) = state.counts.get_mut(&id) {
                    rec.clicks += 1;
                } else {
                    let views = i32::from(state.viewed.contains(id));
                    state.counts.insert(
                        id,
                        StatRecord {
                            views,
                            clicks: 2,
                            ftr: 0,
                        },
                    );
                }
            } else {
                state.clicked.insert(id);
                if let Some(rec) = state.counts.get_mut(&id) {
                    rec.clicks = 1;
                }
            }
        }
    }

    /// Drops the lowest-scoring IDs once the viewed set reaches the cap.
    /// Score is the overflow view count when present, else 1.
    fn evict_records(state: &mut State, max_records: i32, percent: u32) {
        if max_records < 0 || state.viewed.len() < max_records as u64 {
            return;
        }

        let target = eviction_target(max_records as u64, percent);

        let mut entries: Vec<(u32, i32)> = state
            .viewed
            .iter()
            .map(|id| {
                let score = state.counts.get(&id).map_or(1, |rec| rec.views);
                (id, score)
            })
            .collect();
        entries.sort_unstable_by_key(|(_, score)| *score);

        for (id, _) in entries.into_iter().take(target) {
            state.viewed.remove(id);
            state.clicked.remove(id);
            state.counts.remove(&id);
        }
    }

    /// Reconstructs the dense per-ID map from bitmaps plus overrides.
    ///
    /// The result is a fresh structure; callers may mutate it freely.
    pub fn get_data(&self) -> HashMap<u32, StatRecord> {
        let state = self.inner.read();
        Self::dense_from_state(&state)
    }

    fn dense_from_state(state: &State) -> HashMap<u32, StatRecord> {
        let capacity = (state.viewed.len() + state.clicked.len()) as usize;
        let mut result = HashMap::with_capacity(capacity);

        for id in state.viewed.iter() {
            result.insert(id, state.logical(id));
        }
        for id in state.clicked.iter() {
            result.entry(id).or_insert_with(|| state.logical(id));
        }

        result
    }

    /// Dense data and `last_seen` read atomically under one lock.
    pub fn get_persistence_data(&self) -> (HashMap<u32, StatRecord>, DateTime<Utc>) {
        let state = self.inner.read();
        (Self::dense_from_state(&state), state.last_seen)
    }

    /// Time of the latest mutation.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.inner.read().last_seen
    }

    /// Overrides the last-interaction timestamp, used on snapshot restore.
    pub(crate) fn set_last_seen(&self, ts: DateTime<Utc>) {
        self.inner.write().last_seen = ts;
    }

    /// Cardinality of the viewed bitmap.
    pub fn viewed_count(&self) -> u64 {
        self.inner.read().viewed.len()
    }

    /// Number of materialized overflow records.
    pub fn overflow_count(&self) -> usize {
        self.inner.read().counts.len()
    }

    /// Serializes the record in the binary snapshot layout.
    pub fn write_binary_to(&self, w: &mut impl io::Write) -> io::Result<()> {
        let state = self.inner.read();
        codec::write_i64(w, state.last_seen.timestamp_nanos_opt().unwrap_or(0))?;
        codec::write_bitmap(w, &state.viewed)?;
        codec::write_bitmap(w, &state.clicked)?;
        codec::write_stat_records(w, &state.counts)
    }
}
