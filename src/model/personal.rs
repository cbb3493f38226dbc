use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::storage::codec;

use super::fingerprint::FingerprintRecord;
use super::{InputStats, StatRecord};

/// Fingerprint cap applied when the configured value is 0.
const DEFAULT_MAX_FINGERPRINTS: i32 = 100_000;

/// Disk tier for fingerprints evicted from memory.
///
/// `restore` returns `None` both for unknown fingerprints and when the backing
/// file turned out to be unreadable; the caller then starts from scratch.
pub trait ColdTier: Send + Sync {
    fn has(&self, channel: &str, fingerprint: &str) -> bool;
    fn evict(&self, channel: &str, fingerprint: &str, data: HashMap<u32, StatRecord>);
    fn restore(&self, channel: &str, fingerprint: &str) -> Option<HashMap<u32, StatRecord>>;
}

/// Channel-scoped directory of fingerprint records.
///
/// Lookups take the directory read lock only; each record carries its own
/// lock, so mutation happens after the directory lock is released.
pub struct PersonalStatStore {
    channel: String,
    fingerprints: RwLock<HashMap<String, Arc<FingerprintRecord>>>,
    max_fingerprints: i32,
    max_records_per_fp: i32,
    eviction_percent: u32,
    fingerprint_ttl: Duration,
    cold: RwLock<Option<Arc<dyn ColdTier>>>,
}

impl PersonalStatStore {
    pub fn new(
        channel: &str,
        max_fingerprints: i32,
        max_records_per_fp: i32,
        eviction_percent: u32,
        fingerprint_ttl: Duration,
    ) -> Self {
        let max_fingerprints = if max_fingerprints == 0 {
            DEFAULT_MAX_FINGERPRINTS
        } else {
            max_fingerprints
        };
        let eviction_percent = if eviction_percent == 0 {
            10
        } else {
            eviction_percent
        };
        Self {
            channel: channel.to_string(),
            fingerprints: RwLock::new(HashMap::new()),
            max_fingerprints,
            max_records_per_fp,
            eviction_percent,
            fingerprint_ttl,
            cold: RwLock::new(None),
        }
    }

    /// Attaches the cold tier; called once during startup wiring.
    pub fn set_cold(&self, cold: Arc<dyn ColdTier>) {
        *self.cold.write() = Some(cold);
    }

    /// Applies one ingested batch to the record for `input.fingerprint`.
    ///
    /// Fast path is a read-locked lookup. On a miss the write lock is taken
    /// with a double-check, then cold restore is attempted before allocating
    /// a fresh record; at capacity the input is silently dropped.
    pub fn inc_stats(&self, input: &InputStats) {
        let fp = input.fingerprint.as_str();

        if let Some(rec) = self.fingerprints.read().get(fp).cloned() {
            rec.inc_stats(input, self.max_records_per_fp, self.eviction_percent);
            return;
        }

        let rec = {
            let mut fingerprints = self.fingerprints.write();
            if let Some(rec) = fingerprints.get(fp).cloned() {
                rec
            } else {
                let rec = match self.try_restore_from_cold(fp) {
                    Some(rec) => Arc::new(rec),
                    None => {
                        if self.max_fingerprints >= 0
                            && fingerprints.len() >= self.max_fingerprints as usize
                        {
                            return;
                        }
                        Arc::new(FingerprintRecord::new())
                    }
                };
                fingerprints.insert(fp.to_string(), Arc::clone(&rec));
                rec
            }
        };

        rec.inc_stats(input, self.max_records_per_fp, self.eviction_percent);
    }

    fn try_restore_from_cold(&self, fp: &str) -> Option<FingerprintRecord> {
        let cold = self.cold.read().clone()?;
        if !cold.has(&self.channel, fp) {
            return None;
        }
        let data = cold.restore(&self.channel, fp)?;
        Some(FingerprintRecord::from_dense(&data))
    }

    /// Dense data for one fingerprint, if resident.
    pub fn get(&self, fp: &str) -> Option<HashMap<u32, StatRecord>> {
        let rec = self.fingerprints.read().get(fp).cloned()?;
        Some(rec.get_data())
    }

    /// Number of resident fingerprints.
    pub fn len(&self) -> usize {
        self.fingerprints.read().len()
    }

    /// Whether no fingerprints are resident.
    pub fn is_empty(&self) -> bool {
        self.fingerprints.read().is_empty()
    }

    /// Deep copy of every resident fingerprint's dense data.
    pub fn get_data(&self) -> HashMap<String, HashMap<u32, StatRecord>> {
        let fingerprints = self.fingerprints.read();
        fingerprints
            .iter()
            .map(|(fp, rec)| (fp.clone(), rec.get_data()))
            .collect()
    }

    /// Replaces the directory from legacy dense data (V1-V3 restore).
    pub fn put_data(&self, stats: HashMap<String, HashMap<u32, StatRecord>>) {
        let mut fingerprints = self.fingerprints.write();
        *fingerprints = stats
            .into_iter()
            .map(|(fp, data)| (fp, Arc::new(FingerprintRecord::from_dense(&data))))
            .collect();
    }

    /// Dense data plus `last_seen` per fingerprint, for snapshot assembly.
    pub fn get_persistence_data(&self) -> HashMap<String, (HashMap<u32, StatRecord>, DateTime<Utc>)> {
        let fingerprints = self.fingerprints.read();
        fingerprints
            .iter()
            .map(|(fp, rec)| (fp.clone(), rec.get_persistence_data()))
            .collect()
    }

    /// Replaces the directory from V4 data, preserving stored timestamps.
    /// Entries without a usable timestamp keep the restore time instead.
    pub fn put_persistence_data(
        &self,
        data: HashMap<String, (HashMap<u32, StatRecord>, Option<DateTime<Utc>>)>,
    ) -> usize {
        let mut backfilled = 0;
        let mut fingerprints = self.fingerprints.write();
        *fingerprints = data
            .into_iter()
            .map(|(fp, (dense, last_seen))| {
                let rec = FingerprintRecord::from_dense(&dense);
                match last_seen {
                    Some(ts) if ts.timestamp() > 0 => rec.set_last_seen(ts),
                    _ => backfilled += 1,
                }
                (fp, Arc::new(rec))
            })
            .collect();
        backfilled
    }

    /// Installs fully decoded records (binary snapshot restore).
    pub fn put_records(&self, records: HashMap<String, FingerprintRecord>) {
        let mut fingerprints = self.fingerprints.write();
        *fingerprints = records
            .into_iter()
            .map(|(fp, rec)| (fp, Arc::new(rec)))
            .collect();
    }

    /// Moves fingerprints idle for longer than the TTL out to cold storage.
    /// A zero TTL disables eviction entirely.
    pub fn evict_expired(&self, now: DateTime<Utc>) {
        if self.fingerprint_ttl.is_zero() {
            return;
        }

        let cold = self.cold.read().clone();
        let mut fingerprints = self.fingerprints.write();

        fingerprints.retain(|fp, rec| {
            let idle = now
                .signed_duration_since(rec.last_seen())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if idle <= self.fingerprint_ttl {
                return true;
            }
            if let Some(cold) = &cold {
                cold.evict(&self.channel, fp, rec.get_data());
            }
            false
        });
    }

    /// Serializes the directory in the binary snapshot layout.
    pub fn write_binary_to(&self, w: &mut impl io::Write) -> io::Result<()> {
        let fingerprints = self.fingerprints.read();
        codec::write_u32(w, fingerprints.len() as u32)?;
        for (fp, rec) in fingerprints.iter() {
            codec::write_string(w, fp)?;
            rec.write_binary_to(w)?;
        }
        Ok(())
    }
}
