pub mod buffer;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::config::StatisticConfig;
use crate::model::personal::{ColdTier, PersonalStatStore};
use crate::model::stat_store::StatStore;
use crate::model::{InputStats, StatRecord, DEFAULT_CHANNEL};
use crate::storage::codec::{self, CodecError};
use crate::storage::{self, ChannelDataV4, FingerprintPersistence, PersonalEntry, StorageV4};

use self::buffer::IngestBuffer;

/// A named namespace carrying independent trend and per-user counters.
struct Channel {
    trend: StatStore,
    personal: PersonalStatStore,
}

/// Facade over the statistics engine.
///
/// Owns the ingest buffer and the channel directory. Ingestion only appends
/// to the buffer; counters change exclusively on [`aggregate_stats`] ticks.
/// Every read returns a deep copy.
///
/// [`aggregate_stats`]: StatisticService::aggregate_stats
pub struct StatisticService {
    buffer: IngestBuffer,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    /// Sorted channel names, rebuilt on channel creation.
    sorted_names: RwLock<Arc<Vec<String>>>,
    cold: RwLock<Option<Arc<dyn ColdTier>>>,
    max_channels: i32,
    max_records: i32,
    max_records_per_fp: i32,
    eviction_percent: u32,
    fingerprint_ttl: Duration,
}

impl StatisticService {
    /// Creates the service with the built-in default channel in place.
    pub fn new(cfg: &StatisticConfig) -> Self {
        let service = Self {
            buffer: IngestBuffer::new(),
            channels: RwLock::new(HashMap::new()),
            sorted_names: RwLock::new(Arc::new(Vec::new())),
            cold: RwLock::new(None),
            max_channels: cfg.max_channels,
            max_records: cfg.max_records,
            max_records_per_fp: cfg.max_records_per_fp,
            eviction_percent: cfg.eviction_percent,
            fingerprint_ttl: cfg.fingerprint_ttl,
        };

        {
            let mut channels = service.channels.write();
            channels.insert(
                DEFAULT_CHANNEL.to_string(),
                Arc::new(service.make_channel(DEFAULT_CHANNEL)),
            );
            *service.sorted_names.write() = Arc::new(vec![DEFAULT_CHANNEL.to_string()]);
        }

        service
    }

    fn make_channel(&self, name: &str) -> Channel {
        // 0 selects the store's built-in fingerprint cap; the directory size
        // is not separately configurable.
        let personal = PersonalStatStore::new(
            name,
            0,
            self.max_records_per_fp,
            self.eviction_percent,
            self.fingerprint_ttl,
        );
        if let Some(cold) = self.cold.read().clone() {
            personal.set_cold(cold);
        }
        Channel {
            trend: StatStore::new(self.max_records, self.eviction_percent),
            personal,
        }
    }

    /// Attaches the cold tier to every channel, current and future.
    pub fn set_cold_storage(&self, cold: Arc<dyn ColdTier>) {
        *self.cold.write() = Some(Arc::clone(&cold));
        let channels = self.channels.read();
        for channel in channels.values() {
            channel.personal.set_cold(Arc::clone(&cold));
        }
    }

    /// Buffers one ingested batch; no channel work happens on this path.
    pub fn add_stats(&self, input: InputStats) {
        self.buffer.submit(input);
    }

    /// Drains the ingest buffer into per-channel counters, in arrival order.
    /// Returns the number of events applied.
    pub fn aggregate_stats(&self) -> usize {
        let batch = self.buffer.drain();
        for input in &batch {
            let name = if input.channel.is_empty() {
                DEFAULT_CHANNEL
            } else {
                input.channel.as_str()
            };
            let Some(channel) = self.get_or_create_channel(name) else {
                continue;
            };
            channel.trend.inc_stats(input);
            channel.personal.inc_stats(input);
        }
        batch.len()
    }

    /// Looks up a channel, creating it on first reference. Returns `None`
    /// when the channel cap would be exceeded; the default channel never
    /// counts against the cap.
    fn get_or_create_channel(&self, name: &str) -> Option<Arc<Channel>> {
        if let Some(channel) = self.channels.read().get(name) {
            return Some(Arc::clone(channel));
        }

        let mut channels = self.channels.write();
        if let Some(channel) = channels.get(name) {
            return Some(Arc::clone(channel));
        }

        let created = channels.len().saturating_sub(1);
        if self.max_channels >= 0 && created >= self.max_channels as usize {
            return None;
        }

        let channel = Arc::new(self.make_channel(name));
        channels.insert(name.to_string(), Arc::clone(&channel));

        let mut names: Vec<String> = channels.keys().cloned().collect();
        names.sort_unstable();
        *self.sorted_names.write() = Arc::new(names);

        Some(channel)
    }

    /// Trend counters for a channel; `None` if the channel does not exist.
    pub fn get_statistic(&self, channel: &str) -> Option<HashMap<u32, StatRecord>> {
        let channel = self.channels.read().get(channel).cloned()?;
        Some(channel.trend.get_data())
    }

    /// All per-fingerprint data for a channel.
    pub fn get_personal_statistic(
        &self,
        channel: &str,
    ) -> Option<HashMap<String, HashMap<u32, StatRecord>>> {
        let channel = self.channels.read().get(channel).cloned()?;
        Some(channel.personal.get_data())
    }

    /// Dense counters for one fingerprint in a channel.
    pub fn get_by_fingerprint(
        &self,
        channel: &str,
        fingerprint: &str,
    ) -> Option<HashMap<u32, StatRecord>> {
        let channel = self.channels.read().get(channel).cloned()?;
        channel.personal.get(fingerprint)
    }

    /// Sorted channel names.
    pub fn get_channels(&self) -> Vec<String> {
        self.sorted_names.read().as_ref().clone()
    }

    /// Ingest buffer length, for diagnostics.
    pub fn get_buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Number of trend records in a channel; 0 if the channel is absent.
    pub fn get_record_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map_or(0, |c| c.trend.len())
    }

    /// Number of resident fingerprints in a channel.
    pub fn get_fingerprint_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map_or(0, |c| c.personal.len())
    }

    /// Total trend records across all channels.
    pub fn trend_record_total(&self) -> usize {
        let channels = self.channels.read();
        channels.values().map(|c| c.trend.len()).sum()
    }

    /// Total resident fingerprints across all channels.
    pub fn fingerprint_total(&self) -> usize {
        let channels = self.channels.read();
        channels.values().map(|c| c.personal.len()).sum()
    }

    /// Point-in-time copy of the whole engine in the V4 shape. The channel
    /// directory stays read-locked for the duration, so no channel is
    /// mid-aggregation, but channels are read one after another.
    pub fn get_snapshot(&self) -> StorageV4 {
        let channels = self.channels.read();
        let mut out = HashMap::with_capacity(channels.len());

        for (name, channel) in channels.iter() {
            let personal_stats = channel
                .personal
                .get_persistence_data()
                .into_iter()
                .map(|(fp, (data, last_seen))| {
                    (
                        fp,
                        FingerprintPersistence {
                            data: storage::widen_ids(data),
                            last_seen: Some(last_seen),
                        },
                    )
                })
                .collect();

            out.insert(
                name.clone(),
                ChannelDataV4 {
                    trend_stats: storage::widen_ids(channel.trend.get_data()),
                    personal_stats,
                },
            );
        }

        StorageV4 {
            version: 4,
            channels: out,
        }
    }

    /// Restores one channel from legacy (V1-V3) data. Negative IDs are
    /// dropped; timestamps are backfilled to now.
    pub fn put_channel_data(
        &self,
        channel: &str,
        trend: HashMap<i64, StatRecord>,
        personal: HashMap<String, PersonalEntry>,
    ) {
        let Some(target) = self.get_or_create_channel(channel) else {
            return;
        };
        target.trend.put_data(storage::sanitize_ids(trend));
        target.personal.put_data(
            personal
                .into_iter()
                .map(|(fp, entry)| (fp, storage::sanitize_ids(entry.data)))
                .collect(),
        );
    }

    /// Restores one channel from V4 data, preserving stored timestamps.
    /// Returns how many fingerprints had no usable timestamp and were
    /// backfilled to now.
    pub fn put_channel_data_v4(
        &self,
        channel: &str,
        trend: HashMap<i64, StatRecord>,
        personal: HashMap<String, FingerprintPersistence>,
    ) -> usize {
        let Some(target) = self.get_or_create_channel(channel) else {
            return 0;
        };
        target.trend.put_data(storage::sanitize_ids(trend));
        target.personal.put_persistence_data(
            personal
                .into_iter()
                .map(|(fp, p)| (fp, (storage::sanitize_ids(p.data), p.last_seen)))
                .collect(),
        )
    }

    /// Fans TTL eviction out to every channel using the current time.
    pub fn evict_expired_fingerprints(&self) {
        self.evict_expired_fingerprints_at(Utc::now());
    }

    /// TTL eviction against an explicit clock value.
    pub fn evict_expired_fingerprints_at(&self, now: DateTime<Utc>) {
        let channels = self.channels.read();
        for channel in channels.values() {
            channel.personal.evict_expired(now);
        }
    }

    /// Serializes the whole engine in the binary snapshot layout. Channels
    /// are written in name order so identical state yields identical bytes.
    pub fn encode_v5(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&codec::MAGIC);
        out.push(codec::VERSION);

        let channels = self.channels.read();
        let mut names: Vec<&String> = channels.keys().collect();
        names.sort_unstable();

        for name in names {
            let channel = &channels[name.as_str()];
            codec::write_string(&mut out, name)?;
            channel.trend.write_binary_to(&mut out)?;
            channel.personal.write_binary_to(&mut out)?;
        }

        Ok(out)
    }

    /// Restores engine state from a binary snapshot payload. Channels beyond
    /// the cap are decoded (the framing demands it) but not installed.
    pub fn decode_v5(&self, buf: &[u8]) -> Result<(), CodecError> {
        let mut reader = codec::open_snapshot(buf)?;

        while reader.remaining() > 0 {
            let name = reader.read_string()?;
            let trend = reader.read_stat_records()?;
            let personal = reader.read_personal_records()?;

            if let Some(channel) = self.get_or_create_channel(&name) {
                channel.trend.put_data(trend);
                channel.personal.put_records(personal);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StatisticConfig {
        StatisticConfig {
            max_channels: 1000,
            ..StatisticConfig::default()
        }
    }

    fn service() -> StatisticService {
        StatisticService::new(&test_config())
    }

    fn input(channel: &str, fp: &str, views: &[&str], clicks: &[&str]) -> InputStats {
        InputStats {
            fingerprint: fp.to_string(),
            views: views.iter().map(|s| s.to_string()).collect(),
            clicks: clicks.iter().map(|s| s.to_string()).collect(),
            channel: channel.to_string(),
        }
    }

    #[test]
    fn test_new_service_has_default_channel() {
        let ss = service();
        assert_eq!(ss.get_channels(), vec![DEFAULT_CHANNEL.to_string()]);
    }

    #[test]
    fn test_add_stats_buffers_without_aggregating() {
        let ss = service();
        ss.add_stats(input("default", "", &["1"], &[]));

        assert_eq!(ss.get_buffer_size(), 1);
        assert!(ss.get_statistic("default").expect("channel").is_empty());
    }

    #[test]
    fn test_aggregate_applies_views_and_clicks() {
        let ss = service();
        ss.add_stats(input("default", "", &["1", "2"], &["1"]));
        assert_eq!(ss.aggregate_stats(), 1);

        let data = ss.get_statistic("default").expect("channel");
        assert_eq!(data.len(), 2);
        assert_eq!(data[&1].views, 1);
        assert_eq!(data[&1].clicks, 1);
        assert_eq!(data[&2].views, 1);
        assert_eq!(ss.get_buffer_size(), 0);
    }

    #[test]
    fn test_empty_channel_coerced_to_default() {
        let ss = service();
        ss.add_stats(input("", "", &["1"], &[]));
        ss.aggregate_stats();

        assert_eq!(ss.get_statistic("default").expect("channel")[&1].views, 1);
    }

    #[test]
    fn test_custom_channel_is_isolated() {
        let ss = service();
        ss.add_stats(input("news", "", &["1"], &[]));
        ss.aggregate_stats();

        assert_eq!(ss.get_statistic("news").expect("channel")[&1].views, 1);
        assert!(ss.get_statistic("default").expect("channel").is_empty());
    }

    #[test]
    fn test_get_statistic_unknown_channel() {
        let ss = service();
        assert!(ss.get_statistic("nonexistent").is_none());
        assert!(ss.get_personal_statistic("nonexistent").is_none());
        assert!(ss.get_by_fingerprint("nonexistent", "fp1").is_none());
        assert_eq!(ss.get_record_count("nonexistent"), 0);
    }

    #[test]
    fn test_personal_statistics() {
        let ss = service();
        ss.add_stats(input("default", "fp1", &["1", "2"], &[]));
        ss.aggregate_stats();

        let personal = ss.get_personal_statistic("default").expect("channel");
        assert!(personal.contains_key("fp1"));

        let data = ss.get_by_fingerprint("default", "fp1").expect("fp");
        assert_eq!(data.len(), 2);
        assert!(ss.get_by_fingerprint("default", "ghost").is_none());
    }

    #[test]
    fn test_channels_sorted() {
        let ss = service();
        ss.add_stats(input("zebra", "", &["1"], &[]));
        ss.add_stats(input("alpha", "", &["1"], &[]));
        ss.aggregate_stats();

        assert_eq!(
            ss.get_channels(),
            vec![
                "alpha".to_string(),
                "default".to_string(),
                "zebra".to_string(),
            ],
        );
    }

    #[test]
    fn test_channel_cap_excludes_default() {
        let cfg = StatisticConfig {
            max_channels: 2,
            ..StatisticConfig::default()
        };
        let ss = StatisticService::new(&cfg);

        ss.add_stats(input("a", "", &["1"], &[]));
        ss.add_stats(input("b", "", &["1"], &[]));
        ss.add_stats(input("c", "", &["1"], &[]));
        ss.aggregate_stats();

        let mut channels = ss.get_channels();
        channels.sort_unstable();
        assert_eq!(
            channels,
            vec!["a".to_string(), "b".to_string(), "default".to_string()],
        );
        assert!(ss.get_statistic("c").is_none());
    }

    #[test]
    fn test_events_apply_in_arrival_order() {
        let ss = service();
        // 512 views saturate the counter, then one more crosses into decay.
        for _ in 0..513 {
            ss.add_stats(input("default", "", &["9"], &[]));
        }
        ss.aggregate_stats();

        let rec = ss.get_statistic("default").expect("channel")[&9];
        assert_eq!(rec.views, 257);
        assert_eq!(rec.ftr, 1);
    }

    #[test]
    fn test_put_channel_data_restores_legacy_shapes() {
        let ss = service();
        ss.put_channel_data(
            "restored",
            HashMap::from([
                (
                    1,
                    StatRecord {
                        views: 100,
                        ..StatRecord::default()
                    },
                ),
                (-5, StatRecord::default()),
            ]),
            HashMap::from([(
                "fp1".to_string(),
                PersonalEntry {
                    data: HashMap::from([(
                        1,
                        StatRecord {
                            views: 50,
                            ..StatRecord::default()
                        },
                    )]),
                },
            )]),
        );

        let data = ss.get_statistic("restored").expect("channel");
        assert_eq!(data.len(), 1);
        assert_eq!(data[&1].views, 100);
        assert_eq!(
            ss.get_by_fingerprint("restored", "fp1").expect("fp")[&1].views,
            50,
        );
    }

    #[test]
    fn test_put_channel_data_v4_counts_backfills() {
        let ss = service();
        let backfilled = ss.put_channel_data_v4(
            "default",
            HashMap::new(),
            HashMap::from([
                (
                    "fp_dated".to_string(),
                    FingerprintPersistence {
                        data: HashMap::from([(
                            1,
                            StatRecord {
                                views: 1,
                                ..StatRecord::default()
                            },
                        )]),
                        last_seen: Some(Utc::now()),
                    },
                ),
                (
                    "fp_zero".to_string(),
                    FingerprintPersistence {
                        data: HashMap::new(),
                        last_seen: None,
                    },
                ),
            ]),
        );

        assert_eq!(backfilled, 1);
    }

    #[test]
    fn test_snapshot_is_stable_without_mutation() {
        let ss = service();
        ss.add_stats(input("default", "fp1", &["1"], &["1"]));
        ss.add_stats(input("news", "fp2", &["2"], &[]));
        ss.aggregate_stats();

        let a = ss.get_snapshot();
        let b = ss.get_snapshot();

        assert_eq!(a.version, b.version);
        assert_eq!(
            serde_json::to_value(&a).expect("a"),
            serde_json::to_value(&b).expect("b"),
        );
    }

    #[test]
    fn test_v5_round_trip() {
        let ss = service();
        ss.add_stats(input("default", "fp1", &["1", "2", "1"], &["2"]));
        ss.add_stats(input("news", "fp2", &["3"], &[]));
        ss.aggregate_stats();

        let bytes = ss.encode_v5().expect("encode");
        assert_eq!(&bytes[..4], b"SSD5");
        assert_eq!(bytes[4], 5);

        let restored = service();
        restored.decode_v5(&bytes).expect("decode");

        assert_eq!(
            ss.get_statistic("default").expect("src"),
            restored.get_statistic("default").expect("dst"),
        );
        assert_eq!(
            ss.get_by_fingerprint("default", "fp1").expect("src"),
            restored.get_by_fingerprint("default", "fp1").expect("dst"),
        );
        assert_eq!(
            ss.get_statistic("news").expect("src"),
            restored.get_statistic("news").expect("dst"),
        );
    }

    #[test]
    fn test_encode_v5_is_deterministic() {
        let ss = service();
        ss.add_stats(input("b", "", &["1"], &[]));
        ss.add_stats(input("a", "", &["2"], &[]));
        ss.aggregate_stats();

        assert_eq!(ss.encode_v5().expect("a"), ss.encode_v5().expect("b"));
    }

    #[test]
    fn test_decode_v5_rejects_garbage() {
        let ss = service();
        assert!(ss.decode_v5(b"SSD5").is_err());
        assert!(ss.decode_v5(b"nope").is_err());
    }

    #[test]
    fn test_totals() {
        let ss = service();
        ss.add_stats(input("default", "fp1", &["1", "2"], &[]));
        ss.add_stats(input("news", "fp2", &["3"], &[]));
        ss.aggregate_stats();

        assert_eq!(ss.trend_record_total(), 3);
        assert_eq!(ss.fingerprint_total(), 2);
        assert_eq!(ss.get_fingerprint_count("news"), 1);
    }
}
