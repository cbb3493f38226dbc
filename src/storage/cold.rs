//! Write-behind disk tier for evicted fingerprints.
//!
//! Evictions are buffered in memory and hit disk only on [`ColdStorage::flush`],
//! which runs on the persistence tick. Restores prefer the pending buffer,
//! then a lazily-loaded per-channel file; restored entries are deleted from
//! disk lazily at the next flush.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::model::personal::ColdTier;
use crate::model::StatRecord;

use super::file::atomic_write;
use super::{compress, sanitize_ids, widen_ids};

const COLD_FILE_SUFFIX: &str = ".cold.zst";

/// A single evicted fingerprint on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColdEntry {
    #[serde(rename = "data")]
    data: HashMap<i64, StatRecord>,
    #[serde(rename = "evicted_at")]
    evicted_at: DateTime<Utc>,
}

/// On-disk payload for one channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ColdFile {
    #[serde(rename = "entries", default)]
    entries: HashMap<String, ColdEntry>,
}

#[derive(Default)]
struct ColdState {
    /// channel -> fingerprints known to be cold; the authoritative oracle.
    index: HashMap<String, HashSet<String>>,
    /// channel -> entries not yet written to disk.
    pending: HashMap<String, HashMap<String, ColdEntry>>,
    /// channel -> fingerprints to delete from disk at the next flush.
    restored: HashMap<String, HashSet<String>>,
    /// channel -> cached cold file.
    loaded: HashMap<String, ColdFile>,
}

pub struct ColdStorage {
    dir: PathBuf,
    cold_ttl: Duration,
    state: RwLock<ColdState>,
}

impl ColdStorage {
    /// Creates the tier over `dir`; a zero `cold_ttl` keeps entries forever.
    pub fn new(dir: PathBuf, cold_ttl: Duration) -> Self {
        Self {
            dir,
            cold_ttl,
            state: RwLock::new(ColdState::default()),
        }
    }

    /// Writes pending entries, applies lazy deletes, and garbage-collects
    /// expired entries. The only method that performs disk writes; on failure
    /// it returns early with `pending` and `restored` intact so the next
    /// flush retries.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.write();

        let mut channels: HashSet<String> = st.pending.keys().cloned().collect();
        channels.extend(st.restored.keys().cloned());

        for channel in channels {
            let mut file = match st.loaded.remove(&channel) {
                Some(file) => file,
                None => self.load_from_disk(&channel).unwrap_or_default(),
            };

            if let Some(restored) = st.restored.get(&channel) {
                for fp in restored {
                    file.entries.remove(fp);
                }
            }

            if let Some(pending) = st.pending.get(&channel) {
                for (fp, entry) in pending {
                    file.entries.insert(fp.clone(), entry.clone());
                }
            }

            if !self.cold_ttl.is_zero() {
                let now = Utc::now();
                let index = st.index.entry(channel.clone()).or_default();
                let ttl = self.cold_ttl;
                file.entries.retain(|fp, entry| {
                    let expired = now
                        .signed_duration_since(entry.evicted_at)
                        .to_std()
                        .map(|idle| idle > ttl)
                        .unwrap_or(false);
                    if expired {
                        index.remove(fp);
                    }
                    !expired
                });
            }

            if file.entries.is_empty() {
                let _ = fs::remove_file(self.cold_file_path(&channel));
            } else {
                self.write_cold_file(&channel, &file)?;
                st.loaded.insert(channel.clone(), file);
            }

            st.pending.remove(&channel);
            st.restored.remove(&channel);
        }

        Ok(())
    }

    /// Scans the cold directory and rebuilds the fingerprint index. Entry
    /// data is not cached; only the keys. Unreadable files are logged and
    /// skipped, losing their fingerprints.
    pub fn restore_index(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cold directory {}", self.dir.display()))?;

        let mut st = self.state.write();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("reading cold directory {}", self.dir.display()))?
        {
            let path = entry?.path();
            let Some(channel) = channel_from_path(&path) else {
                continue;
            };

            let Some(file) = self.load_from_disk(channel) else {
                continue;
            };

            debug!(channel, fingerprints = file.entries.len(), "indexed cold file");
            st.index
                .insert(channel.to_string(), file.entries.keys().cloned().collect());
        }

        Ok(())
    }

    /// Total entries buffered for the next flush, for diagnostics.
    pub fn pending_total(&self) -> usize {
        let st = self.state.read();
        st.pending.values().map(HashMap::len).sum()
    }

    fn cold_file_path(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{channel}{COLD_FILE_SUFFIX}"))
    }

    /// Reads and decodes one channel's cold file. A missing file is normal;
    /// corruption is logged and treated as missing.
    fn load_from_disk(&self, channel: &str) -> Option<ColdFile> {
        let path = self.cold_file_path(channel);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                error!(path = %path.display(), error = %e, "reading cold file");
                return None;
            }
        };

        let decompressed = match compress::decompress(&raw) {
            Ok(d) => d,
            Err(e) => {
                error!(path = %path.display(), error = %e, "decompressing cold file");
                return None;
            }
        };

        match serde_json::from_slice(&decompressed) {
            Ok(file) => Some(file),
            Err(e) => {
                error!(path = %path.display(), error = %e, "parsing cold file");
                None
            }
        }
    }

    fn write_cold_file(&self, channel: &str, file: &ColdFile) -> Result<()> {
        let json = serde_json::to_vec(file).context("encoding cold file")?;
        let compressed = compress::compress(&json).context("compressing cold file")?;

        let path = self.cold_file_path(channel);
        atomic_write(&path, &compressed)
            .with_context(|| format!("writing cold file {}", path.display()))
    }
}

/// Derives the channel name from a cold file path. Only the suffix is
/// stripped, so dots inside channel names survive.
fn channel_from_path(path: &Path) -> Option<&str> {
    path.file_name()?.to_str()?.strip_suffix(COLD_FILE_SUFFIX)
}

impl ColdTier for ColdStorage {
    fn has(&self, channel: &str, fingerprint: &str) -> bool {
        let st = self.state.read();
        st.index
            .get(channel)
            .is_some_and(|fps| fps.contains(fingerprint))
    }

    /// Buffers an eviction; no disk I/O. A re-eviction of the same
    /// fingerprint before the next flush overwrites the buffered entry.
    fn evict(&self, channel: &str, fingerprint: &str, data: HashMap<u32, StatRecord>) {
        let entry = ColdEntry {
            data: widen_ids(data),
            evicted_at: Utc::now(),
        };

        let mut st = self.state.write();
        st.pending
            .entry(channel.to_string())
            .or_default()
            .insert(fingerprint.to_string(), entry);
        st.index
            .entry(channel.to_string())
            .or_default()
            .insert(fingerprint.to_string());
    }

    fn restore(&self, channel: &str, fingerprint: &str) -> Option<HashMap<u32, StatRecord>> {
        let mut st = self.state.write();

        // Pending hit: the entry never reached disk, hand it straight back.
        if let Some(entries) = st.pending.get_mut(channel) {
            if let Some(entry) = entries.remove(fingerprint) {
                if entries.is_empty() {
                    st.pending.remove(channel);
                }
                if let Some(idx) = st.index.get_mut(channel) {
                    idx.remove(fingerprint);
                }
                return Some(sanitize_ids(entry.data));
            }
        }

        // Lazy load the channel's cold file into the cache.
        if !st.loaded.contains_key(channel) {
            if let Some(file) = self.load_from_disk(channel) {
                st.loaded.insert(channel.to_string(), file);
            }
        }

        let data = st
            .loaded
            .get(channel)
            .and_then(|file| file.entries.get(fingerprint))
            .map(|entry| entry.data.clone());

        match data {
            Some(data) => {
                // Lazy delete: the on-disk entry goes away at the next flush.
                st.restored
                    .entry(channel.to_string())
                    .or_default()
                    .insert(fingerprint.to_string());
                if let Some(idx) = st.index.get_mut(channel) {
                    idx.remove(fingerprint);
                }
                Some(sanitize_ids(data))
            }
            None => {
                // Stale index entry; purge it.
                if let Some(idx) = st.index.get_mut(channel) {
                    idx.remove(fingerprint);
                }
                None
            }
        }
    }
}
