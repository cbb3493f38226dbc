//! Snapshot persistence driver.
//!
//! Saves always write the binary V5 layout; loads fall back through every
//! format generation, newest first, so a daemon upgrade can restore any file
//! an earlier build produced.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::StatRecord;
use crate::service::StatisticService;
use crate::storage::{ChannelData, PersonalEntry, Storage, StorageV4};

use super::codec::{CodecError, MAGIC};
use super::compress;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot matches no supported format")]
    UnknownFormat,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct FileManager {
    service: Arc<StatisticService>,
}

impl FileManager {
    pub fn new(service: Arc<StatisticService>) -> Self {
        Self { service }
    }

    /// Serializes the engine to `path` using the atomic write protocol.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let raw = self.service.encode_v5().context("encoding snapshot")?;
        let compressed = compress::compress(&raw).context("compressing snapshot")?;
        atomic_write(path, &compressed)
            .with_context(|| format!("writing snapshot {}", path.display()))?;

        debug!(
            path = %path.display(),
            raw_bytes = raw.len(),
            compressed_bytes = compressed.len(),
            "snapshot written",
        );
        Ok(())
    }

    /// Restores engine state from `path`. A missing file is empty initial
    /// state, not an error; an unreadable or unrecognizable file is.
    pub fn load_from_file(&self, path: &Path) -> Result<()> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot file, starting empty");
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading snapshot {}", path.display()))
            }
        };

        let buf = compress::decompress(&raw)
            .with_context(|| format!("decompressing snapshot {}", path.display()))?;

        if buf.starts_with(&MAGIC) {
            self.service
                .decode_v5(&buf)
                .map_err(SnapshotError::Codec)
                .with_context(|| format!("decoding snapshot {}", path.display()))?;
            info!(path = %path.display(), "snapshot loaded");
            return Ok(());
        }

        self.load_legacy_json(&buf)
            .with_context(|| format!("migrating legacy snapshot {}", path.display()))
    }

    /// Walks the JSON generations newest first: V4 envelope (which V3 files
    /// also satisfy, minus timestamps), explicit V3, V2, then bare V1.
    fn load_legacy_json(&self, buf: &[u8]) -> Result<()> {
        let value: Value =
            serde_json::from_slice(buf).map_err(|_| SnapshotError::UnknownFormat)?;

        let Value::Object(root) = &value else {
            return Err(SnapshotError::UnknownFormat.into());
        };

        if root.contains_key("channels") {
            let declared = root.get("version").and_then(Value::as_i64).unwrap_or(0);

            if let Ok(storage) = serde_json::from_value::<StorageV4>(value.clone()) {
                let mut backfilled = 0;
                for (name, data) in storage.channels {
                    backfilled +=
                        self.service
                            .put_channel_data_v4(&name, data.trend_stats, data.personal_stats);
                }
                if declared < 4 && backfilled > 0 {
                    warn!(
                        fingerprints = backfilled,
                        "pre-V4 snapshot, backfilled last-seen timestamps",
                    );
                }
                info!(version = declared.max(3), "legacy snapshot migrated");
                return Ok(());
            }

            // Channel envelope that would not parse as V4; take the V3 shape.
            let storage: Storage =
                serde_json::from_value(value).map_err(|_| SnapshotError::UnknownFormat)?;
            for (name, data) in storage.channels {
                self.service
                    .put_channel_data(&name, data.trend_stats, data.personal_stats);
            }
            info!(version = 3, "legacy snapshot migrated");
            return Ok(());
        }

        if root.contains_key("trend_stats") && root.contains_key("personal_stats") {
            let data: ChannelData =
                serde_json::from_value(value).map_err(|_| SnapshotError::UnknownFormat)?;
            self.service.put_channel_data(
                crate::model::DEFAULT_CHANNEL,
                data.trend_stats,
                data.personal_stats,
            );
            info!(version = 2, "legacy snapshot migrated");
            return Ok(());
        }

        let trend: HashMap<i64, StatRecord> =
            serde_json::from_value(value).map_err(|_| SnapshotError::UnknownFormat)?;
        self.service.put_channel_data(
            crate::model::DEFAULT_CHANNEL,
            trend,
            HashMap::<String, PersonalEntry>::new(),
        );
        info!(version = 1, "legacy snapshot migrated");
        Ok(())
    }
}

/// Writes `data` to `path` via tmp file, fsync, and rename. A failed step
/// removes the tmp file so no partial snapshot is ever observable.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(tmp)?;
        io::Write::write_all(&mut file, data)?;
        file.sync_all()?;
        fs::rename(tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(tmp);
    }

    result.with_context(|| format!("atomic write to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatisticConfig;
    use crate::model::InputStats;
    use tempfile::TempDir;

    fn service() -> Arc<StatisticService> {
        Arc::new(StatisticService::new(&StatisticConfig {
            max_channels: 1000,
            ..StatisticConfig::default()
        }))
    }

    fn write_compressed_json(path: &Path, json: &str) {
        let compressed = compress::compress(json.as_bytes()).expect("compress");
        fs::write(path, compressed).expect("write");
    }

    #[test]
    fn test_save_creates_file_without_tmp_leftover() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("snap.db");

        let svc = service();
        svc.add_stats(InputStats {
            views: vec!["1".into()],
            ..InputStats::default()
        });
        svc.aggregate_stats();

        let fm = FileManager::new(svc);
        fm.save_to_file(&path).expect("save");

        assert!(path.exists());
        assert!(!dir.path().join("snap.db.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let fm = FileManager::new(service());
        fm.load_from_file(Path::new("/nonexistent/snap.db"))
            .expect("missing file is fine");
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("snap.db");

        let svc = service();
        svc.add_stats(InputStats {
            fingerprint: "fp1".into(),
            views: vec!["1".into(), "2".into()],
            clicks: vec!["1".into()],
            channel: "default".into(),
        });
        svc.add_stats(InputStats {
            fingerprint: "fp2".into(),
            views: vec!["3".into()],
            clicks: vec![],
            channel: "news".into(),
        });
        svc.aggregate_stats();
        FileManager::new(Arc::clone(&svc)).save_to_file(&path).expect("save");

        let restored = service();
        FileManager::new(Arc::clone(&restored))
            .load_from_file(&path)
            .expect("load");

        let data = restored.get_statistic("default").expect("channel");
        assert_eq!(data[&1].views, 1);
        assert_eq!(data[&1].clicks, 1);
        assert_eq!(
            restored.get_statistic("news").expect("channel")[&3].views,
            1,
        );
        assert_eq!(
            restored.get_by_fingerprint("default", "fp1").expect("fp"),
            svc.get_by_fingerprint("default", "fp1").expect("fp"),
        );
    }

    #[test]
    fn test_load_v1_bare_map() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("v1.db");
        write_compressed_json(&path, r#"{"1":{"Views":42,"Clicks":5,"Ftr":0}}"#);

        let svc = service();
        FileManager::new(Arc::clone(&svc))
            .load_from_file(&path)
            .expect("load");

        let data = svc.get_statistic("default").expect("channel");
        assert_eq!(data[&1].views, 42);
        assert_eq!(data[&1].clicks, 5);
    }

    #[test]
    fn test_load_v2_root_pair() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("v2.db");
        write_compressed_json(
            &path,
            r#"{
                "trend_stats": {"1": {"Views": 100, "Clicks": 0, "Ftr": 0}},
                "personal_stats": {"fp1": {"Data": {"1": {"Views": 50, "Clicks": 0, "Ftr": 0}}}}
            }"#,
        );

        let svc = service();
        FileManager::new(Arc::clone(&svc))
            .load_from_file(&path)
            .expect("load");

        assert_eq!(svc.get_statistic("default").expect("channel")[&1].views, 100);
        assert_eq!(
            svc.get_by_fingerprint("default", "fp1").expect("fp")[&1].views,
            50,
        );
    }

    #[test]
    fn test_load_v3_channels() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("v3.db");
        write_compressed_json(
            &path,
            r#"{
                "channels": {
                    "default": {
                        "trend_stats": {"1": {"Views": 10, "Clicks": 0, "Ftr": 0}},
                        "personal_stats": {"fp1": {"Data": {"1": {"Views": 5, "Clicks": 0, "Ftr": 0}}}}
                    },
                    "news": {
                        "trend_stats": {"2": {"Views": 20, "Clicks": 0, "Ftr": 0}},
                        "personal_stats": {}
                    }
                }
            }"#,
        );

        let svc = service();
        FileManager::new(Arc::clone(&svc))
            .load_from_file(&path)
            .expect("load");

        assert_eq!(svc.get_statistic("default").expect("channel")[&1].views, 10);
        assert_eq!(svc.get_statistic("news").expect("channel")[&2].views, 20);
        assert_eq!(
            svc.get_by_fingerprint("default", "fp1").expect("fp")[&1].views,
            5,
        );
    }

    #[test]
    fn test_load_v4_preserves_last_seen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("v4.db");
        write_compressed_json(
            &path,
            r#"{
                "version": 4,
                "channels": {
                    "default": {
                        "trend_stats": {"1": {"Views": 10, "Clicks": 0, "Ftr": 0}},
                        "personal_stats": {
                            "fp1": {
                                "data": {"1": {"Views": 5, "Clicks": 0, "Ftr": 0}},
                                "last_seen": "2025-06-15T12:00:00Z"
                            }
                        }
                    }
                }
            }"#,
        );

        let svc = service();
        FileManager::new(Arc::clone(&svc))
            .load_from_file(&path)
            .expect("load");

        assert_eq!(svc.get_statistic("default").expect("channel")[&1].views, 10);

        // Saving again keeps the restored timestamp.
        let snapshot = svc.get_snapshot();
        let fp1 = &snapshot.channels["default"].personal_stats["fp1"];
        assert_eq!(
            fp1.last_seen.expect("timestamp").timestamp(),
            chrono::DateTime::parse_from_rfc3339("2025-06-15T12:00:00Z")
                .expect("parse")
                .timestamp(),
        );
    }

    #[test]
    fn test_legacy_load_then_save_produces_v5() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("v1.db");
        write_compressed_json(&path, r#"{"1":{"Views":42,"Clicks":5,"Ftr":0}}"#);

        let svc = service();
        let fm = FileManager::new(Arc::clone(&svc));
        fm.load_from_file(&path).expect("load");

        let out = dir.path().join("out.db");
        fm.save_to_file(&out).expect("save");

        let raw = fs::read(&out).expect("read");
        let buf = compress::decompress(&raw).expect("decompress");
        assert_eq!(&buf[..4], b"SSD5");
    }

    #[test]
    fn test_unrecognizable_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("bad.db");
        write_compressed_json(&path, r#"["not", "a", "snapshot"]"#);

        let fm = FileManager::new(service());
        assert!(fm.load_from_file(&path).is_err());
    }

    #[test]
    fn test_non_zstd_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("raw.db");
        fs::write(&path, b"plain bytes").expect("write");

        let fm = FileManager::new(service());
        assert!(fm.load_from_file(&path).is_err());
    }

    #[test]
    fn test_atomic_write_cleans_up_on_failure() {
        let dir = TempDir::new().expect("tempdir");
        // Target path sits below a file, so create_dir_all fails.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").expect("write");

        let path = blocker.join("snap.db");
        assert!(atomic_write(&path, b"data").is_err());
    }
}
