//! Background driver for aggregation and persistence ticks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::export::health::HealthMetrics;
use crate::service::StatisticService;
use crate::storage::cold::ColdStorage;
use crate::storage::file::FileManager;

/// Runs the aggregation and persistence tickers on one background task.
///
/// `ops_mu` serializes aggregation, periodic persistence, and the shutdown
/// persist so a snapshot never observes a half-applied batch.
pub struct Scheduler {
    service: Arc<StatisticService>,
    file_manager: Arc<FileManager>,
    cold: Arc<ColdStorage>,
    health: Arc<HealthMetrics>,
    snapshot_path: PathBuf,
    aggregate_interval: Duration,
    save_interval: Duration,
    ops_mu: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        service: Arc<StatisticService>,
        file_manager: Arc<FileManager>,
        cold: Arc<ColdStorage>,
        health: Arc<HealthMetrics>,
        snapshot_path: PathBuf,
        aggregate_interval: Duration,
        save_interval: Duration,
    ) -> Self {
        Self {
            service,
            file_manager,
            cold,
            health,
            snapshot_path,
            aggregate_interval,
            save_interval,
            ops_mu: Arc::new(tokio::sync::Mutex::new(())),
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Loads the snapshot and rebuilds the cold index. Called once before
    /// the tickers start.
    pub fn restore(&self) -> Result<()> {
        self.file_manager
            .load_from_file(&self.snapshot_path)
            .context("loading snapshot")?;
        self.cold.restore_index().context("restoring cold index")?;
        Ok(())
    }

    /// Spawns the ticker loop.
    pub async fn start(&self) {
        let service = Arc::clone(&self.service);
        let file_manager = Arc::clone(&self.file_manager);
        let cold = Arc::clone(&self.cold);
        let health = Arc::clone(&self.health);
        let snapshot_path = self.snapshot_path.clone();
        let ops_mu = Arc::clone(&self.ops_mu);
        let cancel = self.cancel.clone();
        let aggregate_interval = self.aggregate_interval;
        let save_interval = self.save_interval;

        let task = tokio::spawn(async move {
            let mut aggregate_ticker = tokio::time::interval(aggregate_interval);
            aggregate_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut persist_ticker = tokio::time::interval(save_interval);
            persist_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            // Consume the immediate first tick of each ticker; state was just
            // restored and there is nothing to aggregate yet.
            aggregate_ticker.tick().await;
            persist_ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("scheduler stopped");
                        return;
                    }

                    _ = aggregate_ticker.tick() => {
                        let _guard = ops_mu.lock().await;
                        Self::do_aggregate(&service, &cold, &health);
                    }

                    _ = persist_ticker.tick() => {
                        let _guard = ops_mu.lock().await;
                        Self::do_persist(&file_manager, &cold, &health, &snapshot_path);
                    }
                }
            }
        });

        *self.task.lock().await = Some(task);

        info!(
            aggregate_interval = ?self.aggregate_interval,
            save_interval = ?self.save_interval,
            snapshot = %self.snapshot_path.display(),
            "scheduler started",
        );
    }

    fn do_aggregate(
        service: &StatisticService,
        cold: &ColdStorage,
        health: &HealthMetrics,
    ) {
        let start = Instant::now();
        let applied = service.aggregate_stats();
        service.evict_expired_fingerprints();

        health.events_aggregated.inc_by(applied as f64);
        health.aggregation_duration.observe(start.elapsed().as_secs_f64());
        health.ingest_buffer_len.set(service.get_buffer_size() as f64);
        health.channels.set(service.get_channels().len() as f64);
        health.trend_records.set(service.trend_record_total() as f64);
        health
            .fingerprints_resident
            .set(service.fingerprint_total() as f64);
        health.cold_pending.set(cold.pending_total() as f64);

        if applied > 0 {
            debug!(events = applied, "aggregated statistics");
        }
    }

    /// Writes the snapshot and flushes cold storage. Failures are logged and
    /// absorbed; in-memory state is untouched and the next tick retries.
    fn do_persist(
        file_manager: &FileManager,
        cold: &ColdStorage,
        health: &HealthMetrics,
        path: &std::path::Path,
    ) {
        let start = Instant::now();

        if let Err(e) = file_manager.save_to_file(path) {
            health.persist_errors.inc();
            error!(error = %e, "persisting snapshot failed");
            return;
        }

        if let Err(e) = cold.flush() {
            health.persist_errors.inc();
            error!(error = %e, "flushing cold storage failed");
            return;
        }

        let elapsed = start.elapsed();
        health.persist_duration.observe(elapsed.as_secs_f64());
        debug!(elapsed = ?elapsed, "persisted statistics");
    }

    /// Signals the loop to exit after its current tick and waits for it.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = { self.task.lock().await.take() };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task join failed");
            }
        }
    }

    /// Synchronous final persist, used during shutdown after [`stop`].
    ///
    /// [`stop`]: Scheduler::stop
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.ops_mu.lock().await;

        info!("persisting statistics before shutdown");
        self.file_manager
            .save_to_file(&self.snapshot_path)
            .context("saving snapshot")?;
        self.cold.flush().context("flushing cold storage")?;
        Ok(())
    }
}
