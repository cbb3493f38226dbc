use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for daemon health and observability.
///
/// All metrics use the "trendd" namespace. Gauges are refreshed by the
/// scheduler on every aggregation tick.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Events in the ingest buffer awaiting aggregation.
    pub ingest_buffer_len: Gauge,
    /// Channels in the directory, including the default channel.
    pub channels: Gauge,
    /// Trend records across all channels.
    pub trend_records: Gauge,
    /// Fingerprints resident in memory across all channels.
    pub fingerprints_resident: Gauge,
    /// Cold-storage entries buffered for the next flush.
    pub cold_pending: Gauge,
    /// Total events applied by aggregation ticks.
    pub events_aggregated: Counter,
    /// Total failed snapshot or cold-storage writes.
    pub persist_errors: Counter,
    /// Aggregation tick duration in seconds.
    pub aggregation_duration: Histogram,
    /// Persistence tick duration in seconds.
    pub persist_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let ingest_buffer_len = Gauge::with_opts(
            Opts::new(
                "ingest_buffer_length",
                "Events in the ingest buffer awaiting aggregation.",
            )
            .namespace("trendd"),
        )?;
        let channels = Gauge::with_opts(
            Opts::new("channels", "Channels in the directory.").namespace("trendd"),
        )?;
        let trend_records = Gauge::with_opts(
            Opts::new("trend_records", "Trend records across all channels.").namespace("trendd"),
        )?;
        let fingerprints_resident = Gauge::with_opts(
            Opts::new(
                "fingerprints_resident",
                "Fingerprints resident in memory across all channels.",
            )
            .namespace("trendd"),
        )?;
        let cold_pending = Gauge::with_opts(
            Opts::new(
                "cold_pending_entries",
                "Cold-storage entries buffered for the next flush.",
            )
            .namespace("trendd"),
        )?;
        let events_aggregated = Counter::with_opts(
            Opts::new(
                "events_aggregated_total",
                "Total events applied by aggregation ticks.",
            )
            .namespace("trendd"),
        )?;
        let persist_errors = Counter::with_opts(
            Opts::new(
                "persist_errors_total",
                "Total failed snapshot or cold-storage writes.",
            )
            .namespace("trendd"),
        )?;
        let aggregation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "aggregation_duration_seconds",
                "Aggregation tick duration in seconds.",
            )
            .namespace("trendd")
            .buckets(vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let persist_duration = Histogram::with_opts(
            HistogramOpts::new(
                "persist_duration_seconds",
                "Persistence tick duration in seconds.",
            )
            .namespace("trendd")
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(ingest_buffer_len.clone()))?;
        registry.register(Box::new(channels.clone()))?;
        registry.register(Box::new(trend_records.clone()))?;
        registry.register(Box::new(fingerprints_resident.clone()))?;
        registry.register(Box::new(cold_pending.clone()))?;
        registry.register(Box::new(events_aggregated.clone()))?;
        registry.register(Box::new(persist_errors.clone()))?;
        registry.register(Box::new(aggregation_duration.clone()))?;
        registry.register(Box::new(persist_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            ingest_buffer_len,
            channels,
            trend_records,
            fingerprints_resident,
            cold_pending,
            events_aggregated,
            persist_errors,
            aggregation_duration,
            persist_duration,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_without_collision() {
        let health = HealthMetrics::new(":9090").expect("metrics");
        health.channels.set(3.0);
        health.events_aggregated.inc_by(10.0);

        let families = health.registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "trendd_channels"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "trendd_events_aggregated_total"));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }
}
