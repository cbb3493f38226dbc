//! Ingest and query HTTP surface.
//!
//! Thin glue over [`StatisticService`]: handlers validate nothing beyond
//! routing, hold no state of their own, and return the service's deep copies
//! directly as JSON.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::model::{InputStats, StatRecord};
use crate::service::StatisticService;

/// Builds the application router.
pub fn router(service: Arc<StatisticService>) -> Router {
    Router::new()
        .route("/stats", post(post_stats))
        .route("/statistic/{channel}", get(get_statistic))
        .route("/personal/{channel}", get(get_personal))
        .route("/personal/{channel}/{fingerprint}", get(get_by_fingerprint))
        .route("/channels", get(get_channels))
        .route("/buffer", get(get_buffer))
        .with_state(service)
}

/// Binds `addr` and serves the API until `cancel` fires.
pub async fn serve(
    addr: &str,
    service: Arc<StatisticService>,
    cancel: CancellationToken,
) -> Result<()> {
    // Parse address, handling ":port" shorthand.
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listening on {bind_addr}"))?;
    let local_addr = listener.local_addr().context("getting local address")?;

    let app = router(service);

    tokio::spawn(async move {
        info!(addr = %local_addr, "api server started");

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "api server error");
        }
    });

    Ok(())
}

/// POST /stats - buffer one interaction batch.
async fn post_stats(
    State(service): State<Arc<StatisticService>>,
    Json(input): Json<InputStats>,
) -> StatusCode {
    service.add_stats(input);
    StatusCode::ACCEPTED
}

/// GET /statistic/{channel} - trend counters for a channel.
async fn get_statistic(
    State(service): State<Arc<StatisticService>>,
    Path(channel): Path<String>,
) -> impl IntoResponse {
    match service.get_statistic(&channel) {
        Some(data) => Json(data).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /personal/{channel} - all fingerprints in a channel.
async fn get_personal(
    State(service): State<Arc<StatisticService>>,
    Path(channel): Path<String>,
) -> impl IntoResponse {
    match service.get_personal_statistic(&channel) {
        Some(data) => Json(data).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /personal/{channel}/{fingerprint} - one fingerprint's counters.
async fn get_by_fingerprint(
    State(service): State<Arc<StatisticService>>,
    Path((channel, fingerprint)): Path<(String, String)>,
) -> impl IntoResponse {
    match service.get_by_fingerprint(&channel, &fingerprint) {
        Some(data) => Json::<HashMap<u32, StatRecord>>(data).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /channels - sorted channel names.
async fn get_channels(State(service): State<Arc<StatisticService>>) -> Json<Vec<String>> {
    Json(service.get_channels())
}

/// GET /buffer - ingest buffer length, for diagnostics.
async fn get_buffer(State(service): State<Arc<StatisticService>>) -> Json<usize> {
    Json(service.get_buffer_size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatisticConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn service() -> Arc<StatisticService> {
        Arc::new(StatisticService::new(&StatisticConfig::default()))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn test_post_stats_is_accepted_and_buffered() {
        let svc = service();
        let app = router(Arc::clone(&svc));

        let response = app
            .oneshot(
                Request::post("/stats")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"f":"fp1","v":["1"],"ch":"news"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(svc.get_buffer_size(), 1);
    }

    #[tokio::test]
    async fn test_get_statistic_known_and_unknown_channel() {
        let svc = service();
        svc.add_stats(InputStats {
            views: vec!["1".into()],
            ..InputStats::default()
        });
        svc.aggregate_stats();

        let app = router(Arc::clone(&svc));
        let response = app
            .clone()
            .oneshot(
                Request::get("/statistic/default")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["1"]["Views"], 1);

        let missing = app
            .oneshot(
                Request::get("/statistic/ghost")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_by_fingerprint() {
        let svc = service();
        svc.add_stats(InputStats {
            fingerprint: "fp1".into(),
            views: vec!["1".into(), "2".into()],
            ..InputStats::default()
        });
        svc.aggregate_stats();

        let app = router(svc);
        let response = app
            .oneshot(
                Request::get("/personal/default/fp1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_object().expect("object").len(), 2);
    }

    #[tokio::test]
    async fn test_get_channels_sorted() {
        let svc = service();
        svc.add_stats(InputStats {
            views: vec!["1".into()],
            channel: "zebra".into(),
            ..InputStats::default()
        });
        svc.add_stats(InputStats {
            views: vec!["1".into()],
            channel: "alpha".into(),
            ..InputStats::default()
        });
        svc.aggregate_stats();

        let app = router(svc);
        let response = app
            .oneshot(Request::get("/channels").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        let json = body_json(response).await;
        assert_eq!(json, serde_json::json!(["alpha", "default", "zebra"]));
    }
}
