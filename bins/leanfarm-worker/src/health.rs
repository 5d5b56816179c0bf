// Health, readiness and metrics endpoints for the worker

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::metrics::Metrics;
use crate::state::WorkerState;

pub struct HealthState {
    pub worker: Arc<WorkerState>,
    pub metrics: Arc<Metrics>,
    pub stale_after: Duration,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub heartbeat_age_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub in_flight: usize,
    pub concurrency_ceiling: usize,
    pub draining: bool,
}

pub fn routes() -> Router<Arc<HealthState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/metrics", get(metrics_handler))
}

/// GET /health - 200 while the control loop keeps beating
pub async fn health_check(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let snapshot = state.worker.snapshot();
    let live = state.worker.is_live(state.stale_after);
    let status = if live {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if live { "ok" } else { "stale" },
            heartbeat_age_seconds: snapshot.heartbeat_age_seconds,
        }),
    )
}

/// GET /ready - 200 while there is spare claim capacity
pub async fn ready_check(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let snapshot = state.worker.snapshot();
    let ready = state.worker.has_capacity();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready,
            in_flight: snapshot.in_flight,
            concurrency_ceiling: snapshot.concurrency_ceiling,
            draining: snapshot.draining,
        }),
    )
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler(State(state): State<Arc<HealthState>>) -> Response {
    match state.metrics.render(&state.worker.snapshot()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

/// Serve until `shutdown` flips to true
pub async fn serve(
    addr: SocketAddr,
    state: Arc<HealthState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Health server listening");

    let app = Router::new().merge(routes()).with_state(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health_state(ceiling: usize, stale_after: Duration) -> Arc<HealthState> {
        Arc::new(HealthState {
            worker: Arc::new(WorkerState::new(ceiling)),
            metrics: Arc::new(Metrics::new().unwrap()),
            stale_after,
        })
    }

    async fn status_of(response: impl IntoResponse) -> StatusCode {
        response.into_response().status()
    }

    #[tokio::test]
    async fn test_health_reflects_heartbeat() {
        let state = health_state(1, Duration::from_millis(50));
        assert_eq!(status_of(health_check(State(state.clone())).await).await, StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            status_of(health_check(State(state.clone())).await).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.worker.beat();
        assert_eq!(status_of(health_check(State(state)).await).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_tracks_capacity_and_drain() {
        let state = health_state(1, Duration::from_secs(60));
        assert_eq!(status_of(ready_check(State(state.clone())).await).await, StatusCode::OK);

        state.worker.job_started();
        assert_eq!(
            status_of(ready_check(State(state.clone())).await).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.worker.job_finished(crate::state::JobOutcome::Succeeded);
        state.worker.set_draining();
        assert_eq!(
            status_of(ready_check(State(state)).await).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_text() {
        let state = health_state(2, Duration::from_secs(60));
        let response = metrics_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
    }
}
