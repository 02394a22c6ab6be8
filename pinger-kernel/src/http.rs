/**
 * HEALTH API - liveness of the probe loop over HTTP
 *
 * ROLE:
 * Answers `GET /health` for container orchestrators and uptime checks.
 * The body is the supervisor's last published snapshot plus the error
 * counters; `status` turns `stale` when no cycle completed recently.
 *
 * The handler only reads the health tracker, never waits on probes, and
 * answers 200 even when stale: staleness is data, not a transport error.
 */

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::health::{HealthReport, HealthTracker};
use crate::state::Shutdown;

#[derive(Clone)]
pub struct AppState {
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .with_state(app_state)
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<HealthReport> {
    Json(app.health.report())
}

/// Binds the health port. Done before the supervisor starts so a taken port
/// stops the process instead of leaving it running without a health signal.
pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "health endpoint listening");
    Ok(listener)
}

/// Serves the router until shutdown is requested.
pub async fn serve(listener: TcpListener, app_state: AppState, mut shutdown: Shutdown) -> std::io::Result<()> {
    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get_json(health: HealthTracker) -> (StatusCode, serde_json::Value) {
        let app = build_router(AppState { health });
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_last_cycle() {
        let health = HealthTracker::new(180);
        health.publish_cycle(Duration::from_secs(4), 55, Duration::from_secs(15), 6, 120, 3);
        health.counters().icmp_timeout.add(6);

        let (status, body) = get_json(health).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["current_limit"], 55);
        assert_eq!(body["current_interval"], 15);
        assert_eq!(body["offline_count"], 6);
        assert_eq!(body["device_count"], 120);
        assert_eq!(body["cycles_completed"], 1);
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["errors"]["icmp_timeout"], 6);
        assert!(body["last_cycle_finish"].is_string());
    }

    #[tokio::test]
    async fn stale_is_still_200() {
        let health = HealthTracker::new(180);
        health.mark_cycle_failed();
        let (status, body) = get_json(health).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stale");
        assert!(body["last_cycle_finish"].is_null());
    }

    #[tokio::test]
    async fn taken_port_fails_to_bind() {
        let first = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let taken = first.local_addr().unwrap();
        assert!(bind(taken).await.is_err());
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let listener = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, shutdown) = crate::state::shutdown_channel();
        let server = tokio::spawn(serve(listener, AppState { health: HealthTracker::new(180) }, shutdown));

        let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        drop(resp);

        trigger.trigger();
        let served = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert!(served.is_ok());
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = build_router(AppState { health: HealthTracker::new(180) });
        let resp = app
            .oneshot(Request::builder().uri("/hosts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
