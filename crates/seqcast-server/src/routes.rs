// ABOUTME: Route definitions and handler functions for the seqcast HTTP surface.
// ABOUTME: Health and status endpoints plus the WebSocket upgrade, wrapped in an HTTP trace layer.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use tower_http::trace::TraceLayer;

use crate::app_state::SharedState;
use crate::ws::ws_handler;

/// Build the complete Axum router with all routes and shared state.
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler. Returns 200 OK with a simple JSON body.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Log bounds, ingestion watermark, and live connections.
async fn status(State(state): State<SharedState>) -> Response {
    let reader = state.reader.clone();
    let read = tokio::task::spawn_blocking(move || {
        let bounds = reader.bounds()?;
        let watermark = reader.watermark()?;
        Ok::<_, seqcast_store::StoreError>((bounds, watermark))
    })
    .await;

    let (bounds, watermark) = match read {
        Ok(Ok(read)) => read,
        Ok(Err(e)) => {
            tracing::error!("failed to read log status: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("failed to read log: {}", e) })),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("status task failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "status task failed" })),
            )
                .into_response();
        }
    };

    Json(serde_json::json!({
        "head": bounds.head,
        "minRetained": bounds.min_retained,
        "watermark": watermark,
        "connections": state.registry.list(),
        "subscribers": state.bus.subscriber_count(),
        "shuttingDown": state.is_shutting_down(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::AppState;
    use crate::auth::StaticTokenAuthenticator;
    use crate::connection::ConnectionSettings;
    use axum::body::Body;
    use http::Request;
    use seqcast_core::testing::StubSnapshotProvider;
    use seqcast_core::{EventPayload, Origin, PublishBus, ReplayPolicy, SourceEvent};
    use seqcast_store::{EventLog, RetentionPolicy};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(dir: &TempDir, events: u64) -> SharedState {
        let (mut writer, reader) =
            EventLog::open(&dir.path().join("events.db"), RetentionPolicy::new(5)).unwrap();
        for block in 1..=events {
            writer
                .append(&SourceEvent::new(
                    Origin::new(block, 1, format!("h{block}")),
                    EventPayload::ProfileUpdated {
                        player: "0xbeef".to_string(),
                        display_name: Some("beef".to_string()),
                        avatar_uri: None,
                    },
                ))
                .unwrap();
        }
        writer.enforce_retention().unwrap();

        Arc::new(AppState::new(
            reader,
            Arc::new(PublishBus::new(16)),
            Arc::new(StaticTokenAuthenticator::single("alice", "secret")),
            Arc::new(StubSnapshotProvider::at(events)),
            ReplayPolicy::default(),
            Duration::from_secs(1),
            ConnectionSettings::default(),
        ))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir, 0));

        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_log_bounds() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir, 20));

        let (status, json) = get_json(app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["head"], 20);
        assert_eq!(json["minRetained"], 16);
        assert_eq!(json["watermark"]["lastAssignedSequenceId"], 20);
        assert_eq!(json["watermark"]["lastOrigin"]["key"]["block"], 20);
        assert_eq!(json["connections"], serde_json::json!([]));
        assert_eq!(json["shuttingDown"], false);
    }

    #[tokio::test]
    async fn status_on_empty_log() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir, 0));

        let (_, json) = get_json(app, "/status").await;
        assert_eq!(json["head"], 0);
        assert_eq!(json["minRetained"], 1);
        assert_eq!(json["watermark"]["lastOrigin"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn ws_requires_upgrade() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir, 0));

        let resp = app
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }
}
