// ABOUTME: HTTP snapshot provider that asks an external projection service for a point-in-time snapshot.
// ABOUTME: Issues GET {base}/snapshot?atLeast=N and validates the returned sequence tag.

use std::time::Duration;

use async_trait::async_trait;
use seqcast_core::{Snapshot, SnapshotError, SnapshotProvider, SnapshotRequest};

/// Fetches snapshots over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpSnapshotProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSnapshotProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SnapshotError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, request: SnapshotRequest) -> String {
        match request {
            SnapshotRequest::Latest => format!("{}/snapshot", self.base_url),
            SnapshotRequest::AtLeast(id) => format!("{}/snapshot?atLeast={}", self.base_url, id),
        }
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    async fn snapshot(&self, request: SnapshotRequest) -> Result<Snapshot, SnapshotError> {
        let url = self.url(request);
        tracing::debug!(%url, "requesting snapshot");

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                SnapshotError::Timeout
            } else {
                SnapshotError::Unavailable(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SnapshotError::Unavailable(format!(
                "snapshot service returned {status}"
            )));
        }

        let snapshot: Snapshot = resp
            .json()
            .await
            .map_err(|e| SnapshotError::InvalidResponse(e.to_string()))?;

        let required = request.min_sequence_id();
        if snapshot.at_sequence_id < required {
            return Err(SnapshotError::Stale {
                required,
                got: snapshot.at_sequence_id,
            });
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Query;
    use axum::routing::get;
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn url_carries_lower_bound() {
        let provider = HttpSnapshotProvider::new("http://snap.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(provider.url(SnapshotRequest::Latest), "http://snap.local/snapshot");
        assert_eq!(
            provider.url(SnapshotRequest::AtLeast(2000)),
            "http://snap.local/snapshot?atLeast=2000"
        );
    }

    #[tokio::test]
    async fn fetches_snapshot_from_service() {
        let router = Router::new().route(
            "/snapshot",
            get(|Query(q): Query<HashMap<String, u64>>| async move {
                let at = q.get("atLeast").copied().unwrap_or(0);
                axum::Json(serde_json::json!({
                    "payload": { "crews": [] },
                    "atSequenceId": at + 3,
                }))
            }),
        );
        let base = serve(router).await;

        let provider = HttpSnapshotProvider::new(base, Duration::from_secs(2)).unwrap();
        let snap = provider.snapshot(SnapshotRequest::AtLeast(2000)).await.unwrap();
        assert_eq!(snap.at_sequence_id, 2003);
        assert_eq!(snap.payload["crews"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn stale_snapshot_is_rejected() {
        let router = Router::new().route(
            "/snapshot",
            get(|| async {
                axum::Json(serde_json::json!({ "payload": {}, "atSequenceId": 10 }))
            }),
        );
        let base = serve(router).await;

        let provider = HttpSnapshotProvider::new(base, Duration::from_secs(2)).unwrap();
        let err = provider.snapshot(SnapshotRequest::AtLeast(50)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Stale { required: 50, got: 10 }));
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let router = Router::new().route(
            "/snapshot",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let base = serve(router).await;

        let provider = HttpSnapshotProvider::new(base, Duration::from_secs(2)).unwrap();
        let err = provider.snapshot(SnapshotRequest::Latest).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Unavailable(_)));
    }
}
