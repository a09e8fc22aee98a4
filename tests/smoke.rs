// ABOUTME: End-to-end smoke test for the full seqcast pipeline over a real WebSocket.
// ABOUTME: Ingests 2000 events with a 1000-event window, then resumes one client by snapshot and one incrementally.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Body;
use futures::{SinkExt, StreamExt};
use http::Request;
use seqcast_core::testing::StubSnapshotProvider;
use seqcast_core::{EventPayload, Origin, PublishBus, ReplayPolicy, SourceEvent};
use seqcast_ingest::{ChannelSource, IngestPipeline, spawn_ingestion};
use seqcast_server::{
    AppState, ConnectionSettings, SharedState, StaticTokenAuthenticator, create_router,
};
use seqcast_store::{EventLog, EventLogReader, RetentionPolicy};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tower::ServiceExt;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);
// Every commit is fsynced, so bulk ingestion gets a longer deadline.
const INGEST_WAIT: Duration = Duration::from_secs(60);

struct Deployment {
    _dir: tempfile::TempDir,
    state: SharedState,
    reader: EventLogReader,
    feed: mpsc::Sender<SourceEvent>,
    head: Arc<AtomicU64>,
    _stop_ingest: watch::Sender<bool>,
}

fn source_event(block: u64) -> SourceEvent {
    SourceEvent::new(
        Origin::new(block, 0, format!("0xblock{block}")),
        EventPayload::ScoreRecorded {
            player: format!("0xplayer{}", block % 7),
            season: 1,
            points: (block * 3) as i64,
        },
    )
}

fn deploy(retention: u64) -> Deployment {
    deploy_with(retention, Duration::ZERO)
}

/// Wire the store, pipeline, ingestion worker, and app state the way the
/// binary does, with a channel source and a stub snapshot service that
/// takes `snapshot_delay` to answer.
fn deploy_with(retention: u64, snapshot_delay: Duration) -> Deployment {
    let dir = tempfile::TempDir::new().unwrap();
    let (writer, reader) =
        EventLog::open(&dir.path().join("events.db"), RetentionPolicy::new(retention)).unwrap();
    let bus = Arc::new(PublishBus::new(8192));
    let pipeline = IngestPipeline::new(writer, Arc::clone(&bus), 100).unwrap();

    let (feed, source) = ChannelSource::new(256);
    let (stop_ingest, stopped) = watch::channel(false);
    spawn_ingestion(pipeline, source, stopped);

    let head = Arc::new(AtomicU64::new(0));
    let state = Arc::new(AppState::new(
        reader.clone(),
        bus,
        Arc::new(StaticTokenAuthenticator::single("smoke", "smoke-token")),
        Arc::new(StubSnapshotProvider::new(Arc::clone(&head)).with_delay(snapshot_delay)),
        ReplayPolicy::new(retention),
        Duration::from_secs(60),
        ConnectionSettings {
            queue_capacity: 8192,
            ..ConnectionSettings::default()
        },
    ));

    Deployment {
        _dir: dir,
        state,
        reader,
        feed,
        head,
        _stop_ingest: stop_ingest,
    }
}

impl Deployment {
    async fn ingest(&self, blocks: std::ops::RangeInclusive<u64>) {
        let last = *blocks.end();
        for block in blocks {
            self.feed.send(source_event(block)).await.unwrap();
        }
        let reader = self.reader.clone();
        tokio::time::timeout(INGEST_WAIT, async move {
            while reader.latest_sequence_id().unwrap() < last {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("ingestion should catch up");
        self.head.store(last, Ordering::SeqCst);
    }

    async fn serve(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(Arc::clone(&self.state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

async fn next_json(ws: &mut Ws) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => {
                let json: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                if json["type"] == "heartbeat-probe" {
                    continue;
                }
                return json;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn connect(addr: SocketAddr, credential: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let mut ws = ws;
    send_json(
        &mut ws,
        serde_json::json!({ "type": "authenticate", "credential": credential }),
    )
    .await;
    ws
}

/// Collect sequence ids from replay batches and live events through `until`.
async fn collect_until(ws: &mut Ws, until: u64) -> Vec<u64> {
    let mut seen: Vec<u64> = Vec::new();
    while seen.last().copied().unwrap_or(0) < until {
        let msg = next_json(ws).await;
        match msg["type"].as_str().unwrap() {
            "replay-batch" => {
                let events = msg["events"].as_array().unwrap();
                assert_eq!(events[0]["sequenceId"], msg["fromSeq"]);
                assert_eq!(events[events.len() - 1]["sequenceId"], msg["toSeq"]);
                seen.extend(events.iter().map(|e| e["sequenceId"].as_u64().unwrap()));
            }
            "live-event" => {
                assert_eq!(msg["event"]["sequenceId"], msg["seq"]);
                seen.push(msg["seq"].as_u64().unwrap());
            }
            other => panic!("unexpected message {other}: {msg}"),
        }
    }
    seen
}

#[tokio::test]
async fn smoke_test_snapshot_and_incremental_resume() {
    // 1. Ingest ids 1..2000 with R = 1000
    let deployment = deploy(1000);
    deployment.ingest(1..=2000).await;
    assert_eq!(deployment.reader.latest_sequence_id().unwrap(), 2000);
    assert_eq!(deployment.reader.min_retained_sequence_id().unwrap(), 1001);

    let addr = deployment.serve().await;

    // 2. Client A (lastSeen = 500) is below retention and gets a snapshot
    let mut a = connect(addr, "smoke-token").await;
    let auth = next_json(&mut a).await;
    assert_eq!(auth["type"], "auth-result");
    assert_eq!(auth["ok"], true);
    assert_eq!(auth["identity"], "smoke");

    send_json(&mut a, serde_json::json!({ "type": "resume", "lastSequenceId": 500 })).await;
    let snapshot = next_json(&mut a).await;
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["atSeq"], 2000);

    // 3. Client B (lastSeen = 1500) replays 1501..2000 from the log
    let mut b = connect(addr, "Bearer smoke-token").await;
    assert_eq!(next_json(&mut b).await["ok"], true);
    send_json(&mut b, serde_json::json!({ "type": "resume", "lastSequenceId": 1500 })).await;
    assert_eq!(collect_until(&mut b, 2000).await, (1501..=2000).collect::<Vec<_>>());

    // 4. New commits reach both clients live, from 2001, exactly once
    deployment.ingest(2001..=2010).await;
    assert_eq!(collect_until(&mut a, 2010).await, (2001..=2010).collect::<Vec<_>>());
    assert_eq!(collect_until(&mut b, 2010).await, (2001..=2010).collect::<Vec<_>>());

    // 5. Status reflects both subscribed connections
    let resp = create_router(Arc::clone(&deployment.state))
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["head"], 2010);
    assert_eq!(status["connections"].as_array().unwrap().len(), 2);
    for conn in status["connections"].as_array().unwrap() {
        assert_eq!(conn["state"], "SUBSCRIBED");
        assert_eq!(conn["identity"], "smoke");
    }

    // 6. Shutdown closes both with SERVER_SHUTDOWN
    deployment.state.shutdown();
    for ws in [&mut a, &mut b] {
        let close = next_json(ws).await;
        assert_eq!(close["type"], "close");
        assert_eq!(close["reasonCode"], "SERVER_SHUTDOWN");
    }
}

#[tokio::test]
async fn smoke_test_rejects_bad_credentials() {
    let deployment = deploy(1000);
    let addr = deployment.serve().await;

    let mut ws = connect(addr, "not-the-token").await;
    let auth = next_json(&mut ws).await;
    assert_eq!(auth["type"], "auth-result");
    assert_eq!(auth["ok"], false);
    assert_eq!(auth["error"], "invalid_credential");

    let close = next_json(&mut ws).await;
    assert_eq!(close["reasonCode"], "AUTH_FAILED");

    let frame = tokio::time::timeout(WAIT, ws.next()).await.unwrap();
    match frame {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 4003),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn smoke_test_binary_frame_is_protocol_error() {
    let deployment = deploy(1000);
    let addr = deployment.serve().await;

    let mut ws = connect(addr, "smoke-token").await;
    assert_eq!(next_json(&mut ws).await["ok"], true);

    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    let close = next_json(&mut ws).await;
    assert_eq!(close["type"], "close");
    assert_eq!(close["reasonCode"], "PROTOCOL_ERROR");
}

#[tokio::test]
async fn smoke_test_client_leaving_mid_snapshot_is_released_promptly() {
    // 1. A snapshot service that never answers in time
    let deployment = deploy_with(10, Duration::from_secs(30));
    deployment.ingest(1..=30).await;
    let addr = deployment.serve().await;

    // 2. Resume far behind the head, which needs a snapshot
    let mut ws = connect(addr, "smoke-token").await;
    assert_eq!(next_json(&mut ws).await["ok"], true);
    send_json(&mut ws, serde_json::json!({ "type": "resume", "lastSequenceId": 1 })).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(deployment.state.registry.count(), 1);

    // 3. Leave while the snapshot is still being fetched
    ws.close(None).await.unwrap();
    drop(ws);

    let registry = deployment.state.registry.clone();
    tokio::time::timeout(Duration::from_secs(1), async move {
        while registry.count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should be released without waiting for the snapshot");
    assert_eq!(deployment.state.bus.subscriber_count(), 0);
}
