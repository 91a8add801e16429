//! Shard lifecycle tests against a scripted mock gateway.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_gateway::{GatewayEngine, Intents, ShardState};
use ember_http::RestClient;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A frame the mock gateway received from a client.
#[derive(Debug, Clone)]
struct ClientFrame {
    /// Connection index, in accept order.
    connection: usize,
    frame: Value,
    at: Instant,
}

struct MockGateway {
    url: String,
    frames: Arc<Mutex<Vec<ClientFrame>>>,
    connections: Arc<AtomicUsize>,
}

impl MockGateway {
    fn recorded(&self, op: u64) -> Vec<ClientFrame> {
        self.frames
            .lock()
            .iter()
            .filter(|f| f.frame["op"].as_u64() == Some(op))
            .cloned()
            .collect()
    }
}

/// Accepts websocket connections, sends HELLO, answers IDENTIFY with READY
/// and RESUME with RESUMED, and optionally acknowledges heartbeats. Every
/// client frame is recorded with its arrival instant.
async fn spawn_gateway(heartbeat_interval_ms: u64, ack_heartbeats: bool) -> MockGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let frames: Arc<Mutex<Vec<ClientFrame>>> = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));

    let accept_frames = Arc::clone(&frames);
    let accept_connections = Arc::clone(&connections);
    tokio::spawn(async move {
        let mut next_connection = 0usize;
        while let Ok((stream, _)) = listener.accept().await {
            let connection = next_connection;
            next_connection += 1;
            accept_connections.fetch_add(1, Ordering::SeqCst);

            let frames = Arc::clone(&accept_frames);
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut stream) = ws.split();

                let hello = json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval_ms}});
                if sink.send(Message::Text(hello.to_string().into())).await.is_err() {
                    return;
                }

                while let Some(Ok(message)) = stream.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    frames.lock().push(ClientFrame {
                        connection,
                        frame: frame.clone(),
                        at: Instant::now(),
                    });

                    let reply = match frame["op"].as_u64() {
                        Some(2) => Some(json!({
                            "op": 0,
                            "t": "READY",
                            "s": 1,
                            "d": { "session_id": format!("sess-{connection}") }
                        })),
                        Some(6) => Some(json!({"op": 0, "t": "RESUMED", "s": 2, "d": {}})),
                        Some(1) if ack_heartbeats => Some(json!({"op": 11})),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    MockGateway {
        url: format!("ws://{addr}"),
        frames,
        connections,
    }
}

/// Serve `/gateway/bot` and `/gateway` pointing at the mock gateway.
async fn spawn_api(gateway_url: &str, shards: u16, max_concurrency: u32) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/gateway/bot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": gateway_url,
            "shards": shards,
            "session_start_limit": {
                "total": 1000,
                "remaining": 1000,
                "reset_after": 0,
                "max_concurrency": max_concurrency
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gateway"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"url": gateway_url})))
        .mount(&server)
        .await;

    server
}

async fn wait_for(what: &str, deadline: Duration, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        assert!(started.elapsed() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_identify_handshake_reaches_operational() {
    let gateway = spawn_gateway(45_000, true).await;
    let api = spawn_api(&gateway.url, 1, 1).await;

    let rest = Arc::new(
        RestClient::new("test-token")
            .expect("client")
            .with_api_base(api.uri()),
    );
    let engine = Arc::new(GatewayEngine::new(rest, Intents::GUILDS | Intents::GUILD_MESSAGES));

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.start().await })
    };

    wait_for("shard to become operational", Duration::from_secs(5), || {
        engine
            .shards()
            .first()
            .is_some_and(|shard| shard.state() == ShardState::Operational)
    })
    .await;

    let shard = engine.shards().remove(0);
    assert_eq!(shard.id(), 0);
    assert_eq!(shard.session_id().as_deref(), Some("sess-0"));
    assert_eq!(shard.sequence(), Some(1));

    let identifies = gateway.recorded(2);
    assert_eq!(identifies.len(), 1);
    let identify = &identifies[0].frame["d"];
    assert_eq!(identify["token"], "test-token");
    assert_eq!(identify["shard"], json!([0, 1]));
    assert_eq!(identify["intents"], json!((Intents::GUILDS | Intents::GUILD_MESSAGES).bits()));
    assert!(identify["properties"]["$os"].is_string());

    // The pacemaker's first heartbeat is acknowledged, so latency appears.
    wait_for("latency measurement", Duration::from_secs(3), || {
        shard.latency().is_some()
    })
    .await;

    engine.shutdown();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("engine stops after shutdown")
        .expect("join")
        .expect("clean shutdown");
}

#[tokio::test]
async fn test_missed_ack_reconnects_with_resume() {
    // HELLO advertises a 400 ms interval and the server never acknowledges:
    // the second pacemaker tick must close the connection.
    let gateway = spawn_gateway(400, false).await;
    let api = spawn_api(&gateway.url, 1, 1).await;

    let rest = Arc::new(
        RestClient::new("test-token")
            .expect("client")
            .with_api_base(api.uri()),
    );
    let engine = Arc::new(GatewayEngine::new(rest, Intents::GUILDS));

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.start().await })
    };

    wait_for("a reconnect", Duration::from_secs(5), || {
        gateway.connections.load(Ordering::SeqCst) >= 2
    })
    .await;
    wait_for("a resume frame", Duration::from_secs(5), || {
        !gateway.recorded(6).is_empty()
    })
    .await;

    let resumes = gateway.recorded(6);
    let resume = &resumes[0];
    assert!(resume.connection >= 1, "resume belongs to a later connection");
    // The session and sequence from the first connection survived the close.
    assert_eq!(resume.frame["d"]["session_id"], "sess-0");
    assert_eq!(resume.frame["d"]["seq"], 1);

    engine.shutdown();
    run.abort();
}

#[tokio::test]
async fn test_identify_concurrency_respects_window() {
    let gateway = spawn_gateway(45_000, true).await;
    let api = spawn_api(&gateway.url, 5, 2).await;

    let rest = Arc::new(
        RestClient::new("test-token")
            .expect("client")
            .with_api_base(api.uri()),
    );
    let engine = Arc::new(GatewayEngine::new(rest, Intents::GUILDS));

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.start().await })
    };

    wait_for("all five identifies", Duration::from_secs(15), || {
        gateway.recorded(2).len() >= 5
    })
    .await;

    let mut times: Vec<Instant> = gateway.recorded(2).iter().map(|f| f.at).collect();
    times.sort();
    let first = times[0];

    // max_concurrency = 2: exactly two IDENTIFYs in the first 5 s window,
    // two more in the second, the last in the third.
    let in_first_window = times
        .iter()
        .filter(|t| t.duration_since(first) < Duration::from_millis(4500))
        .count();
    assert_eq!(in_first_window, 2);

    assert!(times[2].duration_since(first) >= Duration::from_millis(4500));
    assert!(times[3].duration_since(first) >= Duration::from_millis(4500));
    assert!(times[4].duration_since(first) >= Duration::from_millis(9500));

    engine.shutdown();
    run.abort();
}

#[tokio::test]
async fn test_shard_ids_override_materialization() {
    let gateway = spawn_gateway(45_000, true).await;
    let api = spawn_api(&gateway.url, 9, 16).await;

    let rest = Arc::new(
        RestClient::new("test-token")
            .expect("client")
            .with_api_base(api.uri()),
    );
    let engine = Arc::new(
        GatewayEngine::new(rest, Intents::GUILDS)
            .with_shard_ids(vec![1, 3])
            .with_shard_count(4),
    );

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.start().await })
    };

    wait_for("both shards operational", Duration::from_secs(5), || {
        let shards = engine.shards();
        shards.len() == 2 && shards.iter().all(|s| s.state() == ShardState::Operational)
    })
    .await;

    let mut pairs: Vec<Value> = gateway
        .recorded(2)
        .iter()
        .map(|f| f.frame["d"]["shard"].clone())
        .collect();
    pairs.sort_by_key(|v| v[0].as_u64());
    assert_eq!(pairs, vec![json!([1, 4]), json!([3, 4])]);

    engine.shutdown();
    run.abort();
}
