//! HTTP balance API and live stream, over real sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crash_wager::fair::clock::DEFAULT_RATE_Q32_PER_MS;
use crash_wager::fair::{CrashConfig, MultiplierClock, SeedManager};
use crash_wager::ledger::{BalanceLedger, Currency, EntryReason, UserId};
use crash_wager::network::http::BalanceResponse;
use crash_wager::network::{
    ApiServer, ApiState, Authenticator, BalanceStreamClient, ClientEvent, LiveUpdatePublisher, PublisherConfig,
    StreamClientConfig,
};
use crash_wager::round::{EngineConfig, RoundEngine};
use crash_wager::AMOUNT_ONE;

struct Harness {
    addr: String,
    ledger: Arc<BalanceLedger>,
    shutdown: broadcast::Sender<()>,
}

async fn start(heartbeat: Duration) -> Harness {
    start_with(heartbeat, None).await
}

/// Rounds that commit, run and crash within a few hundred milliseconds.
fn fast_rounds() -> EngineConfig {
    EngineConfig {
        betting_window: Duration::from_millis(100),
        intermission: Duration::from_millis(20),
        tick_interval: Duration::from_millis(10),
        crash: CrashConfig { house_edge_bps: 0, max_multiplier: 300 },
        clock: MultiplierClock { rate_q32_per_ms: DEFAULT_RATE_Q32_PER_MS * 1_000 },
        ..Default::default()
    }
}

async fn start_with(heartbeat: Duration, engine_config: Option<EngineConfig>) -> Harness {
    let ledger = Arc::new(BalanceLedger::new());
    let seeds = Arc::new(SeedManager::with_os_entropy("integration"));
    let running = engine_config.is_some();
    let (engine, rounds) = RoundEngine::new(engine_config.unwrap_or_default(), seeds.clone(), ledger.clone());
    let publisher = Arc::new(LiveUpdatePublisher::new(
        PublisherConfig { heartbeat_interval: heartbeat, ..Default::default() },
        ledger.clone(),
    ));
    let (shutdown, _) = broadcast::channel(1);

    tokio::spawn(publisher.clone().run(ledger.subscribe(), rounds.subscribe(), shutdown.subscribe()));
    if running {
        tokio::spawn(engine.run(shutdown.subscribe()));
    }

    let state = Arc::new(ApiState {
        ledger: ledger.clone(),
        publisher,
        rounds,
        seeds,
        auth: Arc::new(Authenticator::disabled()),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = ApiServer::new(state, shutdown.clone());
    tokio::spawn(async move { server.run(listener).await });

    Harness { addr, ledger, shutdown }
}

async fn open(addr: &str, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, addr);
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

/// Read until `done` holds for everything received so far.
async fn read_until(stream: &mut TcpStream, seen: &mut String, done: impl Fn(&str) -> bool) {
    let mut chunk = [0u8; 4096];
    timeout(Duration::from_secs(5), async {
        while !done(seen) {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed; got {:?}", seen);
            seen.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out; got {:?}", seen));
}

async fn next(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn polling_endpoint_reports_balance() {
    let h = start(Duration::from_secs(15)).await;
    let user = UserId::new("poller");
    h.ledger.deposit(&user, 2 * AMOUNT_ONE, Currency::Stars, "p1").await.unwrap();

    let mut stream = open(&h.addr, "/api/balance?userId=poller").await;
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let body: BalanceResponse = serde_json::from_str(body).unwrap();
    assert!(body.ok);
    assert_eq!(body.ton, 0.0);
    assert_eq!(body.stars, 2.0);

    let _ = h.shutdown.send(());
}

#[tokio::test]
async fn stream_pushes_each_mutation_and_heartbeats() {
    let h = start(Duration::from_millis(100)).await;
    let user = UserId::new("streamer");
    h.ledger.deposit(&user, AMOUNT_ONE, Currency::Ton, "s1").await.unwrap();

    let mut stream = open(&h.addr, "/api/balance/stream?userId=streamer").await;
    let mut seen = String::new();
    read_until(&mut stream, &mut seen, |s| s.contains("\"version\":1")).await;
    assert!(seen.starts_with("HTTP/1.1 200 OK"));
    assert!(seen.contains("text/event-stream"));
    assert!(seen.contains("data: {\"type\":\"balance\""));

    h.ledger.debit(&user, AMOUNT_ONE / 10, Currency::Ton, EntryReason::Stake, None).await.unwrap();
    read_until(&mut stream, &mut seen, |s| s.contains("\"version\":2")).await;
    assert!(seen.contains("\"ton\":0.9"));

    // Idle long enough for a keep-alive
    read_until(&mut stream, &mut seen, |s| s.contains(": heartbeat\n\n")).await;

    // Other users' changes never show up
    let other = UserId::new("someone-else");
    h.ledger.deposit(&other, 5 * AMOUNT_ONE, Currency::Ton, "o1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!seen.contains("\"ton\":5.0"));

    let _ = h.shutdown.send(());
}

#[tokio::test]
async fn stream_client_follows_balance() {
    let h = start(Duration::from_secs(15)).await;
    let user = UserId::new("follower");
    h.ledger.deposit(&user, AMOUNT_ONE, Currency::Ton, "f1").await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let client = BalanceStreamClient::new(StreamClientConfig::new(h.addr.clone(), "follower"), tx);
    let (client_stop, client_stop_rx) = broadcast::channel(1);
    let task = tokio::spawn(client.run(client_stop_rx));

    assert_eq!(next(&mut rx).await, ClientEvent::Connected);
    match next(&mut rx).await {
        ClientEvent::Balance(snapshot) => assert_eq!((snapshot.ton, snapshot.version), (1.0, 1)),
        other => panic!("unexpected {:?}", other),
    }

    h.ledger.deposit(&user, AMOUNT_ONE / 2, Currency::Ton, "f2").await.unwrap();
    match next(&mut rx).await {
        ClientEvent::Balance(snapshot) => assert_eq!((snapshot.ton, snapshot.version), (1.5, 2)),
        other => panic!("unexpected {:?}", other),
    }

    client_stop.send(()).unwrap();
    task.await.unwrap();
    let _ = h.shutdown.send(());
}

#[tokio::test]
async fn stream_carries_only_balance_events_while_rounds_run() {
    let h = start_with(Duration::from_secs(15), Some(fast_rounds())).await;
    let user = UserId::new("spectator");
    h.ledger.deposit(&user, AMOUNT_ONE, Currency::Ton, "sp1").await.unwrap();

    let mut stream = open(&h.addr, "/api/balance/stream?userId=spectator").await;
    let mut seen = String::new();
    // The initial snapshot plus at least four round transitions
    read_until(&mut stream, &mut seen, |s| {
        s.matches("data: ").count() >= 5 && s.ends_with("\n\n")
    }).await;

    let body = seen.split("\r\n\r\n").nth(1).unwrap();
    for frame in body.split("\n\n").filter(|f| f.starts_with("data: ")) {
        let event: serde_json::Value = serde_json::from_str(&frame["data: ".len()..]).unwrap();
        assert_eq!(event["type"], "balance", "frame {:?}", frame);
        assert_eq!(event["ton"], 1.0);
        assert!(event["timestamp"].is_i64());
    }

    let _ = h.shutdown.send(());
}

#[tokio::test]
async fn unknown_route_is_404() {
    let h = start(Duration::from_secs(15)).await;
    let mut stream = open(&h.addr, "/api/nothing").await;
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("\"ok\":false"));
    let _ = h.shutdown.send(());
}
