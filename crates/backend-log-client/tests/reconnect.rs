use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backend_log_client::{
    BackendLogClient, ClientConfig, ClientError, ClientResult, ClientState, Connection, Connector,
    Scheduler,
};
use bugtrail_core_types::BackendLevel;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

struct FakeConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&mut self, text: String) -> ClientResult<()> {
        self.outbound
            .send(text)
            .map_err(|_| ClientError::Socket("hub gone".into()))
    }

    async fn recv(&mut self) -> Option<ClientResult<String>> {
        self.inbound.recv().await.map(Ok)
    }
}

/// Hub side of one scripted connection.
struct HubEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl HubEnd {
    fn send(&self, frame: Value) {
        self.to_client.send(frame.to_string()).unwrap();
    }

    async fn next(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("frame in time")
            .expect("connection open");
        serde_json::from_str(&text).unwrap()
    }
}

#[derive(Default)]
struct FakeConnector {
    /// `None` entries refuse the attempt; an empty script refuses everything.
    scripted: Mutex<VecDeque<Option<FakeConnection>>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    fn accept(&self) -> HubEnd {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.scripted
            .lock()
            .push_back(Some(FakeConnection { inbound, outbound }));
        HubEnd {
            to_client,
            from_client,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> ClientResult<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.scripted.lock().pop_front().flatten() {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(ClientError::Connect {
                url: url.to_string(),
                reason: "connection refused".into(),
            }),
        }
    }
}

#[derive(Default)]
struct FakeScheduler {
    delays: Mutex<Vec<Duration>>,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().push(delay);
        match &self.gate {
            Some(gate) => gate.notified().await,
            None => tokio::task::yield_now().await,
        }
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn config() -> ClientConfig {
    ClientConfig {
        server_port: 4000,
        base_backoff_ms: 100,
        max_backoff_ms: 300,
        max_attempts: 4,
        buffer_capacity: 2,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn registers_then_forwards_only_while_recording() {
    let connector = Arc::new(FakeConnector::default());
    let mut hub = connector.accept();
    let client = BackendLogClient::with_parts(
        config(),
        connector.clone(),
        Arc::new(FakeScheduler::default()),
    );
    let task = client.spawn();

    let register = hub.next().await;
    assert_eq!(register["type"], "register");
    assert_eq!(register["serverPort"], 4000);
    eventually("connected", || {
        client.state() == ClientState::Connected { recording: false }
    })
    .await;

    assert!(!client.record(BackendLevel::Log, "before recording", None));

    hub.send(serde_json::json!({ "type": "start_recording", "captureStdout": true }));
    eventually("recording", || client.is_recording()).await;
    assert!(client.captures_stdout());

    assert!(client.record(BackendLevel::Error, "db timeout", Some("at query".into())));
    let log = hub.next().await;
    assert_eq!(log["type"], "log");
    assert_eq!(log["level"], "error");
    assert_eq!(log["message"], "db timeout");
    assert_eq!(log["stack"], "at query");

    hub.send(serde_json::json!({ "type": "ping" }));
    assert_eq!(hub.next().await["type"], "pong");

    hub.send(serde_json::json!({ "type": "stop_recording" }));
    eventually("idle", || !client.is_recording()).await;
    assert!(!client.record(BackendLevel::Log, "after", None));

    client.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn buffers_while_disconnected_and_flushes_after_reregistering() {
    let connector = Arc::new(FakeConnector::default());
    let mut first = connector.accept();
    let gate = Arc::new(Notify::new());
    let scheduler = Arc::new(FakeScheduler {
        gate: Some(gate.clone()),
        ..FakeScheduler::default()
    });
    let client = BackendLogClient::with_parts(config(), connector.clone(), scheduler.clone());
    let task = client.spawn();

    assert_eq!(first.next().await["type"], "register");
    first.send(serde_json::json!({ "type": "start_recording" }));
    eventually("recording", || client.is_recording()).await;

    // Hub goes away: the client falls back to buffering.
    drop(first);
    eventually("backoff", || !scheduler.delays.lock().is_empty()).await;
    assert_eq!(client.state(), ClientState::Disconnected);

    for line in ["one", "two", "three"] {
        assert!(client.record(BackendLevel::Log, line, None));
    }
    assert_eq!(client.buffered(), 2);

    let mut second = connector.accept();
    gate.notify_one();

    assert_eq!(second.next().await["type"], "register");
    assert_eq!(second.next().await["message"], "two");
    assert_eq!(second.next().await["message"], "three");
    assert_eq!(client.buffered(), 0);
    assert_eq!(scheduler.delays.lock().as_slice(), &[Duration::from_millis(100)]);

    client.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn gives_up_after_bounded_attempts() {
    let connector = Arc::new(FakeConnector::default());
    let scheduler = Arc::new(FakeScheduler::default());
    let client = BackendLogClient::with_parts(config(), connector.clone(), scheduler.clone());

    client.run().await;

    assert_eq!(client.state(), ClientState::Disabled);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 5);
    let delays: Vec<u64> = scheduler
        .delays
        .lock()
        .iter()
        .map(|d| d.as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![100, 200, 300, 300]);
}

#[tokio::test]
async fn successful_open_resets_the_attempt_counter() {
    let connector = Arc::new(FakeConnector::default());
    let scheduler = Arc::new(FakeScheduler::default());
    let client = BackendLogClient::with_parts(config(), connector.clone(), scheduler.clone());

    // One refused attempt, one good connection that closes, then refusals until disabled.
    connector.scripted.lock().push_back(None);
    let hub = connector.accept();
    drop(hub);
    client.run().await;

    let delays: Vec<u64> = scheduler
        .delays
        .lock()
        .iter()
        .map(|d| d.as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![100, 100, 200, 300, 300]);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 6);
    assert_eq!(client.state(), ClientState::Disabled);
}
