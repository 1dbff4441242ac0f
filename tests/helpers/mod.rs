#![allow(dead_code)]

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use iot_monitor::db::DatabaseService;
use iot_monitor::forwarder::MessageForwarder;
use iot_monitor::link::{
    Connector, LinkCommand, LinkError, LinkEvent, LinkEvents, LinkHandle, LinkOptions,
    RefusalReason,
};
use iot_monitor::registry::BrokerRegistry;
use iot_monitor::supervisor::SupervisorSettings;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Outcome a scripted link reports after being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    RejectAuth,
    Unreachable,
    /// Never answers.
    Hang,
}

/// Wire traffic seen by the scripted links, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: String, retain: bool },
    Close,
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<Outcome>,
    fallback: Option<Outcome>,
    ack: bool,
    opened: Vec<LinkOptions>,
    sent: Vec<Sent>,
    links: Vec<LinkEvents>,
    live: usize,
    max_live: usize,
}

/// In-process stand-in for MQTT brokers.
#[derive(Clone)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    /// Every open reports `outcome`; subscriptions are acknowledged.
    pub fn always(outcome: Outcome) -> Self {
        Self::scripted(Vec::new(), outcome)
    }

    /// Opens report `outcomes` in order, then `then` forever.
    pub fn scripted(outcomes: Vec<Outcome>, then: Outcome) -> Self {
        let script = Script {
            outcomes: outcomes.into(),
            fallback: Some(then),
            ack: true,
            ..Default::default()
        };
        Self { script: Arc::new(Mutex::new(script)) }
    }

    pub fn set_ack(&self, ack: bool) {
        self.script.lock().unwrap().ack = ack;
    }

    pub fn opened(&self) -> Vec<LinkOptions> {
        self.script.lock().unwrap().opened.clone()
    }

    pub fn open_count(&self) -> usize {
        self.script.lock().unwrap().opened.len()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.script.lock().unwrap().sent.clone()
    }

    pub fn subscribes_for(&self, topic: &str) -> usize {
        self.sent()
            .iter()
            .filter(|sent| matches!(sent, Sent::Subscribe(t) if t == topic))
            .count()
    }

    pub fn unsubscribes_for(&self, topic: &str) -> usize {
        self.sent()
            .iter()
            .filter(|sent| matches!(sent, Sent::Unsubscribe(t) if t == topic))
            .count()
    }

    pub fn live_links(&self) -> usize {
        self.script.lock().unwrap().live
    }

    pub fn max_live_links(&self) -> usize {
        self.script.lock().unwrap().max_live
    }

    /// Delivers a message on the most recently opened link.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let script = self.script.lock().unwrap();
        let events = script.links.last().expect("no link opened yet");
        events.emit(LinkEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Drops the most recently opened link as if the broker went away.
    pub fn drop_connection(&self) {
        let script = self.script.lock().unwrap();
        let events = script.links.last().expect("no link opened yet");
        events.emit(LinkEvent::Closed("connection reset by peer".to_string()));
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, options: LinkOptions, events: LinkEvents) -> LinkHandle {
        let (tx, rx) = mpsc::channel(64);
        let outcome = {
            let mut script = self.script.lock().unwrap();
            let outcome = script
                .outcomes
                .pop_front()
                .or(script.fallback)
                .unwrap_or(Outcome::Hang);
            script.opened.push(options);
            script.links.push(events.clone());
            script.live += 1;
            script.max_live = script.max_live.max(script.live);
            outcome
        };
        tokio::spawn(run_link(Arc::clone(&self.script), outcome, events, rx));
        LinkHandle::new(tx)
    }
}

async fn run_link(
    script: Arc<Mutex<Script>>,
    outcome: Outcome,
    events: LinkEvents,
    mut commands: mpsc::Receiver<LinkCommand>,
) {
    let keep_running = match outcome {
        Outcome::Accept => events.emit(LinkEvent::Connected),
        Outcome::RejectAuth => {
            events.emit(LinkEvent::Failed(LinkError::Refused(RefusalReason::NotAuthorized)));
            false
        }
        Outcome::Unreachable => {
            events.emit(LinkEvent::Failed(LinkError::Transport("connection refused".to_string())));
            false
        }
        Outcome::Hang => true,
    };

    if keep_running {
        while let Some(command) = commands.recv().await {
            let mut script = script.lock().unwrap();
            let ack = script.ack;
            match command {
                LinkCommand::Subscribe { topic, ack: reply } => {
                    script.sent.push(Sent::Subscribe(topic));
                    if ack {
                        let _ = reply.send(true);
                    }
                }
                LinkCommand::Unsubscribe { topic, ack: reply } => {
                    script.sent.push(Sent::Unsubscribe(topic));
                    if ack {
                        let _ = reply.send(true);
                    }
                }
                LinkCommand::Publish { topic, payload, retain } => {
                    script.sent.push(Sent::Publish {
                        topic,
                        payload: String::from_utf8_lossy(&payload).to_string(),
                        retain,
                    });
                }
                LinkCommand::Close => {
                    script.sent.push(Sent::Close);
                    break;
                }
            }
        }
    }

    script.lock().unwrap().live -= 1;
}

/// Tunables short enough for tests.
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        max_reconnect_attempts: 3,
        reconnect_interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(30),
        fallback_delay: Duration::from_millis(30),
        keep_alive: Duration::from_secs(60),
        connect_timeout: Duration::from_millis(200),
        ack_timeout: Duration::from_millis(200),
        store_retry_delay: Duration::from_millis(50),
    }
}

/// Production timings scaled down 100x: ten attempts, reconnect delay equal to the interval.
pub fn reference_settings() -> SupervisorSettings {
    SupervisorSettings {
        max_reconnect_attempts: 10,
        reconnect_interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(100),
        fallback_delay: Duration::from_millis(20),
        keep_alive: Duration::from_secs(60),
        connect_timeout: Duration::from_millis(100),
        ack_timeout: Duration::from_millis(100),
        store_retry_delay: Duration::from_millis(50),
    }
}

pub fn setup_store() -> (Arc<DatabaseService>, TempDir) {
    let (db, temp_dir) = setup_uninitialized_store();
    db.initialize_db().unwrap();
    (db, temp_dir)
}

/// Store whose schema does not exist yet, so every query fails until `initialize_db`.
pub fn setup_uninitialized_store() -> (Arc<DatabaseService>, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let db = DatabaseService::new(store_path(&temp_dir).to_str().unwrap()).unwrap();
    (Arc::new(db), temp_dir)
}

pub fn store_path(temp_dir: &TempDir) -> PathBuf {
    temp_dir.path().join("monitor.db")
}

/// Sink that records every POSTed body.
pub struct RecordingSink {
    pub base_url: String,
    received: Arc<Mutex<Vec<Value>>>,
}

impl RecordingSink {
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct SinkState {
    received: Arc<Mutex<Vec<Value>>>,
    status: StatusCode,
}

async fn record(State(state): State<SinkState>, Json(body): Json<Value>) -> StatusCode {
    state.received.lock().unwrap().push(body);
    state.status
}

pub async fn start_sink(status: StatusCode) -> RecordingSink {
    let received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().route("/messages", post(record)).with_state(SinkState {
        received: Arc::clone(&received),
        status,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    RecordingSink {
        base_url: format!("http://{}", addr),
        received,
    }
}

/// Registry wired to a scripted connector. The sink URL points nowhere unless given.
pub fn setup_registry(
    connector: &ScriptedConnector,
    db: &Arc<DatabaseService>,
    sink_url: Option<&str>,
) -> (Arc<BrokerRegistry>, Arc<MessageForwarder>) {
    setup_registry_with(connector, db, sink_url, fast_settings())
}

pub fn setup_registry_with(
    connector: &ScriptedConnector,
    db: &Arc<DatabaseService>,
    sink_url: Option<&str>,
    settings: SupervisorSettings,
) -> (Arc<BrokerRegistry>, Arc<MessageForwarder>) {
    let forwarder = MessageForwarder::new(sink_url.unwrap_or("http://127.0.0.1:9"), Arc::clone(db)).unwrap();
    let registry = BrokerRegistry::new(
        Arc::new(connector.clone()),
        Arc::clone(db),
        Arc::clone(&forwarder),
        settings,
    );
    (registry, forwarder)
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
