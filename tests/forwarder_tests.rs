mod helpers;

use axum::http::StatusCode;
use helpers::*;
use iot_monitor::forwarder::{ForwardOutcome, InboundMessage, MessageForwarder};
use iot_monitor::models::{Broker, NewBroker, NewTopic};
use iot_monitor::db::DatabaseService;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn seed(db: &DatabaseService, topic: &str) -> Broker {
    let broker = db
        .create_broker(&NewBroker {
            host: "broker.local".to_string(),
            port: 1883,
            ..Default::default()
        })
        .unwrap();
    db.create_topic(&NewTopic {
        topic: topic.to_string(),
        broker_id: broker.id.clone(),
        is_active: true,
    })
    .unwrap();
    broker
}

fn message(broker_id: &str, topic: &str, payload: &[u8]) -> InboundMessage {
    InboundMessage {
        broker_id: broker_id.to_string(),
        topic: topic.to_string(),
        payload: payload.to_vec(),
    }
}

#[tokio::test]
async fn json_payload_reaches_the_sink_parsed() {
    let (db, _dir) = setup_store();
    let broker = seed(&db, "plant/1");
    let sink = start_sink(StatusCode::OK).await;
    let forwarder = MessageForwarder::new(&sink.base_url, Arc::clone(&db)).unwrap();

    let outcome = forwarder
        .forward(message(&broker.id, "plant/1", br#"{"moisture": 40}"#))
        .await;

    assert_eq!(outcome, ForwardOutcome::Delivered);
    assert_eq!(
        sink.received(),
        vec![json!({ "topic": "plant/1", "payload": { "moisture": 40 } })]
    );
}

#[tokio::test]
async fn plain_text_payload_is_wrapped_in_data() {
    let (db, _dir) = setup_store();
    let broker = seed(&db, "plant/1");
    let sink = start_sink(StatusCode::OK).await;
    let forwarder = MessageForwarder::new(&sink.base_url, Arc::clone(&db)).unwrap();

    forwarder.forward(message(&broker.id, "plant/1", b"ON")).await;

    assert_eq!(
        sink.received(),
        vec![json!({ "topic": "plant/1", "payload": { "data": "ON" } })]
    );
}

#[tokio::test]
async fn unknown_topic_never_reaches_the_sink() {
    let (db, _dir) = setup_store();
    let broker = seed(&db, "plant/1");
    let sink = start_sink(StatusCode::OK).await;
    let forwarder = MessageForwarder::new(&sink.base_url, Arc::clone(&db)).unwrap();

    let outcome = forwarder.forward(message(&broker.id, "plant/unknown", b"{}")).await;

    assert_eq!(outcome, ForwardOutcome::UnknownTopic);
    assert!(sink.received().is_empty());
}

#[tokio::test]
async fn topic_of_another_broker_is_dropped() {
    let (db, _dir) = setup_store();
    seed(&db, "plant/1");
    let other = db
        .create_broker(&NewBroker {
            host: "other.local".to_string(),
            port: 1883,
            ..Default::default()
        })
        .unwrap();
    let sink = start_sink(StatusCode::OK).await;
    let forwarder = MessageForwarder::new(&sink.base_url, Arc::clone(&db)).unwrap();

    let outcome = forwarder.forward(message(&other.id, "plant/1", b"{}")).await;

    assert_eq!(outcome, ForwardOutcome::UnknownTopic);
    assert!(sink.received().is_empty());
}

#[tokio::test]
async fn sink_errors_are_reported_not_raised() {
    let (db, _dir) = setup_store();
    let broker = seed(&db, "plant/1");
    let sink = start_sink(StatusCode::INTERNAL_SERVER_ERROR).await;
    let forwarder = MessageForwarder::new(&sink.base_url, Arc::clone(&db)).unwrap();

    let outcome = forwarder.forward(message(&broker.id, "plant/1", b"1")).await;
    assert_eq!(outcome, ForwardOutcome::Rejected(500));

    let unreachable = MessageForwarder::new("http://127.0.0.1:9", Arc::clone(&db)).unwrap();
    let outcome = unreachable.forward(message(&broker.id, "plant/1", b"1")).await;
    assert_eq!(outcome, ForwardOutcome::Failed);
}

#[tokio::test]
async fn lane_preserves_wire_order() {
    let (db, _dir) = setup_store();
    let broker = seed(&db, "plant/1");
    let sink = start_sink(StatusCode::OK).await;
    let forwarder = MessageForwarder::new(&sink.base_url, Arc::clone(&db)).unwrap();

    let lane = forwarder.open_lane(&broker.id);
    for i in 0..20 {
        lane.send(message(&broker.id, "plant/1", i.to_string().as_bytes()))
            .await
            .unwrap();
    }

    assert!(eventually(Duration::from_secs(5), || async { sink.received().len() == 20 }).await);
    let payloads: Vec<i64> = sink
        .received()
        .iter()
        .map(|body| body["payload"].as_i64().unwrap())
        .collect();
    assert_eq!(payloads, (0..20).collect::<Vec<i64>>());
}

#[test]
fn sink_endpoint_is_messages_under_base_url() {
    let (db, _dir) = setup_store();
    let forwarder = MessageForwarder::new("http://localhost:3000/", db).unwrap();
    assert_eq!(forwarder.endpoint(), "http://localhost:3000/messages");
}
