//! Relays messages received from brokers to the downstream sink.

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::db::DatabaseService;

const LANE_CAPACITY: usize = 1024;
const SINK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub broker_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Body POSTed to the sink.
#[derive(Debug, Serialize)]
pub struct ForwardEnvelope {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered,
    /// No topic record matches; the message was dropped.
    UnknownTopic,
    /// The sink answered with a non-success status.
    Rejected(u16),
    Failed,
}

/// Parses the payload as JSON, falling back to `{"data": <text>}`.
pub fn decode_payload(bytes: &[u8]) -> Value {
    let text = String::from_utf8_lossy(bytes);
    serde_json::from_str(&text).unwrap_or_else(|_| json!({ "data": text }))
}

pub struct MessageForwarder {
    http: Client,
    endpoint: String,
    db: Arc<DatabaseService>,
}

impl MessageForwarder {
    pub fn new(base_url: &str, db: Arc<DatabaseService>) -> Result<Arc<Self>, reqwest::Error> {
        let http = Client::builder().timeout(SINK_TIMEOUT).build()?;
        let endpoint = format!("{}/messages", base_url.trim_end_matches('/'));
        info!("Forwarding inbound messages to {}", endpoint);
        Ok(Arc::new(Self { http, endpoint, db }))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Starts an ordered forwarding lane for one broker. The lane ends when the
    /// returned sender is dropped.
    pub fn open_lane(self: &Arc<Self>, broker_id: &str) -> mpsc::Sender<InboundMessage> {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(LANE_CAPACITY);
        let forwarder = Arc::clone(self);
        let broker_id = broker_id.to_string();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                forwarder.forward(message).await;
            }
            debug!("Forwarding lane for broker {} closed.", broker_id);
        });

        tx
    }

    pub async fn forward(&self, message: InboundMessage) -> ForwardOutcome {
        let lookup = {
            let topic = message.topic.clone();
            let broker_id = message.broker_id.clone();
            self.db
                .run(move |db| db.find_topic_for_broker(&topic, &broker_id))
                .await
        };

        match lookup {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(
                    "Topic '{}' not registered for broker {}; dropping message.",
                    message.topic, message.broker_id
                );
                return ForwardOutcome::UnknownTopic;
            }
            Err(e) => {
                error!("Failed to look up topic '{}': {}", message.topic, e);
                return ForwardOutcome::Failed;
            }
        }

        let envelope = ForwardEnvelope {
            payload: decode_payload(&message.payload),
            topic: message.topic,
        };

        match self.http.post(&self.endpoint).json(&envelope).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Message on '{}' forwarded.", envelope.topic);
                ForwardOutcome::Delivered
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(
                    "Sink rejected message on '{}': {} {}",
                    envelope.topic, status, body
                );
                ForwardOutcome::Rejected(status.as_u16())
            }
            Err(e) => {
                error!("Failed to forward message on '{}': {}", envelope.topic, e);
                ForwardOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payload_is_parsed() {
        let value = decode_payload(br#"{"temperature": 21.5, "unit": "C"}"#);
        assert_eq!(value, json!({ "temperature": 21.5, "unit": "C" }));
    }

    #[test]
    fn plain_text_is_wrapped() {
        assert_eq!(decode_payload(b"ON"), json!({ "data": "ON" }));
    }

    #[test]
    fn invalid_utf8_is_decoded_lossily() {
        let value = decode_payload(&[0x68, 0x69, 0xff]);
        assert_eq!(value, json!({ "data": "hi\u{fffd}" }));
    }

    #[test]
    fn envelope_serializes_topic_and_payload() {
        let envelope = ForwardEnvelope {
            topic: "plant/1".to_string(),
            payload: json!({ "moisture": 40 }),
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({ "topic": "plant/1", "payload": { "moisture": 40 } })
        );
    }
}
