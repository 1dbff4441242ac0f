//! Broker and topic administration, plus the system status report.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::{DatabaseService, StoreError};
use crate::models::{BrokerEndpoint, NewBroker, NewTopic, Topic};
use crate::registry::BrokerRegistry;
use crate::supervisor::BrokerStatus;

#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Input of [`MonitorService::create_broker`].
#[derive(Debug, Clone, Default)]
pub struct BrokerSpec {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub database: DatabaseSummary,
    pub mqtt: MqttSummary,
    pub topics: Vec<TopicSummary>,
    pub brokers: Vec<BrokerSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSummary {
    pub brokers: u64,
    pub active_topics: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttSummary {
    /// `connected/total`
    pub connected_brokers: String,
    pub total_subscriptions: usize,
    pub connections: Vec<BrokerStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSummary {
    pub id: String,
    pub topic: String,
    pub is_active: bool,
    pub broker: BrokerRef,
}

#[derive(Debug, Serialize)]
pub struct BrokerRef {
    pub id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSummary {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub topics_count: usize,
    pub topics: Vec<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub struct MonitorService {
    db: Arc<DatabaseService>,
    registry: Arc<BrokerRegistry>,
}

impl MonitorService {
    pub fn new(db: Arc<DatabaseService>, registry: Arc<BrokerRegistry>) -> Arc<Self> {
        Arc::new(Self { db, registry })
    }

    pub fn registry(&self) -> &Arc<BrokerRegistry> {
        &self.registry
    }

    /// Persists a broker and starts monitoring it. Returns the new broker id.
    pub async fn create_broker(&self, spec: BrokerSpec) -> Result<String, ManagementError> {
        let new_broker = NewBroker {
            host: spec.host,
            port: spec.port,
            username: non_empty(spec.username),
            password: non_empty(spec.password),
            ca_cert: non_empty(spec.ca_cert),
        };

        let broker = self.db.run(move |db| db.create_broker(&new_broker)).await?;
        info!("✅ Broker {} created ({}:{})", broker.id, broker.host, broker.port);

        let id = broker.id.clone();
        self.registry.register_broker(BrokerEndpoint::from(broker)).await;
        Ok(id)
    }

    /// Stops monitoring a broker and deletes it together with its topics.
    pub async fn delete_broker(&self, broker_id: &str) -> Result<(), ManagementError> {
        let id = broker_id.to_string();
        if self.db.run(move |db| db.find_broker(&id)).await?.is_none() {
            return Err(ManagementError::NotFound(format!("Broker {} not found", broker_id)));
        }

        self.registry.deregister_broker(broker_id).await;

        let id = broker_id.to_string();
        self.db.run(move |db| db.delete_broker(&id)).await?;
        info!("🗑️ Broker {} deleted.", broker_id);
        Ok(())
    }

    /// Persists a topic and, if active, subscribes to it right away. Returns the new topic id.
    pub async fn create_topic(
        &self,
        topic: &str,
        broker_id: &str,
        is_active: bool,
    ) -> Result<String, ManagementError> {
        let id = broker_id.to_string();
        if self.db.run(move |db| db.find_broker(&id)).await?.is_none() {
            return Err(ManagementError::NotFound(format!("Broker {} not found", broker_id)));
        }

        let name = topic.to_string();
        if self.db.run(move |db| db.find_topic_by_name(&name)).await?.is_some() {
            return Err(duplicate_topic(topic));
        }

        let new_topic = NewTopic {
            topic: topic.to_string(),
            broker_id: broker_id.to_string(),
            is_active,
        };
        let created: Topic = match self.db.run(move |db| db.create_topic(&new_topic)).await {
            Ok(created) => created,
            Err(e) if e.is_unique_violation() => return Err(duplicate_topic(topic)),
            Err(e) => return Err(e.into()),
        };
        info!("✅ Topic '{}' created for broker {}", created.topic, broker_id);

        if created.is_active {
            if self.registry.subscribe(broker_id, &created.topic).await {
                info!("📡 Subscribed to new topic '{}'", created.topic);
            } else {
                warn!(
                    "⚠️ Could not subscribe to '{}' now; it will be picked up on the next reconnect.",
                    created.topic
                );
            }
        }

        Ok(created.id)
    }

    /// Unsubscribes from an active topic and deletes it.
    pub async fn delete_topic(&self, topic_id: &str) -> Result<(), ManagementError> {
        let id = topic_id.to_string();
        let topic = match self.db.run(move |db| db.find_topic(&id)).await? {
            Some(topic) => topic,
            None => return Err(ManagementError::NotFound(format!("Topic {} not found", topic_id))),
        };

        if topic.is_active && !self.registry.unsubscribe(&topic.broker_id, &topic.topic).await {
            warn!("⚠️ Could not unsubscribe from '{}' on broker {}", topic.topic, topic.broker_id);
        }

        let id = topic_id.to_string();
        self.db.run(move |db| db.delete_topic(&id)).await?;
        info!("🗑️ Topic '{}' deleted.", topic.topic);
        Ok(())
    }

    pub async fn refresh_subscriptions(&self) {
        self.registry.refresh_subscriptions().await;
    }

    /// Store counts joined with the live connection status of every broker.
    pub async fn system_status(&self) -> Result<SystemStatus, ManagementError> {
        let (broker_count, active_topic_count, active_topics, brokers) = self
            .db
            .run(|db| {
                Ok((
                    db.count_brokers()?,
                    db.count_active_topics()?,
                    db.list_active_topics()?,
                    db.list_brokers_with_active_topics()?,
                ))
            })
            .await
            .inspect_err(|e| error!("Failed to read system status from the store: {}", e))?;

        let connections = self.registry.status().await;
        let connected = connections.iter().filter(|c| c.is_connected).count();
        let total_subscriptions = connections.iter().map(|c| c.subscribed_topics.len()).sum();

        Ok(SystemStatus {
            database: DatabaseSummary {
                brokers: broker_count,
                active_topics: active_topic_count,
            },
            mqtt: MqttSummary {
                connected_brokers: format!("{}/{}", connected, connections.len()),
                total_subscriptions,
                connections,
            },
            topics: active_topics
                .into_iter()
                .map(|active| TopicSummary {
                    broker: BrokerRef {
                        id: active.topic.broker_id.clone(),
                        host: active.broker_host,
                        port: active.broker_port,
                    },
                    id: active.topic.id,
                    topic: active.topic.topic,
                    is_active: active.topic.is_active,
                })
                .collect(),
            brokers: brokers
                .into_iter()
                .map(|entry| BrokerSummary {
                    id: entry.broker.id,
                    host: entry.broker.host,
                    port: entry.broker.port,
                    topics_count: entry.topics.len(),
                    topics: entry.topics.into_iter().map(|t| t.topic).collect(),
                })
                .collect(),
        })
    }
}

fn duplicate_topic(topic: &str) -> ManagementError {
    ManagementError::Conflict(format!("Topic '{}' already exists", topic))
}
