use log::{error, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ActiveTopic, Broker, BrokerWithTopics, NewBroker, NewTopic, Topic};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// True when a UNIQUE constraint rejected the write.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    }
}

pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
}

const BROKER_COLUMNS: &str = "id, host, port, username, password, ca_cert";
const TOPIC_COLUMNS: &str = "id, topic, broker_id, is_active";

fn broker_from_row(row: &Row<'_>) -> rusqlite::Result<Broker> {
    Ok(Broker {
        id: row.get(0)?,
        host: row.get(1)?,
        port: row.get(2)?,
        username: row.get(3)?,
        password: row.get(4)?,
        ca_cert: row.get(5)?,
    })
}

fn topic_from_row(row: &Row<'_>) -> rusqlite::Result<Topic> {
    Ok(Topic {
        id: row.get(0)?,
        topic: row.get(1)?,
        broker_id: row.get(2)?,
        is_active: row.get(3)?,
    })
}

impl DatabaseService {
    /// Opens a pooled connection to the SQLite file at `db_path`.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder().max_size(8).build(manager)?;
        Ok(Self { pool })
    }

    /// Runs a blocking store call on the blocking thread pool.
    pub async fn run<T, F>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&DatabaseService) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS brokers (
            id TEXT PRIMARY KEY,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            username TEXT,
            password TEXT,
            ca_cert TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS topics (
            id TEXT PRIMARY KEY,
            topic TEXT NOT NULL UNIQUE,
            broker_id TEXT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT 1,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (broker_id) REFERENCES brokers(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_topics_broker_active ON topics (broker_id, is_active);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Round-trips a trivial query to prove the file can be opened and read.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn create_broker(&self, broker: &NewBroker) -> Result<Broker, StoreError> {
        let conn = self.pool.get()?;
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO brokers (id, host, port, username, password, ca_cert)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                broker.host,
                broker.port,
                broker.username,
                broker.password,
                broker.ca_cert
            ],
        )?;

        Ok(Broker {
            id,
            host: broker.host.clone(),
            port: broker.port,
            username: broker.username.clone(),
            password: broker.password.clone(),
            ca_cert: broker.ca_cert.clone(),
        })
    }

    pub fn find_broker(&self, id: &str) -> Result<Option<Broker>, StoreError> {
        let conn = self.pool.get()?;
        let broker = conn
            .query_row(
                &format!("SELECT {} FROM brokers WHERE id = ?1", BROKER_COLUMNS),
                params![id],
                broker_from_row,
            )
            .optional()?;
        Ok(broker)
    }

    /// Deletes a broker; its topics go with it.
    pub fn delete_broker(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM brokers WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Every broker, each with the topics currently flagged active for it.
    pub fn list_brokers_with_active_topics(&self) -> Result<Vec<BrokerWithTopics>, StoreError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM brokers ORDER BY created_at, id",
            BROKER_COLUMNS
        ))?;
        let brokers = stmt
            .query_map([], broker_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM topics WHERE is_active = 1 ORDER BY created_at, id",
            TOPIC_COLUMNS
        ))?;
        let mut by_broker: HashMap<String, Vec<Topic>> = HashMap::new();
        for topic in stmt.query_map([], topic_from_row)? {
            let topic = topic?;
            by_broker.entry(topic.broker_id.clone()).or_default().push(topic);
        }

        Ok(brokers
            .into_iter()
            .map(|broker| {
                let topics = by_broker.remove(&broker.id).unwrap_or_default();
                BrokerWithTopics { broker, topics }
            })
            .collect())
    }

    /// Topic strings flagged active for one broker.
    pub fn active_topics_for_broker(&self, broker_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT topic FROM topics WHERE broker_id = ?1 AND is_active = 1 ORDER BY created_at, id",
        )?;
        let topics = stmt
            .query_map(params![broker_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(topics)
    }

    pub fn create_topic(&self, topic: &NewTopic) -> Result<Topic, StoreError> {
        let conn = self.pool.get()?;
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO topics (id, topic, broker_id, is_active) VALUES (?1, ?2, ?3, ?4)",
            params![id, topic.topic, topic.broker_id, topic.is_active],
        )?;

        Ok(Topic {
            id,
            topic: topic.topic.clone(),
            broker_id: topic.broker_id.clone(),
            is_active: topic.is_active,
        })
    }

    pub fn find_topic(&self, id: &str) -> Result<Option<Topic>, StoreError> {
        let conn = self.pool.get()?;
        let topic = conn
            .query_row(
                &format!("SELECT {} FROM topics WHERE id = ?1", TOPIC_COLUMNS),
                params![id],
                topic_from_row,
            )
            .optional()?;
        Ok(topic)
    }

    /// Looks a topic up by its topic string, whatever broker owns it.
    pub fn find_topic_by_name(&self, topic: &str) -> Result<Option<Topic>, StoreError> {
        let conn = self.pool.get()?;
        let topic = conn
            .query_row(
                &format!("SELECT {} FROM topics WHERE topic = ?1", TOPIC_COLUMNS),
                params![topic],
                topic_from_row,
            )
            .optional()?;
        Ok(topic)
    }

    pub fn find_topic_for_broker(
        &self,
        topic: &str,
        broker_id: &str,
    ) -> Result<Option<Topic>, StoreError> {
        let conn = self.pool.get()?;
        let topic = conn
            .query_row(
                &format!(
                    "SELECT {} FROM topics WHERE topic = ?1 AND broker_id = ?2",
                    TOPIC_COLUMNS
                ),
                params![topic, broker_id],
                topic_from_row,
            )
            .optional()?;
        Ok(topic)
    }

    pub fn delete_topic(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM topics WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Active topics joined with their owning broker.
    pub fn list_active_topics(&self) -> Result<Vec<ActiveTopic>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT t.id, t.topic, t.broker_id, t.is_active, b.host, b.port
             FROM topics t
             INNER JOIN brokers b ON b.id = t.broker_id
             WHERE t.is_active = 1
             ORDER BY t.created_at, t.id",
        )?;
        let topics = stmt
            .query_map([], |row| {
                Ok(ActiveTopic {
                    topic: topic_from_row(row)?,
                    broker_host: row.get(4)?,
                    broker_port: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(topics)
    }

    pub fn count_brokers(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM brokers", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn count_active_topics(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM topics WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
