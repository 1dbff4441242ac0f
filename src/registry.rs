use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};

use crate::db::DatabaseService;
use crate::forwarder::MessageForwarder;
use crate::link::Connector;
use crate::models::BrokerEndpoint;
use crate::supervisor::{
    BrokerStatus, Supervisor, SupervisorCommand, SupervisorContext, SupervisorHandle,
    SupervisorSettings,
};

/// Live supervisors keyed by broker id.
pub struct BrokerRegistry {
    supervisors: RwLock<HashMap<String, SupervisorHandle>>,
    ctx: SupervisorContext,
}

impl BrokerRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        db: Arc<DatabaseService>,
        forwarder: Arc<MessageForwarder>,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisors: RwLock::new(HashMap::new()),
            ctx: SupervisorContext {
                connector,
                db,
                forwarder,
                settings,
            },
        })
    }

    /// Starts a supervisor for the broker. Returns false if one is already running.
    pub async fn register_broker(&self, endpoint: BrokerEndpoint) -> bool {
        let mut supervisors = self.supervisors.write().await;
        if supervisors.contains_key(&endpoint.id) {
            warn!("⚠️ Broker {} is already registered.", endpoint.id);
            return false;
        }

        info!("Registering broker {} ({}:{})", endpoint.id, endpoint.host, endpoint.port);
        let id = endpoint.id.clone();
        let handle = Supervisor::spawn(endpoint, self.ctx.clone());
        supervisors.insert(id, handle);
        true
    }

    /// Stops and forgets the broker's supervisor. Returns false for unknown ids.
    pub async fn deregister_broker(&self, broker_id: &str) -> bool {
        let removed = self.supervisors.write().await.remove(broker_id);
        match removed {
            Some(handle) => {
                handle.shutdown().await;
                info!("🗑️ Broker {} removed from monitoring.", broker_id);
                true
            }
            None => false,
        }
    }

    pub async fn subscribe(&self, broker_id: &str, topic: &str) -> bool {
        let (reply, outcome) = oneshot::channel();
        let command = SupervisorCommand::Subscribe {
            topic: topic.to_string(),
            reply,
        };
        self.request(broker_id, command, outcome).await
    }

    pub async fn unsubscribe(&self, broker_id: &str, topic: &str) -> bool {
        let (reply, outcome) = oneshot::channel();
        let command = SupervisorCommand::Unsubscribe {
            topic: topic.to_string(),
            reply,
        };
        self.request(broker_id, command, outcome).await
    }

    async fn request(
        &self,
        broker_id: &str,
        command: SupervisorCommand,
        outcome: oneshot::Receiver<bool>,
    ) -> bool {
        let commands = match self.supervisors.read().await.get(broker_id) {
            Some(handle) => handle.commands(),
            None => {
                warn!("❌ No supervisor for broker {}.", broker_id);
                return false;
            }
        };

        if commands.send(command).await.is_err() {
            return false;
        }
        outcome.await.unwrap_or(false)
    }

    /// Asks every supervisor to rebuild its subscriptions from the store.
    pub async fn refresh_subscriptions(&self) {
        let targets: Vec<_> = self
            .supervisors
            .read()
            .await
            .values()
            .map(|handle| handle.commands())
            .collect();

        info!("🔄 Refreshing subscriptions of {} brokers", targets.len());
        for commands in targets {
            let _ = commands.send(SupervisorCommand::Reconcile).await;
        }
    }

    /// Snapshot of every supervisor, ordered by broker id.
    pub async fn status(&self) -> Vec<BrokerStatus> {
        let mut statuses: Vec<BrokerStatus> = self
            .supervisors
            .read()
            .await
            .values()
            .map(SupervisorHandle::status)
            .collect();
        statuses.sort_by(|a, b| a.broker_id.cmp(&b.broker_id));
        statuses
    }

    /// Stops every supervisor.
    pub async fn shutdown(&self) {
        let handles: Vec<SupervisorHandle> = self
            .supervisors
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        info!("Shutting down {} broker connections...", handles.len());
        join_all(handles.into_iter().map(SupervisorHandle::shutdown)).await;
        info!("All broker connections closed.");
    }
}
