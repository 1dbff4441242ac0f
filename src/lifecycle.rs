use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{error, info};

use crate::db::DatabaseService;
use crate::management::MonitorService;
use crate::models::BrokerEndpoint;
use crate::registry::BrokerRegistry;

/// Registers every stored broker. Store failures restart the whole load after `retry_delay`.
/// Returns the number of brokers newly registered.
pub async fn bootstrap(
    db: Arc<DatabaseService>,
    registry: Arc<BrokerRegistry>,
    retry_delay: Duration,
) -> usize {
    info!("🚀 Loading brokers from the database...");

    let load = || {
        let db = Arc::clone(&db);
        async move {
            db.run(|db| db.list_brokers_with_active_topics())
                .await
                .inspect_err(|e| {
                    error!("❌ Failed to load brokers: {}. Retrying in {:?}...", e, retry_delay)
                })
        }
    };

    // An infinite fixed strategy: the only exit is a successful load.
    let brokers = match Retry::spawn(FixedInterval::new(retry_delay), load).await {
        Ok(brokers) => brokers,
        Err(e) => {
            error!("❌ Giving up on loading brokers: {}", e);
            return 0;
        }
    };

    info!("📋 Found {} brokers in the database", brokers.len());

    let mut registered = 0;
    for entry in brokers {
        info!(
            "Starting broker {} ({}:{}) with {} active topics",
            entry.broker.id,
            entry.broker.host,
            entry.broker.port,
            entry.topics.len()
        );
        if registry.register_broker(BrokerEndpoint::from(entry.broker)).await {
            registered += 1;
        }
    }

    info!("✅ {} brokers registered.", registered);
    registered
}

/// Logs a one-shot summary of stored and live state.
pub async fn log_system_status(service: &MonitorService) {
    let status = match service.system_status().await {
        Ok(status) => status,
        Err(e) => {
            error!("Failed to collect system status: {}", e);
            return;
        }
    };

    info!("📊 System status");
    info!(
        "   Database: {} brokers, {} active topics",
        status.database.brokers, status.database.active_topics
    );
    info!(
        "   MQTT: {} brokers connected, {} subscriptions",
        status.mqtt.connected_brokers, status.mqtt.total_subscriptions
    );
    for connection in &status.mqtt.connections {
        info!(
            "   - {}:{} [{:?}] topics: {:?}",
            connection.host, connection.port, connection.state, connection.subscribed_topics
        );
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to handle termination signal: {:?}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

/// Closes every broker connection.
pub async fn shutdown(registry: &BrokerRegistry) {
    info!("🛑 Monitor is shutting down...");
    registry.shutdown().await;
}
