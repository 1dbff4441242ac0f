use iot_monitor::config::Config;
use iot_monitor::db::DatabaseService;
use iot_monitor::forwarder::MessageForwarder;
use iot_monitor::lifecycle::{bootstrap, log_system_status, shutdown, wait_for_termination};
use iot_monitor::link::MqttConnector;
use iot_monitor::management::MonitorService;
use iot_monitor::registry::BrokerRegistry;
use iot_monitor::rest_server::run_rest_server;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            // Logging is not up yet; the filter depends on the configuration.
            eprintln!("Error loading configuration: {}", e);
            return;
        }
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db_service = match DatabaseService::new(&config.database_path) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db_service.ping() {
        error!("Database connection failed: {:?}", e);
        return;
    }
    info!("Database connection verified.");

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Database initialized successfully.");

    let forwarder = match MessageForwarder::new(&config.front_end_url, db_service.clone()) {
        Ok(forwarder) => forwarder,
        Err(e) => {
            error!("Failed to create HTTP client: {:?}", e);
            return;
        }
    };

    let registry = BrokerRegistry::new(
        Arc::new(MqttConnector),
        db_service.clone(),
        forwarder,
        config.supervisor_settings(),
    );
    let service = MonitorService::new(db_service.clone(), registry.clone());

    // Load stored brokers in the background; the API serves meanwhile.
    let bootstrap_task = {
        let db = db_service.clone();
        let registry = registry.clone();
        let service = service.clone();
        let retry_delay = config.store_retry_delay();
        tokio::spawn(async move {
            bootstrap(db, registry, retry_delay).await;
            log_system_status(&service).await;
        })
    };

    // Start REST API server
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let rest_api_task = {
        let service = service.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let stopped = async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = run_rest_server(service, &config, stopped).await {
                error!("REST API server failed: {:?}", e);
            }
        })
    };

    wait_for_termination().await;

    bootstrap_task.abort();
    let _ = stop_tx.send(true);
    shutdown(&registry).await;

    // Wait for tasks to complete
    let _ = tokio::join!(rest_api_task);
    info!("All services shut down successfully.");
}
