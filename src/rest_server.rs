use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::management::{BrokerSpec, ManagementError, MonitorService, SystemStatus};

const BODY_LIMIT: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBrokerRequest {
    pub host: String,
    pub port: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTopicRequest {
    pub topic: String,
    pub broker_id: String,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BrokerCreated {
    broker_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicCreated {
    topic_id: String,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    message: String,
}

/// Error responses of the API, rendered as `{"message": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };
        (status, Json(ApiMessage { message })).into_response()
    }
}

impl From<ManagementError> for ApiError {
    fn from(err: ManagementError) -> Self {
        match err {
            ManagementError::NotFound(message) => ApiError::NotFound(message),
            ManagementError::Conflict(message) => ApiError::Conflict(message),
            ManagementError::Store(e) => {
                error!("Store failure while serving request: {}", e);
                ApiError::Internal
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn ok(message: impl Into<String>) -> Json<ApiMessage> {
    Json(ApiMessage { message: message.into() })
}

pub fn router(service: Arc<MonitorService>) -> Router {
    Router::new()
        .route("/api/v1/brokers", post(create_broker))
        .route("/api/v1/brokers/{broker_id}", delete(delete_broker))
        .route("/api/v1/topics", post(create_topic))
        .route("/api/v1/topics/{topic_id}", delete(delete_topic))
        .route("/api/v1/status", get(system_status))
        .route("/api/v1/status/refresh", post(refresh_status))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn create_broker(
    State(service): State<Arc<MonitorService>>,
    payload: Result<Json<CreateBrokerRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;

    if request.host.trim().is_empty() {
        return Err(ApiError::BadRequest("host must not be empty".to_string()));
    }
    let port = u16::try_from(request.port)
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| ApiError::BadRequest("port must be between 1 and 65535".to_string()))?;

    let broker_id = service
        .create_broker(BrokerSpec {
            host: request.host.trim().to_string(),
            port,
            username: request.username,
            password: request.password,
            ca_cert: request.ca_cert,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(BrokerCreated { broker_id })))
}

async fn delete_broker(
    State(service): State<Arc<MonitorService>>,
    Path(broker_id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    service.delete_broker(&broker_id).await?;
    Ok(ok(format!("Broker {} deleted", broker_id)))
}

async fn create_topic(
    State(service): State<Arc<MonitorService>>,
    payload: Result<Json<CreateTopicRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;

    if request.topic.trim().is_empty() || request.broker_id.trim().is_empty() {
        return Err(ApiError::BadRequest("topic and brokerId are required".to_string()));
    }

    let topic_id = service
        .create_topic(
            &request.topic,
            &request.broker_id,
            request.is_active.unwrap_or(true),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(TopicCreated { topic_id })))
}

async fn delete_topic(
    State(service): State<Arc<MonitorService>>,
    Path(topic_id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    service.delete_topic(&topic_id).await?;
    Ok(ok(format!("Topic {} deleted", topic_id)))
}

async fn system_status(
    State(service): State<Arc<MonitorService>>,
) -> Result<Json<SystemStatus>, ApiError> {
    Ok(Json(service.system_status().await?))
}

async fn refresh_status(State(service): State<Arc<MonitorService>>) -> impl IntoResponse {
    service.refresh_subscriptions().await;
    (StatusCode::ACCEPTED, ok("Subscription refresh triggered"))
}

/// Serves the API until `shutdown` resolves.
pub async fn run_rest_server<F>(
    service: Arc<MonitorService>,
    config: &Config,
    shutdown: F,
) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🌐 REST API listening on http://{}", addr);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}
