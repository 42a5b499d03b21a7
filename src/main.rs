//! crm-sync gateway
//!
//! Accepts CRM domain events over HTTP, validates them and appends them to
//! the configured Redis Streams. Invalid events land in the DLQ.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use deadpool_redis::{Config, Runtime};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crm_sync::broker::{RedisBroker, StreamBroker};
use crm_sync::config::CrmSyncConfig;
use crm_sync::publisher::{EventPublisher, PublishError};
use crm_sync::streams::stream_for_event_type;
use crm_sync::CircuitBreaker;

struct AppState {
    broker: Arc<dyn StreamBroker>,
    publisher: EventPublisher,
    breaker: Arc<CircuitBreaker>,
    api_key: String,
}

/// Body of `POST /api/v1/events`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    event_type: String,
    entity_id: String,
    tenant_id: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    /// Defaults to the stream derived from the event type
    #[serde(default)]
    stream_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CrmSyncConfig::load()?;
    let api_key = config.server.api_key.clone().unwrap_or_else(|| {
        warn!("CRM_SYNC_API_KEY not set, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
        "dev-key".to_string()
    });

    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;
    let broker: Arc<dyn StreamBroker> = Arc::new(RedisBroker::new(pool));
    let breaker = Arc::new(CircuitBreaker::new("redis-publish", config.breaker.broker.clone()));
    let publisher = EventPublisher::new(broker.clone(), breaker.clone(), &config.publisher.source_app)
        .with_max_len(config.publisher.max_len);

    let state = Arc::new(AppState {
        broker,
        publisher,
        breaker,
        api_key,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/events", post(publish_event))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("crm-sync gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "));

    match token {
        Some(token) if token == state.api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let breaker = state.breaker.snapshot();
    match state.broker.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "redis": "connected", "breaker": breaker })),
        ),
        Err(e) => {
            error!("Redis PING failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "error", "error": e.to_string(), "breaker": breaker })),
            )
        }
    }
}

async fn publish_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PublishRequest>,
) -> Response {
    debug!(event_type = %request.event_type, entity_id = %request.entity_id, "Received event");

    let stream_key = request
        .stream_key
        .clone()
        .unwrap_or_else(|| stream_for_event_type(&request.event_type));

    let result = state
        .publisher
        .publish_event(
            &stream_key,
            &request.event_type,
            &request.entity_id,
            &request.tenant_id,
            request.data,
            request.metadata,
        )
        .await;

    match result {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(json!(receipt))).into_response(),
        Err(PublishError::Validation { event_id, errors }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "success": false, "eventId": event_id, "errors": errors })),
        )
            .into_response(),
        Err(e @ PublishError::Broker { .. }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}
