use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use inventory_sync::event::{EventKind, InventoryEvent};
use inventory_sync::query::{parse_ids, InventoryQuery, QueryError};
use inventory_sync::store::PgInventoryStore;
use inventory_sync::stream::{RedisStreamWriter, StreamWriter};
use inventory_sync::ServiceConfig;

/// Application metrics
struct Metrics {
    events_accepted: AtomicU64,
    events_rejected: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    fn new() -> Self {
        Self {
            events_accepted: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

struct AppState {
    redis_pool: Pool,
    events: RedisStreamWriter,
    inventory: InventoryQuery,
    api_key: String,
    metrics: Metrics,
}

/// Response returned when an event is accepted onto the stream.
#[derive(Debug, Serialize, Deserialize)]
struct EventResponse {
    /// Redis stream ID assigned to the event
    id: String,
    status: String,
    #[serde(rename = "correlationId")]
    correlation_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenvy::dotenv().ok();

    // 2. Setup Configuration
    let config = ServiceConfig::load()?;
    let api_key = config
        .server
        .api_key
        .clone()
        .or_else(|| env::var("INVENTORY_API_KEY").ok())
        .unwrap_or_else(|| {
            warn!("No API key configured, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
            "dev-key".to_string()
        });

    // 3. Setup Redis Pool
    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;
    let events = RedisStreamWriter::new(pool.clone(), config.streams.events.clone())
        .with_max_len(config.streams.max_len);

    let store = PgInventoryStore::connect(
        &config.postgres.url,
        config.postgres.max_connections,
        config.acquire_timeout(),
    )
    .await?;

    let app_state = Arc::new(AppState {
        redis_pool: pool,
        events,
        inventory: InventoryQuery::new(Arc::new(store)),
        api_key,
        metrics: Metrics::new(),
    });

    // 4. Build Router with Auth Middleware
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/events", post(emit_event))
        .route("/api/v1/inventory", get(get_inventories))
        .route("/api/v1/inventory/:id", get(get_inventory))
        .layer(middleware::from_fn_with_state(app_state.clone(), auth_middleware))
        .with_state(app_state);

    // 5. Start Server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(stream = %config.streams.events, "Inventory intake listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Skip auth for health check and metrics
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
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

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!("Redis PING failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({ "status": "ok", "redis": "connected" })))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.metrics.uptime_seconds(),
        "events": {
            "accepted": state.metrics.events_accepted.load(Ordering::Relaxed),
            "rejected": state.metrics.events_rejected.load(Ordering::Relaxed),
        },
        "stream": state.events.stream(),
        "status": "running"
    }))
}

/// Reject events the consumer would drop, and stamp a missing timestamp.
fn prepare_event(mut event: InventoryEvent) -> Result<InventoryEvent, String> {
    if let EventKind::Unknown(kind) = &event.kind {
        return Err(format!("unknown event type '{}'", kind));
    }
    if event.item_id.is_empty() {
        return Err("item_id must not be empty".to_string());
    }
    if event.date_time.is_none() {
        event.date_time = Some(Utc::now());
    }
    Ok(event)
}

async fn emit_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<InventoryEvent>,
) -> Result<(StatusCode, Json<EventResponse>), (StatusCode, Json<Value>)> {
    let correlation_id = headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let event = prepare_event(event).map_err(|reason| {
        state.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %correlation_id, reason = %reason, "Rejected event");
        (StatusCode::BAD_REQUEST, Json(json!({ "error": reason })))
    })?;

    let payload = event.encode().map_err(|e| {
        error!("Failed to serialize event: {}", e);
        internal_error()
    })?;

    let id = state
        .events
        .publish(&event.item_id, payload.as_bytes())
        .await
        .map_err(|e| {
            error!("Failed to push event to Redis Stream: {}", e);
            internal_error()
        })?;

    state.metrics.events_accepted.fetch_add(1, Ordering::Relaxed);
    info!(
        id = %id,
        item_id = %event.item_id,
        event_type = %event.kind,
        correlation_id = %correlation_id,
        "Event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            id,
            status: "accepted".to_string(),
            correlation_id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct InventoriesParams {
    #[serde(default)]
    ids: String,
}

async fn get_inventory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.inventory.get(&id).await {
        Ok(Some(item)) => Ok(Json(json!(item))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("item '{}' not found", id) })),
        )),
        Err(e) => Err(query_error(e)),
    }
}

async fn get_inventories(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InventoriesParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let items = state
        .inventory
        .get_many(&parse_ids(&params.ids))
        .await
        .map_err(query_error)?;
    Ok(Json(json!({ "data": items })))
}

fn query_error(e: QueryError) -> (StatusCode, Json<Value>) {
    let status = match e {
        QueryError::EmptyId | QueryError::TooManyIds { .. } => StatusCode::BAD_REQUEST,
        QueryError::Store(ref err) => {
            error!("Inventory lookup failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn internal_error() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "failed to publish event" })),
    )
}
