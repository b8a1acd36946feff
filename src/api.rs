use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        Json,
    },
    routing::{delete, get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityStore, PersistSummary};
use crate::broadcaster::{ActivityHub, SseConnection};
use crate::db::{ActivityRepository, UserRepository};
use crate::error::{AppError, AppResult};
use crate::extractor::EventExtractor;
use crate::membership::{MembershipOracle, MembershipStore};
use crate::payload::{decode_body, parse_payload};
use crate::registry::RegistryMutator;
use crate::signature::{SignatureVerifier, WebhookEnvelope};
use crate::types::{ActivityQuery, ChainType};

/// Block-with-receipts deliveries easily exceed axum's 2 MiB default.
const MAX_WEBHOOK_BODY: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<SignatureVerifier>,
    pub extractor: EventExtractor,
    pub activity: ActivityStore,
    pub registry: RegistryMutator,
    pub hub: Arc<ActivityHub>,
    pub activity_repo: Arc<dyn ActivityRepository>,
    pub heartbeat: Duration,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires the pipeline around one process-wide hub.
    pub fn new(
        verifier: SignatureVerifier,
        membership: Arc<dyn MembershipStore>,
        activity_repo: Arc<dyn ActivityRepository>,
        users: Arc<dyn UserRepository>,
        network: &str,
        heartbeat: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let hub = Arc::new(ActivityHub::new());
        Self {
            verifier: Arc::new(verifier),
            extractor: EventExtractor::new(MembershipOracle::new(Arc::clone(&membership)), network),
            activity: ActivityStore::new(Arc::clone(&activity_repo), Arc::clone(&hub)),
            registry: RegistryMutator::new(membership, users),
            hub,
            activity_repo,
            heartbeat,
            shutdown,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/webhooks/stream",
            post(receive_webhook).layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY)),
        )
        .route("/api/activity", get(recent_activity))
        .route("/api/activity/stream", get(activity_stream))
        .route("/api/health", get(health_check))
        .route("/api/users", get(list_users).post(add_user))
        .route("/api/users/bulk", post(bulk_add_users))
        .route("/api/users/{address}", delete(remove_user))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let envelope = WebhookEnvelope::from_headers(&headers);
    if envelope.is_ping() {
        info!("Webhook connectivity ping");
        return Ok(Json(json!({ "success": true, "ping": true })));
    }

    let reject = |e: AppError| {
        warn!("Rejected webhook delivery: {}", e);
        e
    };
    state.verifier.check_envelope(&envelope).map_err(reject)?;

    // the signature covers the decompressed text
    let text = decode_body(&body, envelope.content_encoding.as_deref())?;
    state.verifier.verify(&envelope, &text).map_err(reject)?;

    let payload = parse_payload(&text)?;
    let events = state.extractor.extract(&payload).await?;
    let matched = events.len();

    let summary = if events.is_empty() {
        PersistSummary::default()
    } else {
        state.activity.persist(events).await?
    };
    state.hub.record_webhook(chrono::Utc::now());

    info!(
        blocks = payload.data.len(),
        matched,
        processed = summary.processed,
        skipped = summary.skipped,
        "Webhook delivery processed"
    );

    Ok(Json(json!({
        "success": true,
        "processed": summary.processed,
        "skipped": summary.skipped,
    })))
}

async fn activity_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connection = SseConnection::new(
        Arc::clone(&state.hub),
        state.heartbeat,
        state.shutdown.child_token(),
    );
    let (_task, outbound) = connection.spawn();
    debug!(subscribers = state.hub.subscriber_count(), "SSE client connected");

    // dropping the stream on disconnect closes `outbound`, which ends the task
    let events = stream::unfold(outbound, |mut outbound| async move {
        let message = outbound.recv().await?;
        let event = Event::default().json_data(&message).unwrap_or_else(|e| {
            error!("Failed to encode stream message: {}", e);
            Event::default().comment("encoding error")
        });
        Some((Ok(event), outbound))
    });

    Sse::new(events)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let db = match state.activity_repo.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Health check database ping failed: {}", e);
            false
        }
    };

    Json(json!({
        "status": if db { "ok" } else { "degraded" },
        "db": db,
        "lastWebhook": state.hub.last_webhook().map(|at| at.to_rfc3339()),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn recent_activity(
    State(state): State<AppState>,
    Query(mut query): Query<ActivityQuery>,
) -> AppResult<Json<Value>> {
    // EVM addresses are stored lowercase
    query.address = query.address.map(|address| {
        let address = address.trim().to_string();
        if address.starts_with("0x") || address.starts_with("0X") {
            address.to_ascii_lowercase()
        } else {
            address
        }
    });

    let events = state.activity_repo.recent(&query).await?;
    Ok(Json(json!({
        "success": true,
        "count": events.len(),
        "events": events,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUserRequest {
    #[serde(alias = "address")]
    pub wallet_address: String,
    pub chain_type: Option<String>,
    pub name: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAddRequest {
    pub chain_type: Option<String>,
    /// One `address[,name]` entry per element.
    pub addresses: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainFilter {
    pub chain_type: Option<String>,
}

fn chain_or_default(raw: Option<&str>) -> AppResult<ChainType> {
    raw.map(ChainType::from_str).transpose().map(Option::unwrap_or_default)
}

async fn add_user(
    State(state): State<AppState>,
    Json(request): Json<AddUserRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let chain = chain_or_default(request.chain_type.as_deref())?;
    let user = state
        .registry
        .add(chain, &request.wallet_address, request.name, request.display_name)
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "user": user }))))
}

async fn bulk_add_users(
    State(state): State<AppState>,
    Json(request): Json<BulkAddRequest>,
) -> AppResult<Json<Value>> {
    let chain = chain_or_default(request.chain_type.as_deref())?;
    if request.addresses.is_empty() {
        return Err(AppError::Validation("addresses must not be empty".to_string()));
    }

    let report = state.registry.bulk_add(chain, &request.addresses).await?;
    Ok(Json(json!({
        "success": true,
        "added": report.added.len(),
        "users": report.added,
        "skipped": report.skipped,
        "failed": report.failed,
    })))
}

async fn remove_user(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(filter): Query<ChainFilter>,
) -> AppResult<Json<Value>> {
    let chain = chain_or_default(filter.chain_type.as_deref())?;
    let removed = state.registry.remove(chain, &address).await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

async fn list_users(
    State(state): State<AppState>,
    Query(filter): Query<ChainFilter>,
) -> AppResult<Json<Value>> {
    let chain = filter
        .chain_type
        .as_deref()
        .map(ChainType::from_str)
        .transpose()?;
    let users = state.registry.list(chain).await?;
    Ok(Json(json!({
        "success": true,
        "count": users.len(),
        "users": users,
    })))
}
