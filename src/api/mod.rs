//! HTTP API for health checks, transfer status and peer signature intake

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::consensus::{Acceptance, SignatureMessage};
use crate::coordination::CoordinationEngine;
use crate::error::{ErrorKind, RelayerError, RelayerResult};
use crate::recovery::ReorgRecoveryManager;
use crate::state::TransferStore;
use crate::types::{AuditEntry, SupportedToken, Transfer, TransferStats, TransferStatus};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Largest page served by `/transfers`
const MAX_PAGE: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TransferStore>,
    pub chains: Arc<ChainManager>,
    pub engine: Arc<CoordinationEngine>,
    pub recovery: Arc<ReorgRecoveryManager>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/tokens", get(list_tokens))
        .route("/transfers", get(list_transfers))
        .route("/transfers/:id", get(get_transfer))
        .route("/transfers/:id/signatures", get(get_signatures))
        .route("/transfers/:id/revalidate", post(revalidate_transfer))
        .route("/v1/signatures", post(receive_signature))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Relayer errors rendered as JSON with a status code matching their kind
struct ApiError(RelayerError);

impl From<RelayerError> for ApiError {
    fn from(err: RelayerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayerError::TransferNotFound { .. } => StatusCode::NOT_FOUND,
            RelayerError::UnauthorizedSigner { .. } => StatusCode::FORBIDDEN,
            RelayerError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            e => match e.kind() {
                ErrorKind::Validation | ErrorKind::Authenticity => StatusCode::BAD_REQUEST,
                ErrorKind::Network => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind().as_str().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chains.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
                .collect(),
        }),
    )
}

/// Transfer counts per status
async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let transfers = state.store.get_stats().await?;
    Ok(Json(StatsResponse {
        total: transfers.total(),
        transfers,
        chains: state.chains.chain_ids(),
        executions_in_flight: state.engine.in_flight(),
    }))
}

/// Token registry as held by the store
async fn list_tokens(State(state): State<AppState>) -> Result<Json<Vec<SupportedToken>>, ApiError> {
    let mut tokens = state.store.list_tokens().await?;
    tokens.sort_by(|a, b| (a.chain_id, &a.token_address).cmp(&(b.chain_id, &b.token_address)));
    Ok(Json(tokens))
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn list_transfers(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<Transfer>>, ApiError> {
    let limit = page.limit.unwrap_or(MAX_PAGE).min(MAX_PAGE);
    Ok(Json(state.store.list_transfers(page.offset, limit).await?))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TransferResponse>, ApiError> {
    let transfer = find_transfer(&state, &id).await?;
    let signatures = state.store.signature_count(&id).await?;
    let audit = state.store.get_audit_trail(&id).await?;
    Ok(Json(TransferResponse {
        transfer,
        signatures,
        audit,
    }))
}

async fn get_signatures(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<SignatureMessage>>, ApiError> {
    find_transfer(&state, &id).await?;
    let signatures = state
        .store
        .get_signatures(&id)
        .await?
        .iter()
        .map(SignatureMessage::from_signature)
        .collect();
    Ok(Json(signatures))
}

/// Operator re-check of an UnderReview transfer
async fn revalidate_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RevalidateResponse>, ApiError> {
    let status = state.recovery.revalidate_under_review(&id).await?;
    info!("Operator revalidated {}: now {}", id, status);
    if status == TransferStatus::Confirming {
        state.engine.advance(&id).await?;
    }
    Ok(Json(RevalidateResponse { id, status }))
}

/// Peer signature intake
async fn receive_signature(
    State(state): State<AppState>,
    Json(message): Json<SignatureMessage>,
) -> Result<Json<SignatureReceipt>, ApiError> {
    let outcome = state.engine.accept_signature(&message).await.map_err(|e| {
        warn!(
            "Signature from {} for {} refused: {}",
            message.signer, message.transfer_id, e
        );
        ApiError(e)
    })?;
    let outcome = match outcome {
        Acceptance::Accepted => "accepted",
        Acceptance::Duplicate => "duplicate",
        Acceptance::Ignored => "ignored",
    };
    Ok(Json(SignatureReceipt {
        transfer_id: message.transfer_id,
        outcome: outcome.to_string(),
    }))
}

async fn find_transfer(state: &AppState, id: &str) -> Result<Transfer, ApiError> {
    state.store.get_transfer(id).await?.ok_or_else(|| {
        ApiError(RelayerError::TransferNotFound {
            transfer_id: id.to_string(),
        })
    })
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    total: u64,
    transfers: TransferStats,
    chains: Vec<u64>,
    executions_in_flight: usize,
}

#[derive(Serialize)]
struct TransferResponse {
    transfer: Transfer,
    signatures: usize,
    audit: Vec<AuditEntry>,
}

#[derive(Serialize)]
struct RevalidateResponse {
    id: String,
    status: TransferStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignatureReceipt {
    transfer_id: String,
    outcome: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_event, TestRelayer};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(h: &TestRelayer) -> Router {
        router(AppState {
            store: h.store.clone(),
            chains: h.chains.clone(),
            engine: h.engine.clone(),
            recovery: h.recovery.clone(),
            started_at: Instant::now(),
        })
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = tokio_test::assert_ok!(app.oneshot(request).await);
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &impl Serialize) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn recorded(h: &TestRelayer, nonce: u64) -> String {
        let event = h.source.add_event(lock_event(1, 137, nonce, 5_000, 100));
        h.engine.ingest_event(&event, 100).await.unwrap();
        event.transfer_id
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let (status, body) = call(app(&h), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(app(&h), get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["details"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transfer_views() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let id = recorded(&h, 1).await;

        let (status, body) = call(app(&h), get(&format!("/transfers/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["transfer"]["amount"], "5000");
        assert_eq!(body["signatures"], 1);
        assert_eq!(body["audit"].as_array().unwrap().len(), 2);

        let (_, body) = call(app(&h), get("/transfers?limit=5")).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = call(app(&h), get(&format!("/transfers/{}/signatures", id))).await;
        assert_eq!(body[0]["transferId"], id.as_str());

        let (_, body) = call(app(&h), get("/stats")).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["transfers"]["confirming"], 1);

        let (status, body) = call(app(&h), get("/transfers/0xmissing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "state");
    }

    #[tokio::test]
    async fn test_token_registry_view() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let mut disabled = crate::test_utils::sample_token(137);
        disabled.enabled = false;
        h.store.upsert_token(&disabled).await.unwrap();

        let (status, body) = call(app(&h), get("/tokens")).await;
        assert_eq!(status, StatusCode::OK);
        let tokens = body.as_array().unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0]["chain_id"], 1);
        assert_eq!(tokens[1]["chain_id"], 137);
        assert_eq!(tokens[1]["enabled"], false);
    }

    #[tokio::test]
    async fn test_peer_signature_intake() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let id = recorded(&h, 2).await;

        let forged = h.peer_signature(&id, 7).await;
        let (status, body) = call(app(&h), post_json("/v1/signatures", &forged)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "authenticity");

        let mut garbled = h.peer_signature(&id, 3).await;
        garbled.signature = "0x1234".to_string();
        let (status, _) = call(app(&h), post_json("/v1/signatures", &garbled)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let valid = h.peer_signature(&id, 3).await;
        let (status, body) = call(app(&h), post_json("/v1/signatures", &valid)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "accepted");

        let (_, body) = call(app(&h), post_json("/v1/signatures", &valid)).await;
        assert_eq!(body["outcome"], "duplicate");
    }

    #[tokio::test]
    async fn test_revalidate_requires_review() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let id = recorded(&h, 3).await;

        let uri = format!("/transfers/{}/revalidate", id);
        let (status, _) = call(app(&h), Request::post(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        h.store
            .transition(&id, TransferStatus::Confirming, TransferStatus::UnderReview, Some("signature timeout"))
            .await
            .unwrap();
        let (status, body) = call(app(&h), Request::post(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "confirming");
    }
}
