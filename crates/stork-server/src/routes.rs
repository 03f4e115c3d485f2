use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use bytes::Bytes;
use serde::Deserialize;
use stork_auth::ApprovalError;
use stork_crypto::envelope::HEADER_LEN;
use stork_transfer::{InboundService, MAX_CHUNK_SIZE, TransferError};
use stork_trust::TrustError;
use stork_types::api::{
    ApprovalList, ChunkResponse, DenyRequest, ErrorResponse, FinalizeRequest, FinalizeResponse,
    HandshakeRequest, HandshakeResponse, InfoResponse, InitTransferRequest, InitTransferResponse,
    PeerSummary, TrustPeerRequest, paths,
};
use stork_types::{ApprovalRequest, TransferRecord, TrustedPeer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InboundService>,
}

/// Error half of every handler; renders as an [`ErrorResponse`] body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, error: String) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error,
                kind: "internal".into(),
                code: code.into(),
                retry_after_secs: None,
            },
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %e, "Request failed");
        }
        Self { status, body: e.to_response() }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", e.to_string()),
            ApprovalError::AlreadyResolved { .. } => Self::new(StatusCode::CONFLICT, "conflict", e.to_string()),
            ApprovalError::ReasonRequired => Self::new(StatusCode::BAD_REQUEST, "protocol", e.to_string()),
            other => TransferError::from(other).into(),
        }
    }
}

impl From<TrustError> for ApiError {
    fn from(e: TrustError) -> Self {
        match e {
            TrustError::KeyMismatch { .. } => Self::new(StatusCode::CONFLICT, "conflict", e.to_string()),
            other => TransferError::from(other).into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_after = self.body.retry_after_secs;
        let mut resp = (self.status, Json(self.body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        resp
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(paths::INFO, get(info_handler))
        .route(paths::HANDSHAKE, post(handshake))
        .route(paths::INIT_TRANSFER, post(init_transfer))
        .route(paths::CHUNK, post(receive_chunk))
        .route(paths::FINALIZE, post(finalize))
        .route("/transfers", get(list_transfers))
        .route("/transfers/{id}", delete(cancel_transfer))
        .route("/approvals", get(list_approvals))
        .route("/approvals/{id}/approve", post(approve))
        .route("/approvals/{id}/deny", post(deny))
        .route("/peers", get(list_peers))
        .route("/peers/{id}/trust", post(trust_peer).delete(untrust_peer))
        .layer(DefaultBodyLimit::max((MAX_CHUNK_SIZE as usize) + HEADER_LEN + 64))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// -- Peer protocol --

/// GET /info
async fn info_handler(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(state.service.info())
}

/// POST /handshake
async fn handshake(
    State(state): State<AppState>,
    Json(req): Json<HandshakeRequest>,
) -> ApiResult<HandshakeResponse> {
    Ok(Json(state.service.handshake(req)?))
}

/// POST /transfers/init. May block while the transfer waits for approval.
async fn init_transfer(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<InitTransferRequest>,
) -> ApiResult<InitTransferResponse> {
    let client = addr.ip().to_string();
    Ok(Json(state.service.init_transfer(req, &client).await?))
}

/// POST /transfers/chunk with a binary chunk envelope as the body.
async fn receive_chunk(State(state): State<AppState>, body: Bytes) -> ApiResult<ChunkResponse> {
    Ok(Json(state.service.receive_chunk(&body).await?))
}

/// POST /transfers/finalize
async fn finalize(
    State(state): State<AppState>,
    Json(req): Json<FinalizeRequest>,
) -> ApiResult<FinalizeResponse> {
    Ok(Json(state.service.finalize(req).await?))
}

// -- Local management --

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
}

/// GET /transfers?limit=N
async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<TransferRecord>> {
    let Some(db) = &state.service.context().db else {
        return Ok(Json(Vec::new()));
    };
    let limit = query.limit.unwrap_or(50).min(500);
    let records = db
        .list_transfers(limit)
        .map_err(|e| TransferError::Internal(e.to_string()))?;
    Ok(Json(records))
}

/// DELETE /transfers/{id}
async fn cancel_transfer(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.service.receiver().cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /approvals
async fn list_approvals(State(state): State<AppState>) -> Json<ApprovalList> {
    Json(ApprovalList { pending: state.service.context().approvals.pending() })
}

/// POST /approvals/{id}/approve
async fn approve(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<ApprovalRequest> {
    let req = state.service.context().approvals.approve(id)?;
    info!(approval_id = %id, file = %req.file_name, "Approved via API");
    Ok(Json(req))
}

/// POST /approvals/{id}/deny
async fn deny(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DenyRequest>,
) -> ApiResult<ApprovalRequest> {
    let req = state.service.context().approvals.deny(id, &body.reason)?;
    info!(approval_id = %id, reason = %body.reason, "Denied via API");
    Ok(Json(req))
}

/// GET /peers
async fn list_peers(State(state): State<AppState>) -> Json<Vec<PeerSummary>> {
    let registry = &state.service.context().registry;
    let peers = registry
        .trusted_peers()
        .into_iter()
        .map(|peer| PeerSummary {
            metrics: registry.metrics(&peer.peer_id),
            trust_score: registry.trust_score(&peer.peer_id),
            peer,
        })
        .collect();
    Json(peers)
}

/// POST /peers/{id}/trust
async fn trust_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TrustPeerRequest>,
) -> ApiResult<TrustedPeer> {
    let peer = state
        .service
        .context()
        .registry
        .trust_peer(&id, &body.name, &body.public_key)?;
    Ok(Json(peer))
}

/// DELETE /peers/{id}/trust
async fn untrust_peer(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    if state.service.context().registry.untrust_peer(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("peer {id} is not trusted")))
    }
}
