//! HTTP routes for device sync, verification and ledger reads.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{DeviceIdError, StoreError, SyncError};
use crate::model::{Block, DeviceId};
use crate::reconcile::SyncOutcome;
use crate::verify::{DashboardView, StatsView, VerificationReport};
use crate::AppState;

/// Errors surfaced to HTTP clients.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid device key: {0}")]
    DeviceKey(#[from] DeviceIdError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::RangeOutOfBounds { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        StoreError::NonContiguousAppend { .. } => StatusCode::CONFLICT,
        StoreError::Corrupt { .. } | StoreError::Encode(_) | StoreError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::DeviceKey(_) => StatusCode::BAD_REQUEST,
            ApiError::Sync(SyncError::InvalidSegment(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Sync(SyncError::SegmentTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Sync(SyncError::DivergentChain { .. }) => StatusCode::CONFLICT,
            ApiError::Sync(SyncError::Store(err)) | ApiError::Store(err) => store_status(err),
            ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::DeviceKey(_) => "INVALID_DEVICE_KEY",
            ApiError::Sync(err) => err.code(),
            ApiError::Store(err) => err.code(),
            ApiError::Task(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

/// Segment pushed by a device since its last successful sync.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_key: String,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub app_version: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub outcome: SyncOutcome,
}

/// POST /api/sync
pub async fn submit_sync(
    State(state): State<AppState>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let device = DeviceId::parse(&payload.device_key)?;
    tracing::debug!(
        device = %device,
        blocks = payload.blocks.len(),
        app_version = payload.app_version.as_deref().unwrap_or("unknown"),
        "sync received"
    );

    let reconciler = state.reconciler.clone();
    let id = device.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        reconciler.submit_sync_from(&id, &payload.blocks, payload.app_version.as_deref())
    })
    .await??;

    Ok(Json(SyncResponse {
        device_id: device,
        outcome,
    }))
}

/// GET /api/verify/:device
pub async fn verify(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<VerificationReport>, ApiError> {
    let device = DeviceId::parse(&device)?;
    let verifier = state.verifier.clone();
    let report = tokio::task::spawn_blocking(move || verifier.verify(&device)).await??;
    Ok(Json(report))
}

#[derive(Deserialize)]
pub struct RangeQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

/// GET /api/blocks/:device?from=&to= (inclusive; defaults to the whole chain)
pub async fn read_range(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<Block>>, ApiError> {
    let device = DeviceId::parse(&device)?;
    let to = match range.to {
        Some(to) => to,
        None => state
            .store
            .tail(&device)
            .map(|b| b.index)
            .ok_or_else(|| StoreError::DeviceNotFound(device.clone()))?,
    };
    let blocks = state.store.read_range(&device, range.from.unwrap_or(0), to)?;
    Ok(Json(blocks))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TailResponse {
    pub device_id: DeviceId,
    pub tail: Option<Block>,
}

/// GET /api/tail/:device
pub async fn tail(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<TailResponse>, ApiError> {
    let device = DeviceId::parse(&device)?;
    let tail = state.store.tail(&device);
    Ok(Json(TailResponse {
        device_id: device,
        tail,
    }))
}

/// GET /api/stats/:device
pub async fn stats(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<StatsView>, ApiError> {
    let device = DeviceId::parse(&device)?;
    let verifier = state.verifier.clone();
    let view = tokio::task::spawn_blocking(move || verifier.stats(&device)).await??;
    Ok(Json(view))
}

/// GET /api/dashboard/:device
pub async fn dashboard(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<DashboardView>, ApiError> {
    let device = DeviceId::parse(&device)?;
    let verifier = state.verifier.clone();
    let view = tokio::task::spawn_blocking(move || verifier.dashboard(&device)).await??;
    Ok(Json(view))
}

/// GET /pubkey — hex verifying key for checking report attestations
#[derive(Serialize)]
pub struct PubKeyResp {
    pub pubkey_hex: String,
}
pub async fn pubkey(State(state): State<AppState>) -> Json<PubKeyResp> {
    Json(PubKeyResp {
        pubkey_hex: state.key.public_hex(),
    })
}

/// GET /health
#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub devices: usize,
}
pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        devices: state.store.devices().len(),
    })
}

/// GET /version
#[derive(Serialize)]
pub struct Version {
    pub version: &'static str,
    pub git_sha: Option<&'static str>,
}
pub async fn version() -> Json<Version> {
    Json(Version {
        version: env!("CARGO_PKG_VERSION"),
        git_sha: option_env!("GIT_SHA"),
    })
}
