//! Tamper-evident ledger of device activity reports.
//!
//! Devices submit hash-chained segments of activity blocks; the server
//! reconciles them against its persisted per-device chain and can re-verify
//! the whole stored history at any time.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod routes;
pub mod stats;
pub mod storage;
pub mod store;
pub mod validator;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::Path;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use config::LedgerSettings;
use crypto::ServerKey;
use error::StoreError;
use reconcile::SyncReconciler;
use store::LedgerStore;
use verify::VerificationService;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub key: Arc<ServerKey>,
    pub store: Arc<LedgerStore>,
    pub reconciler: Arc<SyncReconciler>,
    pub verifier: Arc<VerificationService>,
}

impl AppState {
    /// Open the ledger store under `data_dir` and wire the services around it.
    pub fn open(data_dir: &Path, key: ServerKey, settings: LedgerSettings) -> Result<Self, StoreError> {
        let key = Arc::new(key);
        let store = Arc::new(LedgerStore::open(data_dir)?);
        Ok(Self {
            reconciler: Arc::new(SyncReconciler::new(Arc::clone(&store), settings)),
            verifier: Arc::new(VerificationService::new(
                Arc::clone(&store),
                settings.difficulty,
                Arc::clone(&key),
            )),
            store,
            key,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", post(routes::submit_sync))
        .route("/api/verify/:device", get(routes::verify))
        .route("/api/blocks/:device", get(routes::read_range))
        .route("/api/tail/:device", get(routes::tail))
        .route("/api/stats/:device", get(routes::stats))
        .route("/api/dashboard/:device", get(routes::dashboard))
        .route("/pubkey", get(routes::pubkey))
        .route("/health", get(routes::health))
        .route("/version", get(routes::version))
        .with_state(state)
}
