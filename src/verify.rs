//! On-demand whole-chain integrity checks and dashboard views.

use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::crypto::{verify_hex, ServerKey};
use crate::error::{ChainError, StoreError};
use crate::model::{DeviceId, GENESIS_PREVIOUS_HASH};
use crate::stats::{summarize, timeline, LedgerStats, TimelineEntry};
use crate::store::LedgerStore;
use crate::validator::audit_chain;

const ATTESTATION_DOMAIN: &[u8] = b"device-ledger/attestation/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    pub index: u64,
    pub code: &'static str,
    pub message: String,
}

impl From<&ChainError> for Fault {
    fn from(err: &ChainError) -> Self {
        Self {
            index: err.index(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Server signature over the report's headline numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    /// Hex SHA-256 of the attested statement; this is what is signed.
    pub statement_hash: String,
    pub signature_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub device_id: DeviceId,
    pub valid: bool,
    /// First chain position that failed validation.
    pub broken_at_index: Option<u64>,
    /// End of the valid prefix.
    pub last_good_index: Option<u64>,
    pub block_count: u64,
    /// Stored hash of the last block.
    pub tail_hash: String,
    pub faults: Vec<Fault>,
    pub last_synced_index: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub verified_at: OffsetDateTime,
    pub attestation: Attestation,
}

/// Events plus integrity flag, as the dashboard renders them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub device_id: DeviceId,
    pub events: Vec<TimelineEntry>,
    pub total_events: u64,
    pub integrity_valid: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
    pub app_version: Option<String>,
}

/// Summary statistics with the integrity flag they were computed under.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    pub device_id: DeviceId,
    pub integrity_valid: bool,
    #[serde(flatten)]
    pub stats: LedgerStats,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
}

/// Hash of `(deviceId, blockCount, tailHash, valid)` under the attestation domain.
pub fn attestation_statement(device: &DeviceId, block_count: u64, tail_hash: &str, valid: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ATTESTATION_DOMAIN);
    hasher.update((device.as_str().len() as u32).to_le_bytes());
    hasher.update(device.as_str().as_bytes());
    hasher.update(block_count.to_le_bytes());
    hasher.update((tail_hash.len() as u32).to_le_bytes());
    hasher.update(tail_hash.as_bytes());
    hasher.update([u8::from(valid)]);
    hex::encode(hasher.finalize())
}

/// Check a report's attestation against the server's public key.
///
/// The statement is rebuilt from the report fields, so editing any attested
/// field invalidates the signature.
pub fn check_attestation(public: &ed25519_dalek::VerifyingKey, report: &VerificationReport) -> bool {
    let statement = attestation_statement(
        &report.device_id,
        report.block_count,
        &report.tail_hash,
        report.valid,
    );
    statement == report.attestation.statement_hash
        && verify_hex(public, statement.as_bytes(), &report.attestation.signature_hex)
}

pub struct VerificationService {
    store: Arc<LedgerStore>,
    difficulty: u8,
    key: Arc<ServerKey>,
}

impl VerificationService {
    pub fn new(store: Arc<LedgerStore>, difficulty: u8, key: Arc<ServerKey>) -> Self {
        Self {
            store,
            difficulty,
            key,
        }
    }

    /// Re-walk the full stored chain and report its health.
    ///
    /// Runs against a snapshot, so an append racing with this call is either
    /// entirely visible or not at all.
    pub fn verify(&self, device: &DeviceId) -> Result<VerificationReport, StoreError> {
        let ledger = self.store.snapshot(device)?;
        let faults = audit_chain(&ledger.blocks, self.difficulty);

        let block_count = ledger.len();
        let broken_at_index = faults.first().map(ChainError::index);
        let last_good_index = match broken_at_index {
            Some(broken) => broken.checked_sub(1),
            None => block_count.checked_sub(1),
        };
        let valid = faults.is_empty();
        let tail_hash = ledger
            .tail()
            .map_or_else(|| GENESIS_PREVIOUS_HASH.to_string(), |b| b.hash.clone());

        let statement_hash = attestation_statement(device, block_count, &tail_hash, valid);
        let signature_hex = hex::encode(self.key.sign(statement_hash.as_bytes()).to_bytes());

        if valid {
            debug!(device = %device, blocks = block_count, "chain verified");
        } else {
            warn!(
                device = %device,
                blocks = block_count,
                broken_at = ?broken_at_index,
                faults = faults.len(),
                "stored chain failed verification"
            );
        }

        Ok(VerificationReport {
            device_id: device.clone(),
            valid,
            broken_at_index,
            last_good_index,
            block_count,
            tail_hash,
            faults: faults.iter().map(Fault::from).collect(),
            last_synced_index: ledger.meta.last_synced_index,
            last_sync: ledger.meta.last_sync,
            verified_at: OffsetDateTime::now_utc(),
            attestation: Attestation {
                statement_hash,
                signature_hex,
            },
        })
    }

    pub fn stats(&self, device: &DeviceId) -> Result<StatsView, StoreError> {
        let ledger = self.store.snapshot(device)?;
        Ok(StatsView {
            device_id: device.clone(),
            integrity_valid: audit_chain(&ledger.blocks, self.difficulty).is_empty(),
            stats: summarize(&ledger.blocks),
            last_sync: ledger.meta.last_sync,
        })
    }

    pub fn dashboard(&self, device: &DeviceId) -> Result<DashboardView, StoreError> {
        let ledger = self.store.snapshot(device)?;
        Ok(DashboardView {
            device_id: device.clone(),
            events: timeline(&ledger.blocks),
            total_events: ledger.len(),
            integrity_valid: audit_chain(&ledger.blocks, self.difficulty).is_empty(),
            last_sync: ledger.meta.last_sync,
            app_version: ledger.meta.app_version.clone(),
        })
    }
}
