//! Error types for the block codec, chain validator, ledger store and sync reconciler.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::DeviceId;

/// A device key that is not 18 hyphen-separated segments of 8 hex digits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdError {
    #[error("device key must have 18 segments separated by hyphens, found {0}")]
    SegmentCount(usize),

    #[error("device key segment {position} ({segment:?}) is not 8 hex digits")]
    BadSegment { position: usize, segment: String },
}

/// Block fields that cannot be hashed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockFieldsError {
    #[error("device id is empty")]
    EmptyDeviceId,

    #[error("timestamp {0} is negative")]
    NegativeTimestamp(i64),

    #[error("previous hash {0:?} is not 64 lowercase hex characters")]
    MalformedPreviousHash(String),

    #[error("field {field} is {len} bytes long")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("block belongs to device {found}, expected {expected}")]
    DeviceMismatch { expected: String, found: String },
}

/// Structural faults found while walking a block sequence.
///
/// `index` is always the chain position the fault was detected at, which
/// equals the block's own index for every well-formed chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block {index} has invalid fields: {source}")]
    InvalidBlockFields {
        index: u64,
        #[source]
        source: BlockFieldsError,
    },

    #[error("block {index} is not a valid genesis block (previous hash {previous_hash:?})")]
    BrokenGenesis { index: u64, previous_hash: String },

    #[error("index gap: expected block {expected}, found {found}")]
    IndexGap { expected: u64, found: u64 },

    #[error("no block index follows {after}")]
    IndexOverflow { after: u64 },

    #[error("block {index} does not link to its predecessor (expected previous hash {expected}, found {found})")]
    ChainBroken {
        index: u64,
        expected: String,
        found: String,
    },

    #[error("block {index} hash mismatch (recomputed {expected}, stored {found})")]
    HashMismatch {
        index: u64,
        expected: String,
        found: String,
    },

    #[error("block {index} hash does not meet difficulty {difficulty}")]
    DifficultyNotMet { index: u64, difficulty: u8 },
}

impl ChainError {
    /// Chain position of the faulty block.
    pub fn index(&self) -> u64 {
        match self {
            ChainError::InvalidBlockFields { index, .. }
            | ChainError::BrokenGenesis { index, .. }
            | ChainError::ChainBroken { index, .. }
            | ChainError::HashMismatch { index, .. }
            | ChainError::DifficultyNotMet { index, .. } => *index,
            ChainError::IndexGap { expected, .. } => *expected,
            ChainError::IndexOverflow { after } => *after,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChainError::InvalidBlockFields { .. } => "INVALID_BLOCK_FIELDS",
            ChainError::BrokenGenesis { .. } => "BROKEN_GENESIS",
            ChainError::IndexGap { .. } => "INDEX_GAP",
            ChainError::IndexOverflow { .. } => "INDEX_OVERFLOW",
            ChainError::ChainBroken { .. } => "CHAIN_BROKEN",
            ChainError::HashMismatch { .. } => "HASH_MISMATCH",
            ChainError::DifficultyNotMet { .. } => "DIFFICULTY_NOT_MET",
        }
    }
}

/// Ledger store failures. Everything except `Io`, `Corrupt` and `Encode` is
/// a caller mistake rather than an integrity problem.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no ledger exists for device {0}")]
    DeviceNotFound(DeviceId),

    #[error("range {from}..={to} is out of bounds for a chain of {len} block(s)")]
    RangeOutOfBounds { from: u64, to: u64, len: u64 },

    #[error(
        "segment does not attach to the tail: expected index {expected_index} after {expected_previous_hash}, \
         found index {found_index} after {found_previous_hash}"
    )]
    NonContiguousAppend {
        expected_index: u64,
        expected_previous_hash: String,
        found_index: u64,
        found_previous_hash: String,
    },

    #[error("ledger file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode ledger: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            StoreError::RangeOutOfBounds { .. } => "RANGE_OUT_OF_BOUNDS",
            StoreError::NonContiguousAppend { .. } => "NON_CONTIGUOUS_APPEND",
            StoreError::Corrupt { .. } => "LEDGER_CORRUPT",
            StoreError::Encode(_) => "LEDGER_ENCODE",
            StoreError::Io(_) => "LEDGER_IO",
        }
    }
}

/// Reasons a submitted segment was not accepted.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("segment rejected: {0}")]
    InvalidSegment(#[from] ChainError),

    #[error("segment of {len} block(s) exceeds the limit of {max}")]
    SegmentTooLarge { len: usize, max: usize },

    /// The device's chain has forked from the stored one. Needs manual review.
    #[error("device {device} diverged from the stored chain at index {fork_index}")]
    DivergentChain { device: DeviceId, fork_index: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::InvalidSegment(inner) => inner.code(),
            SyncError::SegmentTooLarge { .. } => "SEGMENT_TOO_LARGE",
            SyncError::DivergentChain { .. } => "DIVERGENT_CHAIN",
            SyncError::Store(inner) => inner.code(),
        }
    }
}
