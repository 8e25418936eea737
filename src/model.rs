//! Data model for device activity blocks and the per-device ledger.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::DeviceIdError;

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Previous hash carried by every genesis block.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

const DEVICE_KEY_SEGMENTS: usize = 18;
const DEVICE_KEY_SEGMENT_LEN: usize = 8;

/// Identifier of a monitored device: 18 hyphen-separated segments of 8 hex
/// digits, kept in lowercase. The format is also what makes it safe to use as
/// a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, DeviceIdError> {
        let segments: Vec<&str> = raw.split('-').collect();
        if segments.len() != DEVICE_KEY_SEGMENTS {
            return Err(DeviceIdError::SegmentCount(segments.len()));
        }
        for (position, segment) in segments.iter().enumerate() {
            if segment.len() != DEVICE_KEY_SEGMENT_LEN
                || !segment.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(DeviceIdError::BadSegment {
                    position,
                    segment: (*segment).to_string(),
                });
            }
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// What the device observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Blocked-content attempt. Devices that predate the `kind` field only
    /// ever reported these.
    #[default]
    Violation,
    AppUsage,
    Search,
}

impl EventKind {
    /// Stable tag used in the canonical encoding.
    pub fn tag(self) -> u8 {
        match self {
            EventKind::Violation => 0,
            EventKind::AppUsage => 1,
            EventKind::Search => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFields {
    pub app_name: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub kind: EventKind,
}

/// One immutable, hash-linked record of a device event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// 0-indexed position in the device chain.
    pub index: u64,
    pub device_id: String,
    #[serde(flatten)]
    pub event: EventFields,
    /// Unix milliseconds from the device clock.
    pub timestamp: i64,
    /// Hex hash of the previous block, or [`GENESIS_PREVIOUS_HASH`].
    pub previous_hash: String,
    pub nonce: u64,
    /// Hex SHA-256 of the canonical encoding of every field above.
    pub hash: String,
}

/// Block fields before a nonce has been found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDraft {
    pub index: u64,
    pub device_id: String,
    pub event: EventFields,
    pub timestamp: i64,
    pub previous_hash: String,
}

impl BlockDraft {
    /// Draft for the block following `prev`, or a genesis draft when `prev` is `None`.
    pub fn after(prev: Option<&Block>, device_id: &str, event: EventFields, timestamp: i64) -> Self {
        let (index, previous_hash) = match prev {
            Some(b) => (b.index + 1, b.hash.clone()),
            None => (0, GENESIS_PREVIOUS_HASH.to_string()),
        };
        Self {
            index,
            device_id: device_id.to_string(),
            event,
            timestamp,
            previous_hash,
        }
    }
}

/// Sync bookkeeping persisted next to the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerMeta {
    pub last_synced_index: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_sync: Option<OffsetDateTime>,
    /// Client version reported by the most recent sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// The persisted chain of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLedger {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub meta: LedgerMeta,
    pub blocks: Vec<Block>,
}

impl DeviceLedger {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            meta: LedgerMeta::default(),
            blocks: Vec::new(),
        }
    }

    pub fn tail(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Hash the next block must link to.
    pub fn tail_hash(&self) -> &str {
        self.tail()
            .map(|b| b.hash.as_str())
            .unwrap_or(GENESIS_PREVIOUS_HASH)
    }

    pub fn next_index(&self) -> u64 {
        self.tail().map_or(0, |b| b.index.saturating_add(1))
    }

    pub fn len(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
