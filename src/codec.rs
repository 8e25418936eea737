//! Canonical block encoding, content hashing and the difficulty predicate.
//!
//! The encoding is, in order: the domain tag, `index` (u64 LE), `deviceId`,
//! the event kind tag (u8), `appName`, `keyword`, `timestamp` (i64 LE),
//! `previousHash`, `nonce` (u64 LE). Strings are UTF-8 prefixed with their
//! byte length as u32 LE. Changing any of this invalidates every stored hash.

use sha2::{Digest, Sha256};

use crate::error::BlockFieldsError;
use crate::model::{Block, BlockDraft, EventFields, HASH_HEX_LEN};

const DOMAIN_TAG: &[u8] = b"device-ledger/block/v1";

/// Highest meaningful difficulty: every hex digit of the hash is zero.
pub const MAX_DIFFICULTY: u8 = HASH_HEX_LEN as u8;

/// True if `s` is a lowercase hex SHA-256 digest.
pub fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Check the fields that feed the hash. Runs before any hashing.
pub fn check_fields(
    device_id: &str,
    event: &EventFields,
    timestamp: i64,
    previous_hash: &str,
) -> Result<(), BlockFieldsError> {
    if device_id.is_empty() {
        return Err(BlockFieldsError::EmptyDeviceId);
    }
    if timestamp < 0 {
        return Err(BlockFieldsError::NegativeTimestamp(timestamp));
    }
    // The genesis sentinel is itself 64 zero digits.
    if !is_hash_hex(previous_hash) {
        return Err(BlockFieldsError::MalformedPreviousHash(previous_hash.to_string()));
    }
    for (field, value) in [
        ("deviceId", device_id),
        ("appName", event.app_name.as_str()),
        ("keyword", event.keyword.as_str()),
    ] {
        if u32::try_from(value.len()).is_err() {
            return Err(BlockFieldsError::FieldTooLong {
                field,
                len: value.len(),
            });
        }
    }
    Ok(())
}

fn update_str(hasher: &mut Sha256, value: &str) {
    // Length fits: check_fields ran first.
    hasher.update((value.len() as u32).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// Hasher primed with every field except the nonce.
fn prefix_hasher(
    index: u64,
    device_id: &str,
    event: &EventFields,
    timestamp: i64,
    previous_hash: &str,
) -> Result<Sha256, BlockFieldsError> {
    check_fields(device_id, event, timestamp, previous_hash)?;
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update(index.to_le_bytes());
    update_str(&mut hasher, device_id);
    hasher.update([event.kind.tag()]);
    update_str(&mut hasher, &event.app_name);
    update_str(&mut hasher, &event.keyword);
    hasher.update(timestamp.to_le_bytes());
    update_str(&mut hasher, previous_hash);
    Ok(hasher)
}

fn finish(mut hasher: Sha256, nonce: u64) -> String {
    hasher.update(nonce.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute a block's content hash, ignoring its stored `hash` field.
pub fn compute_hash(block: &Block) -> Result<String, BlockFieldsError> {
    let hasher = prefix_hasher(
        block.index,
        &block.device_id,
        &block.event,
        block.timestamp,
        &block.previous_hash,
    )?;
    Ok(finish(hasher, block.nonce))
}

/// True if the hex hash starts with `difficulty` zero digits.
pub fn satisfies_difficulty(hash: &str, difficulty: u8) -> bool {
    let difficulty = usize::from(difficulty);
    hash.len() >= difficulty && hash.as_bytes()[..difficulty].iter().all(|b| *b == b'0')
}

impl BlockDraft {
    /// Search nonces from zero until the hash meets `difficulty`.
    ///
    /// This is what a device does before submitting; the server only verifies.
    pub fn seal(self, difficulty: u8) -> Result<Block, BlockFieldsError> {
        let difficulty = difficulty.min(MAX_DIFFICULTY);
        let prefix = prefix_hasher(
            self.index,
            &self.device_id,
            &self.event,
            self.timestamp,
            &self.previous_hash,
        )?;
        let mut nonce = 0u64;
        let hash = loop {
            let candidate = finish(prefix.clone(), nonce);
            if satisfies_difficulty(&candidate, difficulty) {
                break candidate;
            }
            nonce += 1;
        };
        Ok(Block {
            index: self.index,
            device_id: self.device_id,
            event: self.event,
            timestamp: self.timestamp,
            previous_hash: self.previous_hash,
            nonce,
            hash,
        })
    }
}
