//! Merges device-submitted chain segments into the stored chain.
//!
//! A segment either extends the stored tail, replays blocks the server
//! already holds (possibly followed by new ones), or diverges. Divergence is
//! never resolved here: the stored chain stays authoritative and the segment
//! is rejected for manual review.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LedgerSettings;
use crate::error::{BlockFieldsError, ChainError, SyncError};
use crate::model::{Block, DeviceId, DeviceLedger, GENESIS_PREVIOUS_HASH};
use crate::store::LedgerStore;
use crate::validator::validate_segment;

/// What a sync did to the stored chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    /// Blocks appended by this sync.
    pub accepted_count: usize,
    /// Submitted blocks already stored and skipped.
    pub duplicate_count: usize,
    pub new_tail_index: Option<u64>,
    /// True when nothing new was submitted.
    pub pure_replay: bool,
}

pub struct SyncReconciler {
    store: Arc<LedgerStore>,
    settings: LedgerSettings,
}

/// Where a segment lands relative to the stored chain.
enum Placement {
    /// The first `overlap` blocks are already stored; the rest extends the tail.
    Overlapping { overlap: usize },
    Divergent { fork_index: u64 },
}

/// Locate `segment` against the stored chain and compare overlapping blocks.
fn place(ledger: &DeviceLedger, segment: &[Block]) -> Placement {
    let stored = &ledger.blocks;
    let first = &segment[0];

    // Number of stored blocks that precede the segment's first block.
    let start = if first.previous_hash == ledger.tail_hash() {
        Some(stored.len())
    } else if first.previous_hash == GENESIS_PREVIOUS_HASH {
        Some(0)
    } else {
        stored
            .iter()
            .position(|b| b.hash == first.previous_hash)
            .map(|p| p + 1)
    };
    let Some(start) = start else {
        return Placement::Divergent {
            fork_index: ledger.next_index(),
        };
    };
    if first.index != start as u64 {
        return Placement::Divergent {
            fork_index: start as u64,
        };
    }

    let overlap = segment.len().min(stored.len() - start);
    for (submitted, held) in segment.iter().zip(&stored[start..]).take(overlap) {
        if submitted.hash != held.hash {
            return Placement::Divergent {
                fork_index: held.index,
            };
        }
    }
    Placement::Overlapping { overlap }
}

impl SyncReconciler {
    pub fn new(store: Arc<LedgerStore>, settings: LedgerSettings) -> Self {
        Self { store, settings }
    }

    /// Validate `segment` and append whatever part of it is new.
    pub fn submit_sync(&self, device: &DeviceId, segment: &[Block]) -> Result<SyncOutcome, SyncError> {
        self.submit_sync_from(device, segment, None)
    }

    /// Like [`submit_sync`](Self::submit_sync), also recording the client
    /// version the device reported.
    pub fn submit_sync_from(
        &self,
        device: &DeviceId,
        segment: &[Block],
        app_version: Option<&str>,
    ) -> Result<SyncOutcome, SyncError> {
        if segment.len() > self.settings.max_segment_blocks {
            return Err(SyncError::SegmentTooLarge {
                len: segment.len(),
                max: self.settings.max_segment_blocks,
            });
        }
        if let Some(block) = segment
            .iter()
            .find(|b| !b.device_id.eq_ignore_ascii_case(device.as_str()))
        {
            return Err(SyncError::InvalidSegment(ChainError::InvalidBlockFields {
                index: block.index,
                source: BlockFieldsError::DeviceMismatch {
                    expected: device.to_string(),
                    found: block.device_id.clone(),
                },
            }));
        }
        validate_segment(segment, self.settings.difficulty)?;

        if segment.is_empty() {
            return Ok(SyncOutcome {
                accepted_count: 0,
                duplicate_count: 0,
                new_tail_index: self.store.tail(device).map(|b| b.index),
                pure_replay: true,
            });
        }

        self.store.transact(device, |txn| {
            let overlap = match place(txn.ledger(), segment) {
                Placement::Overlapping { overlap } => overlap,
                Placement::Divergent { fork_index } => {
                    warn!(
                        device = %device,
                        fork_index,
                        stored_tail = ?txn.ledger().tail().map(|b| b.index),
                        submitted_from = segment[0].index,
                        "device chain diverged from stored chain; segment rejected for review"
                    );
                    return Err(SyncError::DivergentChain {
                        device: device.clone(),
                        fork_index,
                    });
                }
            };

            let fresh = &segment[overlap..];
            let receipt = txn.append(fresh, app_version)?;
            if overlap > 0 {
                debug!(device = %device, duplicates = overlap, "skipped replayed blocks");
            }
            info!(
                device = %device,
                accepted = receipt.appended,
                duplicates = overlap,
                tail = ?receipt.tail_index,
                "sync accepted"
            );
            Ok(SyncOutcome {
                accepted_count: receipt.appended,
                duplicate_count: overlap,
                new_tail_index: receipt.tail_index,
                pure_replay: fresh.is_empty(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::model::BlockDraft;
    use crate::validator::validate_chain;
    use crate::test_support::{build_chain, device, event, extend_chain, TEST_DIFFICULTY};
    use tempfile::TempDir;

    fn reconciler(dir: &TempDir) -> (Arc<LedgerStore>, SyncReconciler) {
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        let settings = LedgerSettings {
            difficulty: TEST_DIFFICULTY,
            max_segment_blocks: 16,
        };
        (Arc::clone(&store), SyncReconciler::new(store, settings))
    }

    #[test]
    fn contiguous_segments_extend_the_chain() {
        let dir = TempDir::new().unwrap();
        let (store, sync) = reconciler(&dir);
        let id = device(1);
        let chain = build_chain(&id, 5);

        let first = sync.submit_sync(&id, &chain[..2]).unwrap();
        assert_eq!(
            first,
            SyncOutcome {
                accepted_count: 2,
                duplicate_count: 0,
                new_tail_index: Some(1),
                pure_replay: false
            }
        );
        let second = sync.submit_sync(&id, &chain[2..]).unwrap();
        assert_eq!(second.accepted_count, 3);
        assert_eq!(second.new_tail_index, Some(4));
        assert_eq!(store.read_range(&id, 0, 4).unwrap(), chain);
    }

    #[test]
    fn exact_replay_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, sync) = reconciler(&dir);
        let id = device(1);
        let chain = build_chain(&id, 3);
        sync.submit_sync(&id, &chain).unwrap();
        let before = store.snapshot(&id).unwrap();

        for segment in [&chain[..], &chain[1..], &chain[2..]] {
            let outcome = sync.submit_sync(&id, segment).unwrap();
            assert_eq!(outcome.accepted_count, 0);
            assert_eq!(outcome.duplicate_count, segment.len());
            assert_eq!(outcome.new_tail_index, Some(2));
            assert!(outcome.pure_replay);
        }
        assert_eq!(store.snapshot(&id).unwrap().blocks, before.blocks);
    }

    #[test]
    fn partial_replay_appends_only_the_new_suffix() {
        let dir = TempDir::new().unwrap();
        let (store, sync) = reconciler(&dir);
        let id = device(1);
        let mut chain = build_chain(&id, 3);
        sync.submit_sync(&id, &chain).unwrap();
        chain.extend(extend_chain(&chain[2], 2, "music"));

        let outcome = sync.submit_sync(&id, &chain[1..]).unwrap();
        assert_eq!(
            outcome,
            SyncOutcome {
                accepted_count: 2,
                duplicate_count: 2,
                new_tail_index: Some(4),
                pure_replay: false
            }
        );
        assert_eq!(store.snapshot(&id).unwrap().blocks, chain);
    }

    #[test]
    fn fork_at_genesis_is_divergent() {
        let dir = TempDir::new().unwrap();
        let (store, sync) = reconciler(&dir);
        let id = device(1);
        let chain = build_chain(&id, 2);
        sync.submit_sync(&id, &chain).unwrap();

        let forked = BlockDraft {
            index: 1,
            device_id: id.to_string(),
            event: event("other", "forged"),
            timestamp: 1,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
        }
        .seal(TEST_DIFFICULTY)
        .unwrap();

        let err = sync.submit_sync(&id, &[forked]).unwrap_err();
        assert!(matches!(err, SyncError::DivergentChain { fork_index: 0, .. }), "{err}");
        assert_eq!(store.tail(&id).map(|b| b.index), Some(1));
    }

    #[test]
    fn rewritten_history_is_divergent_and_leaves_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let (store, sync) = reconciler(&dir);
        let id = device(1);
        let chain = build_chain(&id, 3);
        sync.submit_sync(&id, &chain).unwrap();

        // Same genesis, different block 1 onwards: a restored stale backup.
        let mut rewritten = vec![chain[0].clone()];
        rewritten.extend(extend_chain(&chain[0], 3, "restored"));
        let err = sync.submit_sync(&id, &rewritten).unwrap_err();
        assert!(matches!(err, SyncError::DivergentChain { fork_index: 1, .. }), "{err}");

        // Unknown anchor anywhere in the chain.
        let stranger = build_chain(&device(2), 4);
        let mut foreign = extend_chain(&stranger[3], 1, "x");
        for b in &mut foreign {
            b.device_id = id.to_string();
        }
        let resealed: Vec<Block> = foreign
            .into_iter()
            .map(|b| {
                BlockDraft {
                    index: b.index,
                    device_id: b.device_id,
                    event: b.event,
                    timestamp: b.timestamp,
                    previous_hash: b.previous_hash,
                }
                .seal(TEST_DIFFICULTY)
                .unwrap()
            })
            .collect();
        let err = sync.submit_sync(&id, &resealed).unwrap_err();
        assert!(matches!(err, SyncError::DivergentChain { fork_index: 3, .. }), "{err}");

        assert_eq!(store.snapshot(&id).unwrap().blocks, chain);
    }

    #[test]
    fn internally_inconsistent_segment_is_invalid() {
        let dir = TempDir::new().unwrap();
        let (store, sync) = reconciler(&dir);
        let id = device(1);
        let mut chain = build_chain(&id, 3);
        chain[2].event.app_name = "edited".into();

        let err = sync.submit_sync(&id, &chain).unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidSegment(ChainError::HashMismatch { index: 2, .. })
        ));
        assert!(store.tail(&id).is_none());
    }

    #[test]
    fn blocks_for_another_device_are_invalid() {
        let dir = TempDir::new().unwrap();
        let (_, sync) = reconciler(&dir);
        let chain = build_chain(&device(2), 1);
        let err = sync.submit_sync(&device(1), &chain).unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidSegment(ChainError::InvalidBlockFields {
                source: BlockFieldsError::DeviceMismatch { .. },
                ..
            })
        ));
    }

    #[test]
    fn gap_after_tail_is_divergent() {
        let dir = TempDir::new().unwrap();
        let (_, sync) = reconciler(&dir);
        let id = device(1);
        let chain = build_chain(&id, 4);
        sync.submit_sync(&id, &chain[..2]).unwrap();

        // Anchored on the stored tail but skipping block 2.
        let skipping = BlockDraft {
            index: 3,
            ..BlockDraft::after(Some(&chain[1]), id.as_str(), event("a", "b"), 9)
        }
        .seal(TEST_DIFFICULTY)
        .unwrap();
        let err = sync.submit_sync(&id, &[skipping]).unwrap_err();
        assert!(matches!(err, SyncError::DivergentChain { fork_index: 2, .. }), "{err}");

        let err = sync.submit_sync(&id, &chain[3..]).unwrap_err();
        assert!(matches!(err, SyncError::DivergentChain { .. }), "{err}");
    }

    #[test]
    fn segment_running_past_the_last_index_is_invalid() {
        let dir = TempDir::new().unwrap();
        let (store, sync) = reconciler(&dir);
        let id = device(1);
        let last = BlockDraft {
            index: u64::MAX,
            ..BlockDraft::after(None, id.as_str(), event("browser", "casino"), 1)
        }
        .seal(TEST_DIFFICULTY)
        .unwrap();
        let wrapped = BlockDraft {
            index: 0,
            device_id: id.to_string(),
            event: event("browser", "poker"),
            timestamp: 2,
            previous_hash: last.hash.clone(),
        }
        .seal(TEST_DIFFICULTY)
        .unwrap();

        let err = sync.submit_sync(&id, &[last.clone(), wrapped]).unwrap_err();
        assert!(
            matches!(err, SyncError::InvalidSegment(ChainError::IndexOverflow { after: u64::MAX })),
            "{err}"
        );
        let err = sync.submit_sync(&id, &[last]).unwrap_err();
        assert!(matches!(err, SyncError::DivergentChain { fork_index: 0, .. }), "{err}");
        assert!(store.tail(&id).is_none());
    }

    #[test]
    fn device_key_case_does_not_split_ledgers() {
        let dir = TempDir::new().unwrap();
        let (store, sync) = reconciler(&dir);
        let upper = device(0xab).as_str().to_ascii_uppercase();
        let id = DeviceId::parse(&upper).unwrap();
        assert_eq!(id, device(0xab));

        let genesis = BlockDraft::after(None, &upper, event("browser", "casino"), 1)
            .seal(TEST_DIFFICULTY)
            .unwrap();
        sync.submit_sync(&id, &[genesis.clone()]).unwrap();
        let next = BlockDraft::after(Some(&genesis), id.as_str(), event("chat", "hi"), 2)
            .seal(TEST_DIFFICULTY)
            .unwrap();
        let outcome = sync.submit_sync(&device(0xab), &[next]).unwrap();
        assert_eq!(outcome.new_tail_index, Some(1));

        assert_eq!(store.devices(), vec![id.clone()]);
        let stored = store.snapshot(&id).unwrap();
        assert_eq!(validate_chain(&stored.blocks, TEST_DIFFICULTY), Ok(()));
    }

    #[test]
    fn reported_app_version_is_kept() {
        let dir = TempDir::new().unwrap();
        let (store, sync) = reconciler(&dir);
        let id = device(1);
        let chain = build_chain(&id, 2);

        sync.submit_sync_from(&id, &chain, Some("2.3.0")).unwrap();
        assert_eq!(store.snapshot(&id).unwrap().meta.app_version.as_deref(), Some("2.3.0"));

        let outcome = sync.submit_sync_from(&id, &chain, Some("2.4.0")).unwrap();
        assert!(outcome.pure_replay);
        assert_eq!(store.snapshot(&id).unwrap().meta.app_version.as_deref(), Some("2.4.0"));
    }

    #[test]
    fn oversized_and_empty_segments() {
        let dir = TempDir::new().unwrap();
        let (_, sync) = reconciler(&dir);
        let id = device(1);
        let chain = build_chain(&id, 17);
        assert!(matches!(
            sync.submit_sync(&id, &chain),
            Err(SyncError::SegmentTooLarge { len: 17, max: 16 })
        ));

        let outcome = sync.submit_sync(&id, &[]).unwrap();
        assert_eq!(outcome.new_tail_index, None);
        assert_eq!(outcome.accepted_count, 0);
    }

    #[test]
    fn store_errors_pass_through() {
        let err: SyncError = StoreError::DeviceNotFound(device(1)).into();
        assert_eq!(err.code(), "DEVICE_NOT_FOUND");
    }
}
