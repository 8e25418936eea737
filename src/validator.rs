//! Pure validation of block sequences. Never touches storage.

use crate::codec::{check_fields, compute_hash, satisfies_difficulty};
use crate::error::{BlockFieldsError, ChainError};
use crate::model::{Block, GENESIS_PREVIOUS_HASH};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// The first block must be genesis.
    Genesis,
    /// The first block may start anywhere; its predecessor is checked by the caller.
    Detached,
}

/// Front-to-back walk yielding the first fault of every faulty block.
struct Walk<'a> {
    blocks: &'a [Block],
    difficulty: u8,
    origin: Origin,
    pos: usize,
    /// Recomputed hash of the previous block (stored hash if it could not be recomputed).
    prev_hash: Option<String>,
    /// Index the previous block carried, whether or not it was the expected one.
    prev_index: Option<u64>,
}

impl<'a> Walk<'a> {
    fn new(blocks: &'a [Block], difficulty: u8, origin: Origin) -> Self {
        Self {
            blocks,
            difficulty,
            origin,
            pos: 0,
            prev_hash: None,
            prev_index: None,
        }
    }

    /// Index `block` should carry. After a gap this follows the block
    /// actually seen, so one missing block is reported once.
    fn expected_index(&self, block: &Block) -> Result<u64, ChainError> {
        match (self.prev_index, self.origin) {
            (Some(prev), _) => prev
                .checked_add(1)
                .ok_or(ChainError::IndexOverflow { after: prev }),
            (None, Origin::Genesis) => Ok(0),
            (None, Origin::Detached) => Ok(block.index),
        }
    }

    fn check(&self, block: &Block, recomputed: Option<&str>) -> Result<(), ChainError> {
        let index = self.expected_index(block)?;
        let invalid = |source| ChainError::InvalidBlockFields { index, source };

        check_fields(
            &block.device_id,
            &block.event,
            block.timestamp,
            &block.previous_hash,
        )
        .map_err(invalid)?;
        if let Some(first) = self.blocks.first() {
            if !block.device_id.eq_ignore_ascii_case(&first.device_id) {
                return Err(invalid(BlockFieldsError::DeviceMismatch {
                    expected: first.device_id.clone(),
                    found: block.device_id.clone(),
                }));
            }
        }

        match &self.prev_hash {
            None => {
                let must_be_genesis = self.origin == Origin::Genesis || block.index == 0;
                if must_be_genesis
                    && (block.index != 0 || block.previous_hash != GENESIS_PREVIOUS_HASH)
                {
                    return Err(ChainError::BrokenGenesis {
                        index,
                        previous_hash: block.previous_hash.clone(),
                    });
                }
            }
            Some(prev_hash) => {
                if block.index != index {
                    return Err(ChainError::IndexGap {
                        expected: index,
                        found: block.index,
                    });
                }
                if block.previous_hash != *prev_hash {
                    return Err(ChainError::ChainBroken {
                        index,
                        expected: prev_hash.clone(),
                        found: block.previous_hash.clone(),
                    });
                }
            }
        }

        // Fields were checked above, so the hash is always recomputable here.
        let recomputed = recomputed.unwrap_or_default();
        if recomputed != block.hash {
            return Err(ChainError::HashMismatch {
                index,
                expected: recomputed.to_string(),
                found: block.hash.clone(),
            });
        }
        if !satisfies_difficulty(&block.hash, self.difficulty) {
            return Err(ChainError::DifficultyNotMet {
                index,
                difficulty: self.difficulty,
            });
        }
        Ok(())
    }
}

impl Iterator for Walk<'_> {
    type Item = ChainError;

    fn next(&mut self) -> Option<ChainError> {
        while let Some(block) = self.blocks.get(self.pos) {
            let recomputed = compute_hash(block).ok();
            let result = self.check(block, recomputed.as_deref());
            self.prev_hash = Some(recomputed.unwrap_or_else(|| block.hash.clone()));
            self.prev_index = Some(block.index);
            self.pos += 1;
            if let Err(err) = result {
                return Some(err);
            }
        }
        None
    }
}

/// Validate a whole chain starting at genesis. An empty chain is valid.
pub fn validate_chain(blocks: &[Block], difficulty: u8) -> Result<(), ChainError> {
    match Walk::new(blocks, difficulty, Origin::Genesis).next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Validate a segment in isolation. Its first block may start past genesis.
pub fn validate_segment(blocks: &[Block], difficulty: u8) -> Result<(), ChainError> {
    match Walk::new(blocks, difficulty, Origin::Detached).next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Walk the whole chain without halting and collect one fault per faulty block.
pub fn audit_chain(blocks: &[Block], difficulty: u8) -> Vec<ChainError> {
    Walk::new(blocks, difficulty, Origin::Genesis).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockDraft;
    use crate::test_support::{build_chain, device, event, TEST_DIFFICULTY};

    #[test]
    fn empty_chain_is_valid() {
        assert_eq!(validate_chain(&[], TEST_DIFFICULTY), Ok(()));
        assert!(audit_chain(&[], TEST_DIFFICULTY).is_empty());
    }

    #[test]
    fn sealed_chain_is_valid() {
        let chain = build_chain(&device(1), 6);
        assert_eq!(validate_chain(&chain, TEST_DIFFICULTY), Ok(()));
        assert_eq!(validate_segment(&chain[2..], TEST_DIFFICULTY), Ok(()));
    }

    #[test]
    fn payload_tamper_fails_at_that_index() {
        let chain = build_chain(&device(1), 5);
        for i in 0..chain.len() {
            let mut tampered = chain.clone();
            tampered[i].event.app_name.push('!');
            let err = validate_chain(&tampered, TEST_DIFFICULTY).unwrap_err();
            assert_eq!(err.index(), i as u64, "{err}");
            assert!(matches!(err, ChainError::HashMismatch { .. }));
        }
    }

    #[test]
    fn rehashed_tamper_breaks_the_next_link() {
        let mut chain = build_chain(&device(1), 4);
        let resealed = BlockDraft {
            index: 1,
            device_id: chain[1].device_id.clone(),
            event: event("other", "forged"),
            timestamp: chain[1].timestamp,
            previous_hash: chain[1].previous_hash.clone(),
        }
        .seal(TEST_DIFFICULTY)
        .unwrap();
        chain[1] = resealed;

        let err = validate_chain(&chain, TEST_DIFFICULTY).unwrap_err();
        assert!(matches!(err, ChainError::ChainBroken { index: 2, .. }), "{err}");
    }

    #[test]
    fn genesis_must_use_sentinel() {
        let chain = build_chain(&device(1), 3);
        assert!(matches!(
            validate_chain(&chain[1..], TEST_DIFFICULTY),
            Err(ChainError::BrokenGenesis { index: 0, .. })
        ));

        let mut chain = build_chain(&device(1), 1);
        chain[0].previous_hash = "a".repeat(64);
        assert!(matches!(
            validate_chain(&chain, TEST_DIFFICULTY),
            Err(ChainError::BrokenGenesis { index: 0, .. })
        ));
    }

    #[test]
    fn missing_block_is_an_index_gap() {
        let mut chain = build_chain(&device(1), 4);
        chain.remove(2);
        assert_eq!(
            validate_chain(&chain, TEST_DIFFICULTY),
            Err(ChainError::IndexGap {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn audit_reports_a_missing_block_once() {
        let mut chain = build_chain(&device(1), 5);
        chain.remove(2);
        let faults = audit_chain(&chain, TEST_DIFFICULTY);
        // Block 3 links to block 2, which is gone; block 4 links to 3 as it should.
        assert_eq!(
            faults,
            vec![ChainError::IndexGap {
                expected: 2,
                found: 3
            }]
        );
    }

    #[test]
    fn segment_past_the_last_index_is_rejected() {
        let id = device(1);
        let last = BlockDraft {
            index: u64::MAX,
            ..BlockDraft::after(None, id.as_str(), event("a", "b"), 1)
        }
        .seal(TEST_DIFFICULTY)
        .unwrap();
        let wrapped = BlockDraft {
            index: 0,
            device_id: id.to_string(),
            event: event("a", "c"),
            timestamp: 2,
            previous_hash: last.hash.clone(),
        }
        .seal(TEST_DIFFICULTY)
        .unwrap();

        assert_eq!(validate_segment(&[last.clone()], TEST_DIFFICULTY), Ok(()));
        assert_eq!(
            validate_segment(&[last, wrapped], TEST_DIFFICULTY),
            Err(ChainError::IndexOverflow { after: u64::MAX })
        );
    }

    #[test]
    fn difficulty_is_enforced() {
        let chain = build_chain(&device(1), 2);
        let strict = TEST_DIFFICULTY + 8;
        assert!(matches!(
            validate_chain(&chain, strict),
            Err(ChainError::DifficultyNotMet { index: 0, .. })
        ));
    }

    #[test]
    fn foreign_device_block_is_rejected() {
        let mut chain = build_chain(&device(1), 2);
        let foreign = BlockDraft::after(Some(&chain[1]), device(2).as_str(), event("a", "b"), 5)
            .seal(TEST_DIFFICULTY)
            .unwrap();
        chain.push(foreign);
        assert!(matches!(
            validate_chain(&chain, TEST_DIFFICULTY),
            Err(ChainError::InvalidBlockFields {
                index: 2,
                source: BlockFieldsError::DeviceMismatch { .. }
            })
        ));
    }

    #[test]
    fn detached_segment_at_index_zero_is_still_genesis() {
        let mut chain = build_chain(&device(1), 2);
        chain[0].previous_hash = "b".repeat(64);
        assert!(matches!(
            validate_segment(&chain, TEST_DIFFICULTY),
            Err(ChainError::BrokenGenesis { .. })
        ));
    }

    #[test]
    fn audit_reports_every_faulty_block() {
        let mut chain = build_chain(&device(1), 6);
        chain[1].event.keyword.push('x');
        chain[4].nonce += 1;
        let faults = audit_chain(&chain, TEST_DIFFICULTY);
        let indices: Vec<u64> = faults.iter().map(ChainError::index).collect();
        // Each tampered block fails its own hash and breaks the link after it.
        assert_eq!(indices, vec![1, 2, 4, 5]);
    }
}
