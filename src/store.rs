//! Per-device ledger store: append, read-range and tail.
//!
//! Each device has an append gate and a published snapshot. Appends to one
//! device hold its gate for the whole read-plan-persist-publish step, so two
//! appends can never validate against the same stale tail. Readers clone the
//! published `Arc` and see either the chain before an append or the chain
//! after it. Devices never contend with each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{Block, DeviceId, DeviceLedger};
use crate::storage;

struct DeviceSlot {
    gate: Mutex<()>,
    published: RwLock<Arc<DeviceLedger>>,
}

impl DeviceSlot {
    fn new(ledger: DeviceLedger) -> Self {
        Self {
            gate: Mutex::new(()),
            published: RwLock::new(Arc::new(ledger)),
        }
    }

    fn current(&self) -> Arc<DeviceLedger> {
        Arc::clone(&self.published.read())
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    pub appended: usize,
    pub tail_index: Option<u64>,
}

pub struct LedgerStore {
    dir: PathBuf,
    devices: RwLock<HashMap<DeviceId, Arc<DeviceSlot>>>,
}

impl LedgerStore {
    /// Open the store under `data_dir`, loading every persisted ledger.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = storage::ledgers_dir(data_dir);
        let ledgers = storage::load_ledgers(&dir)?;
        let total_blocks: u64 = ledgers.iter().map(DeviceLedger::len).sum();
        info!(
            dir = %dir.display(),
            devices = ledgers.len(),
            blocks = total_blocks,
            "ledger store opened"
        );
        let devices = ledgers
            .into_iter()
            .map(|l| (l.device_id.clone(), Arc::new(DeviceSlot::new(l))))
            .collect();
        Ok(Self {
            dir,
            devices: RwLock::new(devices),
        })
    }

    fn slot(&self, device: &DeviceId) -> Option<Arc<DeviceSlot>> {
        self.devices.read().get(device).cloned()
    }

    fn slot_or_create(&self, device: &DeviceId) -> Arc<DeviceSlot> {
        if let Some(slot) = self.slot(device) {
            return slot;
        }
        let mut devices = self.devices.write();
        Arc::clone(
            devices
                .entry(device.clone())
                .or_insert_with(|| Arc::new(DeviceSlot::new(DeviceLedger::new(device.clone())))),
        )
    }

    /// Ids of every device with at least one stored block.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .devices
            .read()
            .iter()
            .filter(|(_, slot)| !slot.published.read().is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Consistent view of the device's full chain and metadata.
    pub fn snapshot(&self, device: &DeviceId) -> Result<Arc<DeviceLedger>, StoreError> {
        self.slot(device)
            .map(|slot| slot.current())
            .filter(|ledger| !ledger.is_empty())
            .ok_or_else(|| StoreError::DeviceNotFound(device.clone()))
    }

    /// Most recent block, or `None` if the device never synced.
    pub fn tail(&self, device: &DeviceId) -> Option<Block> {
        self.slot(device)
            .and_then(|slot| slot.current().tail().cloned())
    }

    /// Blocks `from..=to`.
    pub fn read_range(&self, device: &DeviceId, from: u64, to: u64) -> Result<Vec<Block>, StoreError> {
        let ledger = self.snapshot(device)?;
        let len = ledger.len();
        if from > to || to >= len {
            return Err(StoreError::RangeOutOfBounds { from, to, len });
        }
        Ok(ledger.blocks[from as usize..=to as usize].to_vec())
    }

    /// Append blocks that must attach to the current tail.
    ///
    /// Only attachment is checked here; the blocks themselves are expected to
    /// have passed the chain validator already.
    pub fn append(&self, device: &DeviceId, blocks: &[Block]) -> Result<AppendReceipt, StoreError> {
        self.transact(device, |txn| txn.append(blocks, None))
    }

    /// Run `f` while holding the device's append gate.
    ///
    /// `f` sees the chain as of gate acquisition and any append it makes
    /// through the transaction is the only write to this device until it
    /// returns.
    pub fn transact<T, E>(
        &self,
        device: &DeviceId,
        f: impl FnOnce(&mut AppendTxn<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let slot = self.slot_or_create(device);
        let _gate = slot.gate.lock();
        let mut txn = AppendTxn {
            dir: &self.dir,
            current: slot.current(),
            slot: slot.as_ref(),
        };
        let result = f(&mut txn);
        if txn.current.is_empty() {
            self.discard_if_unused(device, &slot);
        }
        result
    }

    /// Drop a slot that never received a block, unless another caller holds it.
    ///
    /// Must be called with the slot's gate held. Nothing waits on a gate while
    /// holding the map lock.
    fn discard_if_unused(&self, device: &DeviceId, slot: &Arc<DeviceSlot>) {
        let mut devices = self.devices.write();
        let ours = devices.get(device).is_some_and(|s| Arc::ptr_eq(s, slot));
        // One reference in the map, one held by the caller.
        if ours && Arc::strong_count(slot) == 2 {
            devices.remove(device);
        }
    }
}

/// Exclusive append access to one device's ledger.
pub struct AppendTxn<'a> {
    dir: &'a Path,
    slot: &'a DeviceSlot,
    current: Arc<DeviceLedger>,
}

impl AppendTxn<'_> {
    pub fn ledger(&self) -> &DeviceLedger {
        &self.current
    }

    /// Persist and publish `blocks` after the current tail.
    ///
    /// `app_version` is the client version reported with the sync. A changed
    /// version is recorded even when there are no new blocks.
    pub fn append(
        &mut self,
        blocks: &[Block],
        app_version: Option<&str>,
    ) -> Result<AppendReceipt, StoreError> {
        let version_changed = !self.current.is_empty()
            && app_version.is_some_and(|v| self.current.meta.app_version.as_deref() != Some(v));

        let Some(first) = blocks.first() else {
            if version_changed {
                let mut next = DeviceLedger::clone(&self.current);
                next.meta.app_version = app_version.map(str::to_string);
                self.publish(next)?;
            }
            return Ok(AppendReceipt {
                appended: 0,
                tail_index: self.current.tail().map(|b| b.index),
            });
        };

        let expected_index = self.current.next_index();
        let expected_previous_hash = self.current.tail_hash();
        if first.index != expected_index || first.previous_hash != expected_previous_hash {
            return Err(StoreError::NonContiguousAppend {
                expected_index,
                expected_previous_hash: expected_previous_hash.to_string(),
                found_index: first.index,
                found_previous_hash: first.previous_hash.clone(),
            });
        }

        let mut next = DeviceLedger::clone(&self.current);
        next.blocks.extend_from_slice(blocks);
        next.meta.last_synced_index = next.tail().map(|b| b.index);
        next.meta.last_sync = Some(OffsetDateTime::now_utc());
        if let Some(version) = app_version {
            next.meta.app_version = Some(version.to_string());
        }
        self.publish(next)?;

        debug!(
            device = %self.current.device_id,
            appended = blocks.len(),
            tail = ?self.current.meta.last_synced_index,
            "ledger extended"
        );
        Ok(AppendReceipt {
            appended: blocks.len(),
            tail_index: self.current.meta.last_synced_index,
        })
    }

    fn publish(&mut self, next: DeviceLedger) -> Result<(), StoreError> {
        storage::save_ledger(self.dir, &next)?;
        let next = Arc::new(next);
        *self.slot.published.write() = Arc::clone(&next);
        self.current = next;
        Ok(())
    }
}
