//! Disk persistence for device ledgers (one JSON file per device).

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::model::{DeviceId, DeviceLedger};

/// Ensure that the given directory exists (create recursively if needed).
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Directory holding the ledger files under the data dir.
pub fn ledgers_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("ledgers")
}

/// Ledger file for a device. Device ids are hex and hyphens only.
pub fn ledger_path(dir: &Path, device: &DeviceId) -> PathBuf {
    dir.join(format!("{device}.json"))
}

/// Replace the device's ledger file.
///
/// The new content goes to a temporary file that is synced and renamed over
/// the old one, so readers of the file never see a half-written chain.
pub fn save_ledger(dir: &Path, ledger: &DeviceLedger) -> Result<(), StoreError> {
    ensure_dir(dir)?;
    let path = ledger_path(dir, &ledger.device_id);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(ledger).map_err(StoreError::Encode)?;
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Load every `*.json` ledger in the directory.
///
/// A file that fails to parse is an error: skipping it would make the device
/// look new and let a fresh genesis replace its history.
pub fn load_ledgers(dir: &Path) -> Result<Vec<DeviceLedger>, StoreError> {
    ensure_dir(dir)?;
    let mut out = vec![];
    for entry in fs::read_dir(dir)? {
        let p = entry?.path();
        if p.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let mut buf = String::new();
        File::open(&p)?.read_to_string(&mut buf)?;
        let ledger = serde_json::from_str::<DeviceLedger>(&buf)
            .map_err(|source| StoreError::Corrupt {
                path: p.clone(),
                source,
            })?;
        out.push(ledger);
    }
    out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    Ok(out)
}
