use crate::model::{Block, BlockDraft, DeviceId, EventFields};

/// Cheap enough to seal hundreds of blocks per test.
pub(crate) const TEST_DIFFICULTY: u8 = 2;

const BASE_MS: i64 = 1_700_000_000_000;

pub(crate) fn device(seed: u8) -> DeviceId {
    let raw = (0..18)
        .map(|i| format!("{seed:02x}{i:06x}"))
        .collect::<Vec<_>>()
        .join("-");
    DeviceId::parse(&raw).unwrap()
}

pub(crate) fn event(app: &str, keyword: &str) -> EventFields {
    EventFields {
        app_name: app.to_string(),
        keyword: keyword.to_string(),
        kind: Default::default(),
    }
}

/// Valid chain of `n` blocks starting at genesis.
pub(crate) fn build_chain(device: &DeviceId, n: usize) -> Vec<Block> {
    const KEYWORDS: [&str; 3] = ["casino", "poker", "vpn"];
    let mut out: Vec<Block> = Vec::with_capacity(n);
    for i in 0..n {
        let block = BlockDraft::after(
            out.last(),
            device.as_str(),
            event("browser", KEYWORDS[i % KEYWORDS.len()]),
            BASE_MS + i as i64 * 60_000,
        )
        .seal(TEST_DIFFICULTY)
        .unwrap();
        out.push(block);
    }
    out
}

/// `n` blocks following `prev`, all reporting `app`.
pub(crate) fn extend_chain(prev: &Block, n: usize, app: &str) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::with_capacity(n);
    for i in 0..n {
        let block = BlockDraft::after(
            Some(out.last().unwrap_or(prev)),
            &prev.device_id,
            event(app, &format!("{app}-{i}")),
            prev.timestamp + (i as i64 + 1) * 1_000,
        )
        .seal(TEST_DIFFICULTY)
        .unwrap();
        out.push(block);
    }
    out
}
