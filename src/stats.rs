//! Read-only summaries over stored blocks for dashboards and analytics readers.
//!
//! Everything here takes a block slice and returns derived data; nothing in
//! this module can reach the store's append path.

use std::collections::BTreeMap;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::model::{Block, EventKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub total_events: u64,
    pub kind_breakdown: BTreeMap<EventKind, u64>,
    pub app_breakdown: BTreeMap<String, u64>,
    pub keyword_breakdown: BTreeMap<String, u64>,
    /// Events per UTC hour of day.
    pub hourly_distribution: [u64; 24],
    pub first_event_at: Option<i64>,
    pub last_event_at: Option<i64>,
}

/// One event as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub index: u64,
    pub app_name: String,
    pub keyword: String,
    pub kind: EventKind,
    pub timestamp: i64,
    /// RFC 3339 rendering of `timestamp`, absent if out of range.
    pub occurred_at: Option<String>,
    pub hash: String,
}

fn event_time(timestamp_ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_ms) * 1_000_000).ok()
}

pub fn summarize(blocks: &[Block]) -> LedgerStats {
    let mut stats = LedgerStats::default();
    for block in blocks {
        stats.total_events += 1;
        *stats.kind_breakdown.entry(block.event.kind).or_default() += 1;
        if !block.event.app_name.is_empty() {
            *stats
                .app_breakdown
                .entry(block.event.app_name.clone())
                .or_default() += 1;
        }
        if !block.event.keyword.is_empty() {
            *stats
                .keyword_breakdown
                .entry(block.event.keyword.clone())
                .or_default() += 1;
        }
        if let Some(at) = event_time(block.timestamp) {
            stats.hourly_distribution[usize::from(at.hour())] += 1;
        }
        // Device clocks drift, so the extremes are not necessarily the ends of the chain.
        let ts = block.timestamp;
        stats.first_event_at = Some(stats.first_event_at.map_or(ts, |t| t.min(ts)));
        stats.last_event_at = Some(stats.last_event_at.map_or(ts, |t| t.max(ts)));
    }
    stats
}

/// Events newest first; ties broken by chain position.
pub fn timeline(blocks: &[Block]) -> Vec<TimelineEntry> {
    let mut entries: Vec<TimelineEntry> = blocks
        .iter()
        .map(|b| TimelineEntry {
            index: b.index,
            app_name: b.event.app_name.clone(),
            keyword: b.event.keyword.clone(),
            kind: b.event.kind,
            timestamp: b.timestamp,
            occurred_at: event_time(b.timestamp).and_then(|t| t.format(&Rfc3339).ok()),
            hash: b.hash.clone(),
        })
        .collect();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.index.cmp(&a.index)));
    entries
}
