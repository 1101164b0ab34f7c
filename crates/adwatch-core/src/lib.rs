//! Core domain model for adwatch: records, observations, identity rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "adwatch-core";

/// Where an item sat in the most recent observation batch: page number first,
/// then its rank within that page. Orders lexicographically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequencePosition {
    pub page: u32,
    pub rank_on_page: u32,
}

impl SequencePosition {
    pub fn new(page: u32, rank_on_page: u32) -> Self {
        Self { page, rank_on_page }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Stale,
}

/// One persisted row of the snapshot table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identity: String,
    /// Dense 1..N display rank, re-derived on every reconcile.
    pub rank: u32,
    pub position: SequencePosition,
    /// Set at creation, never overwritten by the engine.
    pub immutable: BTreeMap<String, String>,
    /// Overwritten on every re-observation of the same identity.
    pub mutable: BTreeMap<String, String>,
    pub status: RecordStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One freshly observed item, before reconciliation.
///
/// `identity` is `None` when the source could not derive a key for the item;
/// the engine drops such observations and reports them as skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub identity: Option<String>,
    pub position: SequencePosition,
    #[serde(default)]
    pub immutable: BTreeMap<String, String>,
    #[serde(default)]
    pub mutable: BTreeMap<String, String>,
}

impl Observation {
    pub fn new(identity: impl Into<String>, position: SequencePosition) -> Self {
        Self {
            identity: Some(identity.into()),
            position,
            immutable: BTreeMap::new(),
            mutable: BTreeMap::new(),
        }
    }

    pub fn with_immutable(mut self, key: &str, value: impl Into<String>) -> Self {
        self.immutable.insert(key.to_string(), value.into());
        self
    }

    pub fn with_mutable(mut self, key: &str, value: impl Into<String>) -> Self {
        self.mutable.insert(key.to_string(), value.into());
        self
    }
}

/// A single observation the engine could not classify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedObservation {
    /// Index into the observed batch.
    pub index: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingIdentity,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The persisted snapshot carries the same identity twice. Upstream
    /// corruption; the pass cannot safely proceed and must not be repaired
    /// silently.
    #[error("malformed snapshot: identity {identity:?} appears at rows {first_row} and {second_row}")]
    MalformedSnapshot {
        identity: String,
        first_row: usize,
        second_row: usize,
    },
}

/// Identity policy for listing records: the normalized URL, nothing else.
///
/// Lowercases scheme and host, strips the query string and fragment, and
/// trims a trailing slash from the path. Titles never participate. Returns
/// `None` for inputs that are blank or carry no path/host at all.
pub fn normalize_listing_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);

    let (scheme, rest) = match without_query.split_once("://") {
        Some((s, r)) => (Some(s), r),
        None => (None, without_query),
    };
    if rest.is_empty() {
        return None;
    }

    let (host, path) = match rest.split_once('/') {
        Some((h, p)) => (h, p),
        None => (rest, ""),
    };
    if host.is_empty() {
        return None;
    }

    let mut out = String::new();
    if let Some(scheme) = scheme {
        out.push_str(&scheme.to_ascii_lowercase());
        out.push_str("://");
    }
    out.push_str(&host.to_ascii_lowercase());
    let path = path.trim_end_matches('/');
    if !path.is_empty() {
        out.push('/');
        out.push_str(path);
    }
    Some(out)
}
