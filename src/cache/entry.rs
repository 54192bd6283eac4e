//! Stored cache entry format.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached value with its metadata, stored as JSON bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub created_at: DateTime<Utc>,
    /// Lifetime in milliseconds from `created_at`.
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn new(data: Value, ttl: Option<Duration>, tags: BTreeSet<String>) -> Self {
        Self {
            data,
            created_at: Utc::now(),
            ttl_ms: ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
            tags,
            hit_count: 0,
        }
    }

    /// Lifetime left at `now`, `None` for entries without a TTL.
    ///
    /// An expired entry reports zero.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let ttl = self.ttl_ms?;
        let age = now
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Some(Duration::from_millis(ttl).saturating_sub(age))
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
