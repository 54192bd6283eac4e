//! Cache categories and their default lifetimes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::GovernorError;

/// Known cache categories.
///
/// The category → default TTL table is a stable contract: callers rely on
/// e.g. embeddings living a day and search results half an hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    SearchResults,
    PaperMetadata,
    Embeddings,
    LlmResponses,
    ApiResponses,
    UserSessions,
    HealthChecks,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 7] = [
        CacheCategory::SearchResults,
        CacheCategory::PaperMetadata,
        CacheCategory::Embeddings,
        CacheCategory::LlmResponses,
        CacheCategory::ApiResponses,
        CacheCategory::UserSessions,
        CacheCategory::HealthChecks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::SearchResults => "search_results",
            CacheCategory::PaperMetadata => "paper_metadata",
            CacheCategory::Embeddings => "embeddings",
            CacheCategory::LlmResponses => "llm_responses",
            CacheCategory::ApiResponses => "api_responses",
            CacheCategory::UserSessions => "user_sessions",
            CacheCategory::HealthChecks => "health_checks",
        }
    }

    /// Built-in lifetime for entries in this category.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(match self {
            CacheCategory::SearchResults => 1_800,
            CacheCategory::PaperMetadata => 7_200,
            CacheCategory::Embeddings => 86_400,
            CacheCategory::LlmResponses => 3_600,
            CacheCategory::ApiResponses => 1_800,
            CacheCategory::UserSessions => 3_600,
            CacheCategory::HealthChecks => 300,
        })
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| GovernorError::Configuration(format!("unknown cache category: {s}")))
    }
}

/// Category → TTL lookup with per-category overrides.
///
/// Categories outside [`CacheCategory`] use the `api_responses` lifetime
/// unless overridden.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TtlTable {
    ttls: BTreeMap<String, u64>,
}

impl TtlTable {
    /// The built-in table.
    pub fn new() -> Self {
        let ttls = CacheCategory::ALL
            .into_iter()
            .map(|c| (c.as_str().to_string(), c.default_ttl().as_secs()))
            .collect();
        Self { ttls }
    }

    /// Override (or add) the lifetime for a category.
    pub fn set(&mut self, category: impl Into<String>, ttl: Duration) {
        self.ttls.insert(category.into(), ttl.as_secs());
    }

    pub fn ttl_for(&self, category: &str) -> Duration {
        let secs = self
            .ttls
            .get(category)
            .or_else(|| self.ttls.get(CacheCategory::ApiResponses.as_str()))
            .copied()
            .unwrap_or_else(|| CacheCategory::ApiResponses.default_ttl().as_secs());
        Duration::from_secs(secs)
    }

    /// All entries as `category → seconds`.
    pub fn as_map(&self) -> &BTreeMap<String, u64> {
        &self.ttls
    }
}

impl Default for TtlTable {
    fn default() -> Self {
        Self::new()
    }
}
