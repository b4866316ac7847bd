//! # Knowledge Capability - Search Boundary
//!
//! The engine consumes knowledge-base adapters through a single async
//! search capability with an availability signal. Adapter internals (hybrid
//! ranking, local file scans, remote indexes) live outside the core; the
//! engine only surfaces the adapter's stat block in flow metadata.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Search routing strategy requested by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchStrategy {
    KbFirst,
    FileFirst,
    Hybrid,
    /// Strict mode: no file fallback, adapter unavailability is fatal
    KbOnly,
}

impl std::fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SearchStrategy::KbFirst => "KB_FIRST",
            SearchStrategy::FileFirst => "FILE_FIRST",
            SearchStrategy::Hybrid => "HYBRID",
            SearchStrategy::KbOnly => "KB_ONLY",
        };
        f.write_str(name)
    }
}

/// One ranked search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub source: Option<String>,
}

/// Search request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub limit: usize,
    pub score_threshold: f64,
    pub strategy: SearchStrategy,
}

impl SearchQuery {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            limit: 5,
            score_threshold: 0.35,
            strategy: SearchStrategy::Hybrid,
        }
    }
}

/// Search response including the availability signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub file_content: Option<String>,
    pub kb_available: bool,
    pub strategy_used: SearchStrategy,
    pub response_time_ms: f64,
}

/// Adapter usage statistics surfaced in flow metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterStats {
    pub total_queries: u64,
    pub kb_successes: u64,
    pub kb_errors: u64,
    pub file_searches: u64,
    pub kb_availability: bool,
    pub avg_response_time_ms: f64,
}

/// Search capability consumed by the engine
#[async_trait]
pub trait KnowledgeAdapter: Send + Sync {
    async fn search(&self, query: SearchQuery) -> Result<SearchResponse>;

    /// Current usage statistics
    fn stats(&self) -> AdapterStats;
}

/// Adapter that reports the knowledge base as unavailable and returns empty
/// results. Used when no adapter is configured so research fallbacks engage.
pub struct NullKnowledgeAdapter {
    stats: RwLock<AdapterStats>,
}

impl NullKnowledgeAdapter {
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(AdapterStats::default()),
        }
    }
}

impl Default for NullKnowledgeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeAdapter for NullKnowledgeAdapter {
    async fn search(&self, query: SearchQuery) -> Result<SearchResponse> {
        let mut stats = self.stats.write();
        stats.total_queries += 1;
        stats.file_searches += 1;
        stats.kb_availability = false;

        Ok(SearchResponse {
            results: Vec::new(),
            file_content: None,
            kb_available: false,
            strategy_used: query.strategy,
            response_time_ms: 0.0,
        })
    }

    fn stats(&self) -> AdapterStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_adapter_reports_unavailable() {
        let adapter = NullKnowledgeAdapter::new();
        let response = adapter
            .search(SearchQuery::new("flow orchestration patterns"))
            .await
            .unwrap();

        assert!(!response.kb_available);
        assert!(response.results.is_empty());

        let stats = adapter.stats();
        assert_eq!(stats.total_queries, 1);
        assert_eq!(stats.file_searches, 1);
    }

    #[test]
    fn test_strategy_serialization() {
        let json = serde_json::to_string(&SearchStrategy::KbOnly).unwrap();
        assert_eq!(json, "\"KB_ONLY\"");
        let parsed: SearchStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, SearchStrategy::KbOnly);
    }
}
