//! CLI subcommand implementations: `serve`, `worker`, `db`.

pub mod db;
pub mod serve;
pub mod worker;

use std::sync::Arc;

use crate::adapters::github::GithubAdapter;
use crate::adapters::jira::JiraAdapter;
use crate::provider::embedding::{DeterministicTestProvider, HttpEmbeddingProvider};
use crate::provider::EmbeddingProvider;
use crate::workers::AdapterRegistry;

pub fn build_adapters() -> AdapterRegistry {
    let mut adapters: AdapterRegistry = AdapterRegistry::new();
    adapters.insert("jira".to_string(), Arc::new(JiraAdapter::default()));
    adapters.insert("github".to_string(), Arc::new(GithubAdapter::default()));
    adapters
}

/// An `EMBEDDING_ENDPOINT` in the environment selects the real HTTP provider;
/// its absence falls back to the deterministic, network-free one so `serve`
/// still starts on a laptop with no embedding backend configured.
pub fn build_embedding_provider() -> Arc<dyn EmbeddingProvider> {
    let dimension: usize = std::env::var("EMBEDDING_DIMENSION")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(256);

    match std::env::var("EMBEDDING_ENDPOINT") {
        Ok(endpoint) => {
            let api_key = std::env::var("EMBEDDING_API_KEY").unwrap_or_default();
            let model = std::env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "text-embedding".to_string());
            Arc::new(HttpEmbeddingProvider::new(endpoint, api_key, model, dimension))
        }
        Err(_) => Arc::new(DeterministicTestProvider::new(dimension)),
    }
}
