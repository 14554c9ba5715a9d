//! Concrete [`EmbeddingProvider`] implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EtlError, Result};
use crate::provider::EmbeddingProvider;
use crate::tenant::TenantId;

/// Calls an HTTP embeddings endpoint (OpenAI-compatible shape: `{input} ->
/// {data: [{embedding}]}`). Credentials and endpoint selection are resolved at
/// construction; prompt engineering and cost tracking live upstream of this
/// crate per the provider-selection non-goal.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        HttpEmbeddingProvider {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f64>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str, _tenant: TenantId) -> Result<Vec<f64>> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest { input: text, model: &self.model })
            .send()
            .await
            .map_err(|e| EtlError::TransientExternal(e.into()))?;

        if response.status().is_client_error() {
            return Err(EtlError::PermanentData(anyhow::anyhow!(
                "embedding provider rejected input: {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(EtlError::TransientExternal(anyhow::anyhow!(
                "embedding provider returned {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EtlError::TransientExternal(e.into()))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EtlError::PermanentData(anyhow::anyhow!("embedding provider returned no data")))
    }
}

/// Deterministic, network-free provider for tests and the scenario suite:
/// hashes the text into a fixed-width vector so the same row always yields the
/// same vector, matching the text-construction determinism property.
pub struct DeterministicTestProvider {
    dimension: usize,
}

impl DeterministicTestProvider {
    pub fn new(dimension: usize) -> Self {
        DeterministicTestProvider { dimension }
    }
}

#[async_trait]
impl EmbeddingProvider for DeterministicTestProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str, _tenant: TenantId) -> Result<Vec<f64>> {
        let mut vector = vec![0.0_f64; self.dimension];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dimension] += byte as f64;
        }
        let norm: f64 = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deterministic_provider_is_stable_for_same_text() {
        let provider = DeterministicTestProvider::new(8);
        let tenant = TenantId::new(uuid::Uuid::new_v4());
        let a = provider.embed("PROJ-1: Alpha", tenant).await.unwrap();
        let b = provider.embed("PROJ-1: Alpha", tenant).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[tokio::test]
    async fn deterministic_provider_differs_for_different_text() {
        let provider = DeterministicTestProvider::new(8);
        let tenant = TenantId::new(uuid::Uuid::new_v4());
        let a = provider.embed("PROJ-1: Alpha", tenant).await.unwrap();
        let b = provider.embed("PROJ-2: Beta", tenant).await.unwrap();
        assert_ne!(a, b);
    }
}
