//! Pluggable external collaborators: embedding generation and (optionally)
//! chat/completions. Provider selection, prompting, and cost tracking are out
//! of scope for this crate; it only consumes the narrow contract below.

pub mod embedding;

use async_trait::async_trait;

use crate::error::Result;
use crate::tenant::TenantId;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Fixed dimension per collection, declared at collection creation.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str, tenant: TenantId) -> Result<Vec<f64>>;

    /// Optional batch path; the default falls back to sequential single calls.
    /// Workers use it when the provider overrides it with a real batch call.
    async fn batch_embed(&self, texts: &[String], tenant: TenantId) -> Result<Vec<Vec<f64>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text, tenant).await?);
        }
        Ok(out)
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, prompt: &str, tenant: TenantId) -> Result<String>;
}
