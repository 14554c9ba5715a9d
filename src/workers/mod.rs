//! The three worker classes: extract, transform, embed. Each is a small loop
//! around [`QueueBroker::consume`]; the per-message algorithms live in the
//! submodules. This module holds what they share: the context every worker
//! closes over, and the ack/nack-requeue/dead-letter decision from an
//! [`EtlError`].

pub mod embed;
pub mod extract;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::SourceAdapter;
use crate::config::Configuration;
use crate::db::DbPool;
use crate::error::EtlError;
use crate::progress::ProgressChannel;
use crate::provider::EmbeddingProvider;
use crate::queue::{NackDecision, QueueBroker};
use crate::vector::VectorStore;

/// Shared dependencies every worker loop needs. Cloning is cheap: everything
/// inside is an `Arc`.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: DbPool,
    pub broker: Arc<dyn QueueBroker>,
    pub progress: Arc<dyn ProgressChannel>,
    pub config: Arc<Configuration>,
}

/// Registry of adapters by provider name (`"jira"`, `"github"`), looked up by
/// entity-type's owning integration. Held only by the extract worker.
pub type AdapterRegistry = HashMap<String, Arc<dyn SourceAdapter>>;

/// What to do with an in-flight message after it failed, per the propagation
/// policy: workers never throw back to the broker, they translate every
/// failure into ack (success), nack-requeue, or dead-letter.
pub enum Disposition {
    Ack,
    Nack(NackDecision),
}

impl Disposition {
    /// `attempt` is the delivery's attempt count *before* this failure; used
    /// only for tracing, the broker itself owns the max-retries decision.
    pub fn for_error(error: &EtlError, attempt: u32, max_retries: u32) -> Disposition {
        match error {
            EtlError::TransientExternal(_) | EtlError::TransientInternal(_) => {
                if attempt + 1 >= max_retries {
                    Disposition::Nack(NackDecision::DeadLetter)
                } else {
                    Disposition::Nack(NackDecision::Requeue)
                }
            }
            EtlError::PermanentData(_) | EtlError::Configuration(_) | EtlError::TenantMismatch { .. } => {
                Disposition::Nack(NackDecision::DeadLetter)
            }
            EtlError::NotFound(_) => Disposition::Nack(NackDecision::DeadLetter),
            EtlError::Other(_) => Disposition::Nack(NackDecision::Requeue),
        }
    }
}

/// Registry of embedding providers is a single provider in this version
/// (provider selection is out of scope); kept as a type alias so swapping it
/// for a per-tenant map later does not ripple through worker signatures.
pub type SharedEmbeddingProvider = Arc<dyn EmbeddingProvider>;
pub type SharedVectorStore = Arc<dyn VectorStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: &str) -> EtlError {
        match kind {
            "transient" => EtlError::TransientExternal(anyhow::anyhow!("boom")),
            "permanent" => EtlError::PermanentData(anyhow::anyhow!("boom")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn transient_errors_requeue_until_max_retries() {
        match Disposition::for_error(&err("transient"), 0, 5) {
            Disposition::Nack(NackDecision::Requeue) => {}
            _ => panic!("expected requeue"),
        }
        match Disposition::for_error(&err("transient"), 4, 5) {
            Disposition::Nack(NackDecision::DeadLetter) => {}
            _ => panic!("expected dead-letter at max retries"),
        }
    }

    #[test]
    fn permanent_errors_always_dead_letter() {
        match Disposition::for_error(&err("permanent"), 0, 5) {
            Disposition::Nack(NackDecision::DeadLetter) => {}
            _ => panic!("expected dead-letter"),
        }
    }
}
