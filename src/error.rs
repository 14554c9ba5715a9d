//! Error taxonomy.
//!
//! Kinds, not types: every failure a worker can hit collapses into one of the five
//! kinds from the error handling design (transient external, transient internal,
//! permanent data, configuration, partial failure). Workers never propagate an
//! `Err` back to the broker; see [`crate::queue::AckDecision`] for how each kind maps
//! to ack/nack-requeue/dead-letter.

use thiserror::Error;

use crate::tenant::TenantId;

#[derive(Debug, Error)]
pub enum EtlError {
    /// Source API rate limit, broker/database momentary unavailability, provider
    /// timeout. Retried with exponential backoff bounded by `max_retries`.
    #[error("transient external failure: {0}")]
    TransientExternal(#[source] anyhow::Error),

    /// Optimistic CAS failure on a Job Registry write (another worker updated the
    /// same cell concurrently). Re-read and retry a bounded number of times before
    /// falling back to nack-requeue.
    #[error("transient internal failure: {0}")]
    TransientInternal(#[source] anyhow::Error),

    /// Malformed payload or violated invariant (e.g. a message with no tenant_id).
    /// Dead-lettered; the owning job is failed.
    #[error("permanent data error: {0}")]
    PermanentData(#[source] anyhow::Error),

    /// Unknown provider, missing credentials, or another misconfiguration that is
    /// fatal for the affected job but does not affect other jobs.
    #[error("configuration error: {0}")]
    Configuration(#[source] anyhow::Error),

    /// A message referenced a row belonging to a different tenant than the one
    /// named in its envelope. Always a bug upstream; never retried.
    #[error("tenant isolation violation: message for {message_tenant} handled while expecting {expected_tenant}")]
    TenantMismatch {
        expected_tenant: TenantId,
        message_tenant: TenantId,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EtlError {
    /// Truncated, UI-displayable rendering used for `etl_jobs.error_message`.
    pub fn truncated_message(&self, max_len: usize) -> String {
        let s = self.to_string();
        if s.len() <= max_len {
            s
        } else {
            let mut truncated = s[..max_len].to_string();
            truncated.push('\u{2026}');
            truncated
        }
    }

    /// Whether this kind of failure should be retried (nack-requeue) rather than
    /// immediately dead-lettered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EtlError::TransientExternal(_) | EtlError::TransientInternal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
