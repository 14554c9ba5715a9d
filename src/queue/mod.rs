//! The Queue Broker: a durable, multi-producer/multi-consumer work queue with
//! per-message ACK, priority, and at-least-once redelivery.
//!
//! The contract is expressed as the [`QueueBroker`] trait so the durable
//! technology behind it is pluggable (nothing in the design mandates one — see
//! Design Notes). [`memory`] ships a lease-based, in-process implementation built
//! the way the rest of this crate's ambient stack is built: no locks held across
//! an await point, a reaper for expired leases, CAS semantics for everything that
//! can race.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::job::RawId;
use crate::job::FlagBracket;
use crate::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    Extract,
    Transform,
    Embed,
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueName::Extract => "extract",
            QueueName::Transform => "transform",
            QueueName::Embed => "embed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for QueueName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "extract" => Ok(QueueName::Extract),
            "transform" => Ok(QueueName::Transform),
            "embed" => Ok(QueueName::Embed),
            other => anyhow::bail!("unknown queue name: {}", other),
        }
    }
}

/// Priorities: 1 (urgent) > 5 (default) > 10 (low). Lower numeric value sorts
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const URGENT: Priority = Priority(1);
    pub const DEFAULT: Priority = Priority(5);
    pub const LOW: Priority = Priority(10);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

/// `ref` in the spec: queue-specific addressing of what a message is about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageRef {
    /// `extract`: entity-type-specific extraction parameters, derived from the
    /// watermark and the integration's settings.
    Extract(ExtractParams),
    /// `transform`: a raw_id to load from the Raw Store.
    Transform(RawId),
    /// `embed`: the target table and external id of a finalized row.
    Embed { target_table: String, external_id: String },
    /// Used to propagate closing flags through a step that had zero items.
    Sentinel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractParams {
    pub entity_type: String,
    pub watermark: Option<DateTime<Utc>>,
    pub run_started_at: DateTime<Utc>,
    pub batch_size: usize,
}

/// The one envelope shape shared by all three queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub tenant_id: TenantId,
    pub integration_id: Uuid,
    pub job_id: Uuid,
    pub step_name: String,
    pub entity_type: String,
    pub message_ref: MessageRef,
    pub flags: FlagBracket,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub priority: Priority,
}

impl Envelope {
    /// Every message uniquely identifies its owning `(tenant_id, job_id,
    /// step_name)`; used by workers to reject cross-tenant references early.
    pub fn owning_key(&self) -> (TenantId, Uuid, &str) {
        (self.tenant_id, self.job_id, self.step_name.as_str())
    }
}

/// A message handed to a consumer, plus the lease token needed to ack/nack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub lease: LeaseToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub visible: usize,
    pub in_flight: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.visible + self.in_flight
    }
}

/// What to do with a failed message, decided by the caller from an [`EtlError`]'s
/// kind (see the error handling design's propagation policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackDecision {
    Requeue,
    DeadLetter,
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn publish(&self, queue: QueueName, envelope: Envelope) -> anyhow::Result<()>;

    /// Blocks (yields) until a message is available or the broker is closed.
    async fn consume(&self, queue: QueueName) -> anyhow::Result<Option<Delivery>>;

    async fn ack(&self, queue: QueueName, lease: LeaseToken) -> anyhow::Result<()>;

    async fn nack(&self, queue: QueueName, lease: LeaseToken, decision: NackDecision) -> anyhow::Result<()>;

    async fn depth(&self, queue: QueueName) -> anyhow::Result<QueueDepth>;

    /// Messages routed to the dead-letter area, for the operator-gated replay path.
    async fn dead_letters(&self, queue: QueueName) -> anyhow::Result<Vec<Envelope>>;

    /// Operator-gated: re-publish a dead-lettered message with `attempt` reset.
    async fn replay_dead_letter(&self, queue: QueueName, index: usize) -> anyhow::Result<()>;
}
