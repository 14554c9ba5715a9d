//! The Progress Channel: best-effort fan-out of status transitions to
//! connected observers, strictly scoped per tenant. Never authoritative —
//! reconnecting observers must re-read the Job Registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{SubStatus, WorkerType};
use crate::tenant::TenantId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub step_name: String,
    pub worker_type: WorkerType,
    pub value: SubStatus,
    pub ts: DateTime<Utc>,
}

#[async_trait]
pub trait ProgressChannel: Send + Sync {
    fn publish(&self, tenant: TenantId, event: ProgressEvent);

    /// A best-effort stream of events for `tenant`. Lagging subscribers may miss
    /// events (see [`broadcast::Receiver`] semantics); this is intentional per
    /// the channel's best-effort contract.
    fn subscribe(&self, tenant: TenantId) -> broadcast::Receiver<ProgressEvent>;
}

/// In-process fan-out: one `broadcast` channel per tenant, created lazily on
/// first publish or subscribe. Tenant scoping is structural — a subscriber can
/// never receive another tenant's channel.
pub struct BroadcastProgressChannel {
    channels: DashMap<TenantId, broadcast::Sender<ProgressEvent>>,
    capacity: usize,
}

impl BroadcastProgressChannel {
    pub fn new(capacity: usize) -> Self {
        BroadcastProgressChannel {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn sender_for(&self, tenant: TenantId) -> broadcast::Sender<ProgressEvent> {
        self.channels
            .entry(tenant)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl ProgressChannel for BroadcastProgressChannel {
    fn publish(&self, tenant: TenantId, event: ProgressEvent) {
        // No receivers is not an error: progress is observed best-effort.
        let _ = self.sender_for(tenant).send(event);
    }

    fn subscribe(&self, tenant: TenantId) -> broadcast::Receiver<ProgressEvent> {
        self.sender_for(tenant).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ProgressEvent {
        ProgressEvent {
            job_id: Uuid::new_v4(),
            step_name: "issues".to_string(),
            worker_type: WorkerType::Extraction,
            value: SubStatus::Running,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_own_tenant_events_only() {
        let channel = BroadcastProgressChannel::new(16);
        let tenant_a = TenantId::new(Uuid::new_v4());
        let tenant_b = TenantId::new(Uuid::new_v4());

        let mut rx_a = channel.subscribe(tenant_a);
        let mut rx_b = channel.subscribe(tenant_b);

        channel.publish(tenant_a, event());

        let received = rx_a.try_recv().expect("tenant a should see its own event");
        assert_eq!(received.worker_type, WorkerType::Extraction);
        assert!(rx_b.try_recv().is_err());
    }
}
