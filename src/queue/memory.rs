//! In-process, lease-based implementation of [`QueueBroker`].
//!
//! Each queue is a priority-ordered `VecDeque`, guarded by a `parking_lot::Mutex`
//! that is never held across an `.await`. A leased (in-flight) message becomes
//! invisible to other consumers until it is ack'd, nack'd, or its visibility
//! timeout elapses; a background reaper task (started by [`MemoryBroker::spawn_reaper`])
//! sweeps expired leases back onto their queue with an incremented `attempt`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{Delivery, Envelope, LeaseToken, NackDecision, QueueBroker, QueueDepth, QueueName};

struct InFlight {
    envelope: Envelope,
    queue: QueueName,
    leased_at: chrono::DateTime<Utc>,
    visibility_timeout: Duration,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<Envelope>,
    in_flight: HashMap<LeaseToken, InFlight>,
    dead_letter: Vec<Envelope>,
}

impl QueueState {
    fn insert_by_priority(&mut self, envelope: Envelope) {
        let pos = self
            .visible
            .iter()
            .position(|existing| envelope.priority < existing.priority)
            .unwrap_or(self.visible.len());
        self.visible.insert(pos, envelope);
    }
}

/// Per-queue visibility timeouts, since extract/transform/embed differ (see
/// Environment Inputs).
pub struct VisibilityTimeouts {
    pub extract: Duration,
    pub transform: Duration,
    pub embed: Duration,
}

impl VisibilityTimeouts {
    fn for_queue(&self, queue: QueueName) -> Duration {
        match queue {
            QueueName::Extract => self.extract,
            QueueName::Transform => self.transform,
            QueueName::Embed => self.embed,
        }
    }
}

pub struct MemoryBroker {
    extract: Mutex<QueueState>,
    transform: Mutex<QueueState>,
    embed: Mutex<QueueState>,
    notify: Notify,
    visibility: VisibilityTimeouts,
    max_retries: u32,
}

impl MemoryBroker {
    pub fn new(visibility: VisibilityTimeouts, max_retries: u32) -> Self {
        MemoryBroker {
            extract: Mutex::new(QueueState::default()),
            transform: Mutex::new(QueueState::default()),
            embed: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility,
            max_retries,
        }
    }

    fn state(&self, queue: QueueName) -> &Mutex<QueueState> {
        match queue {
            QueueName::Extract => &self.extract,
            QueueName::Transform => &self.transform,
            QueueName::Embed => &self.embed,
        }
    }

    /// Scan every queue for leases past their visibility timeout and make them
    /// visible again, incrementing `attempt`. Intended to run on a periodic
    /// background task.
    pub fn reap_expired(&self) {
        let now = Utc::now();
        for queue in [QueueName::Extract, QueueName::Transform, QueueName::Embed] {
            let mut state = self.state(queue).lock();
            let expired: Vec<LeaseToken> = state
                .in_flight
                .iter()
                .filter(|(_, inflight)| {
                    let elapsed = now.signed_duration_since(inflight.leased_at);
                    elapsed
                        .to_std()
                        .map(|e| e > inflight.visibility_timeout)
                        .unwrap_or(false)
                })
                .map(|(token, _)| *token)
                .collect();

            for token in expired {
                if let Some(mut inflight) = state.in_flight.remove(&token) {
                    inflight.envelope.attempt += 1;
                    if inflight.envelope.attempt >= self.max_retries {
                        state.dead_letter.push(inflight.envelope);
                    } else {
                        state.insert_by_priority(inflight.envelope);
                    }
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Spawn the reaper on the current Tokio runtime, polling every `interval`.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                broker.reap_expired();
            }
        })
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn publish(&self, queue: QueueName, envelope: Envelope) -> anyhow::Result<()> {
        self.state(queue).lock().insert_by_priority(envelope);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: QueueName) -> anyhow::Result<Option<Delivery>> {
        loop {
            {
                let mut state = self.state(queue).lock();
                if let Some(envelope) = state.visible.pop_front() {
                    let lease = LeaseToken(Uuid::new_v4());
                    state.in_flight.insert(
                        lease,
                        InFlight {
                            envelope: envelope.clone(),
                            queue,
                            leased_at: Utc::now(),
                            visibility_timeout: self.visibility.for_queue(queue),
                        },
                    );
                    return Ok(Some(Delivery { envelope, lease }));
                }
            }
            // No locks held across this await.
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep(Duration::from_millis(50)) => {},
            }
        }
    }

    async fn ack(&self, queue: QueueName, lease: LeaseToken) -> anyhow::Result<()> {
        self.state(queue).lock().in_flight.remove(&lease);
        Ok(())
    }

    async fn nack(&self, queue: QueueName, lease: LeaseToken, decision: NackDecision) -> anyhow::Result<()> {
        let mut state = self.state(queue).lock();
        if let Some(mut inflight) = state.in_flight.remove(&lease) {
            match decision {
                NackDecision::Requeue if inflight.envelope.attempt + 1 < self.max_retries => {
                    inflight.envelope.attempt += 1;
                    state.insert_by_priority(inflight.envelope);
                }
                _ => state.dead_letter.push(inflight.envelope),
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> anyhow::Result<QueueDepth> {
        let state = self.state(queue).lock();
        Ok(QueueDepth {
            visible: state.visible.len(),
            in_flight: state.in_flight.len(),
        })
    }

    async fn dead_letters(&self, queue: QueueName) -> anyhow::Result<Vec<Envelope>> {
        Ok(self.state(queue).lock().dead_letter.clone())
    }

    async fn replay_dead_letter(&self, queue: QueueName, index: usize) -> anyhow::Result<()> {
        let mut state = self.state(queue).lock();
        if index >= state.dead_letter.len() {
            anyhow::bail!("no dead-letter message at index {}", index);
        }
        let mut envelope = state.dead_letter.remove(index);
        envelope.attempt = 0;
        state.insert_by_priority(envelope);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FlagBracket;
    use crate::queue::MessageRef;
    use crate::tenant::TenantId;

    fn envelope(priority: super::super::Priority) -> Envelope {
        Envelope {
            tenant_id: TenantId::new(Uuid::new_v4()),
            integration_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            step_name: "issues".to_string(),
            entity_type: "jira_issues".to_string(),
            message_ref: MessageRef::Sentinel,
            flags: FlagBracket::single(false),
            attempt: 0,
            enqueued_at: Utc::now(),
            priority,
        }
    }

    fn broker() -> MemoryBroker {
        MemoryBroker::new(
            VisibilityTimeouts {
                extract: Duration::from_secs(600),
                transform: Duration::from_secs(120),
                embed: Duration::from_secs(120),
            },
            5,
        )
    }

    #[tokio::test]
    async fn publish_then_consume_roundtrips() {
        let broker = broker();
        broker
            .publish(QueueName::Transform, envelope(super::super::Priority::DEFAULT))
            .await
            .unwrap();

        let delivery = broker.consume(QueueName::Transform).await.unwrap().unwrap();
        assert_eq!(delivery.envelope.step_name, "issues");
        broker.ack(QueueName::Transform, delivery.lease).await.unwrap();
        assert_eq!(broker.depth(QueueName::Transform).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let broker = broker();
        broker
            .publish(QueueName::Extract, envelope(super::super::Priority::LOW))
            .await
            .unwrap();
        broker
            .publish(QueueName::Extract, envelope(super::super::Priority::URGENT))
            .await
            .unwrap();

        let first = broker.consume(QueueName::Extract).await.unwrap().unwrap();
        assert_eq!(first.envelope.priority, super::super::Priority::URGENT);
    }

    #[tokio::test]
    async fn nack_requeue_increments_attempt_until_dead_lettered() {
        let broker = broker();
        broker
            .publish(QueueName::Embed, envelope(super::super::Priority::DEFAULT))
            .await
            .unwrap();

        for _ in 0..5 {
            let delivery = broker.consume(QueueName::Embed).await.unwrap().unwrap();
            broker
                .nack(QueueName::Embed, delivery.lease, NackDecision::Requeue)
                .await
                .unwrap();
        }

        assert_eq!(broker.dead_letters(QueueName::Embed).await.unwrap().len(), 1);
        assert_eq!(broker.depth(QueueName::Embed).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn replay_dead_letter_resets_attempt() {
        let broker = broker();
        broker
            .publish(QueueName::Embed, envelope(super::super::Priority::DEFAULT))
            .await
            .unwrap();
        for _ in 0..5 {
            let delivery = broker.consume(QueueName::Embed).await.unwrap().unwrap();
            broker
                .nack(QueueName::Embed, delivery.lease, NackDecision::Requeue)
                .await
                .unwrap();
        }

        broker.replay_dead_letter(QueueName::Embed, 0).await.unwrap();
        let delivery = broker.consume(QueueName::Embed).await.unwrap().unwrap();
        assert_eq!(delivery.envelope.attempt, 0);
    }
}
