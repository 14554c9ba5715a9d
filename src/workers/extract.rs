//! Extract workers: turn a source API into a stream of Raw Records and a
//! stream of `transform` messages, and drive step-to-step chaining.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::adapters::{ExtractSink, ExtractedItem, SourceAdapter};
use crate::db::models::integration::Integration;
use crate::db::models::job::EtlJob;
use crate::db::models::raw_record::{NewRawRecord, RawId};
use crate::db::{self, DbPool};
use crate::error::{EtlError, Result};
use crate::job::{StepName, SubStatus, WorkerType};
use crate::progress::{ProgressChannel, ProgressEvent};
use crate::queue::{Delivery, Envelope, ExtractParams, MessageRef, NackDecision, Priority, QueueBroker, QueueName};
use crate::tenant::TenantId;

use super::{AdapterRegistry, Disposition, WorkerContext};

pub struct ExtractWorker {
    ctx: WorkerContext,
    adapters: AdapterRegistry,
}

impl ExtractWorker {
    pub fn new(ctx: WorkerContext, adapters: AdapterRegistry) -> Self {
        ExtractWorker { ctx, adapters }
    }

    /// Run forever, consuming one extract message at a time. Intended to be
    /// spawned as its own task; many of these may run concurrently across
    /// different jobs (see the concurrency model's one-extract-worker-per-step
    /// rule, which holds structurally since only one extract message exists
    /// per step at a time).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let delivery = self.ctx.broker.consume(QueueName::Extract).await.map_err(EtlError::TransientExternal)?;
            let Some(delivery) = delivery else { continue };
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.handle(delivery).await;
            });
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let envelope = delivery.envelope.clone();
        let span = info_span!("extract", job_id = %envelope.job_id, step = %envelope.step_name, tenant_id = %envelope.tenant_id);
        let outcome = self.process(&envelope).instrument(span).await;

        match outcome {
            Ok(()) => {
                let _ = self.ctx.broker.ack(QueueName::Extract, delivery.lease).await;
            }
            Err(error) => {
                warn!(error = %error, "extract message failed");
                match Disposition::for_error(&error, envelope.attempt, self.ctx.config.max_retries()) {
                    Disposition::Ack => {
                        let _ = self.ctx.broker.ack(QueueName::Extract, delivery.lease).await;
                    }
                    Disposition::Nack(decision) => {
                        if decision == NackDecision::DeadLetter {
                            self.fail_job(&envelope, &error).await;
                        }
                        let _ = self.ctx.broker.nack(QueueName::Extract, delivery.lease, decision).await;
                    }
                }
            }
        }
    }

    async fn process(&self, envelope: &Envelope) -> Result<()> {
        let tenant = envelope.tenant_id;
        let job_id = envelope.job_id;
        let step_name = StepName::from(envelope.step_name.as_str());

        let params = match &envelope.message_ref {
            MessageRef::Extract(params) => params.clone(),
            _ => return Err(EtlError::PermanentData(anyhow::anyhow!("extract message carried a non-extract ref"))),
        };

        let job = db::with_conn(self.ctx.pool.clone(), move |conn| EtlJob::find(conn, tenant, job_id)).await?;
        let plan = job.step_plan()?;
        let state = plan
            .get(&step_name)
            .ok_or_else(|| EtlError::PermanentData(anyhow::anyhow!("job has no step named {}", step_name)))?;

        // Idempotence: a redelivered message for a step already finished is a
        // no-op, not an error.
        if state.substatus(WorkerType::Extraction) == SubStatus::Finished {
            return Ok(());
        }
        let is_last_step = plan.is_last_step(&step_name);

        if envelope.flags.first_item {
            self.set_substatus(tenant, job_id, &step_name, SubStatus::Running).await?;
            self.ctx.progress.publish(
                tenant,
                ProgressEvent {
                    job_id,
                    step_name: step_name.0.clone(),
                    worker_type: WorkerType::Extraction,
                    value: SubStatus::Running,
                    ts: Utc::now(),
                },
            );
        }

        let integration_id = envelope.integration_id;
        let integration = db::with_conn(self.ctx.pool.clone(), move |conn| Integration::find(conn, tenant, integration_id)).await?;
        let provider = integration.provider().map_err(EtlError::Configuration)?;
        let adapter = self
            .adapters
            .get(provider.as_str())
            .cloned()
            .ok_or_else(|| EtlError::Configuration(anyhow::anyhow!("no adapter registered for provider {}", provider.as_str())))?;

        let mut sink = BufferingSink {
            pool: self.ctx.pool.clone(),
            broker: Arc::clone(&self.ctx.broker),
            config: Arc::clone(&self.ctx.config),
            tenant,
            integration_id,
            job_id,
            step_name: step_name.clone(),
            entity_type: envelope.entity_type.clone(),
            is_last_step,
            pending: None,
            count: 0,
            emitted_first: false,
        };

        adapter
            .extract(&envelope.entity_type, &integration, job.watermarks()?.get(&step_name), self.ctx.config.default_batch_size(), &mut sink)
            .await?;

        let emitted = sink.count;
        sink.flush_final().await?;

        if emitted == 0 {
            Self::publish_sentinel(&self.ctx.broker, tenant, integration_id, job_id, &step_name, &envelope.entity_type, is_last_step).await?;
        }

        if !is_last_step {
            if let Some(next_state) = plan.next_after(&step_name) {
                let next_params = ExtractParams {
                    entity_type: next_state.name.0.clone(),
                    watermark: job.watermarks()?.get(&next_state.name),
                    run_started_at: params.run_started_at,
                    batch_size: self.ctx.config.default_batch_size(),
                };
                self.ctx
                    .broker
                    .publish(
                        QueueName::Extract,
                        Envelope {
                            tenant_id: tenant,
                            integration_id,
                            job_id,
                            step_name: next_state.name.0.clone(),
                            entity_type: next_state.name.0.clone(),
                            message_ref: MessageRef::Extract(next_params),
                            flags: crate::job::FlagBracket { first_item: true, last_item: true, last_job_item: false },
                            attempt: 0,
                            enqueued_at: Utc::now(),
                            priority: Priority::DEFAULT,
                        },
                    )
                    .await
                    .map_err(EtlError::TransientExternal)?;
            }
        }

        self.advance_watermark(tenant, job_id, &step_name, params.run_started_at).await?;
        self.set_substatus(tenant, job_id, &step_name, SubStatus::Finished).await?;
        self.ctx.progress.publish(
            tenant,
            ProgressEvent {
                job_id,
                step_name: step_name.0.clone(),
                worker_type: WorkerType::Extraction,
                value: SubStatus::Finished,
                ts: Utc::now(),
            },
        );
        info!(items = emitted, "extraction step finished");
        Ok(())
    }

    async fn publish_sentinel(
        broker: &Arc<dyn QueueBroker>,
        tenant: TenantId,
        integration_id: Uuid,
        job_id: Uuid,
        step_name: &StepName,
        entity_type: &str,
        is_last_step: bool,
    ) -> Result<()> {
        broker
            .publish(
                QueueName::Transform,
                Envelope {
                    tenant_id: tenant,
                    integration_id,
                    job_id,
                    step_name: step_name.0.clone(),
                    entity_type: entity_type.to_string(),
                    message_ref: MessageRef::Sentinel,
                    flags: crate::job::FlagBracket {
                        first_item: true,
                        last_item: true,
                        last_job_item: is_last_step,
                    },
                    attempt: 0,
                    enqueued_at: Utc::now(),
                    priority: Priority::DEFAULT,
                },
            )
            .await
            .map_err(EtlError::TransientExternal)
    }

    /// CAS-retry loop for the sub-status write: a concurrent writer to the same
    /// `etl_jobs` row (e.g. another step's worker) can lose the race once or
    /// twice under load; a handful of immediate retries clears that without
    /// falling back to nack-requeue for what is, functionally, a momentary
    /// conflict rather than a real failure.
    async fn set_substatus(&self, tenant: TenantId, job_id: Uuid, step_name: &StepName, value: SubStatus) -> Result<()> {
        for attempt in 0..5 {
            let step = step_name.clone();
            let pool = self.ctx.pool.clone();
            let applied = db::with_conn(pool, move |conn| EtlJob::set_substatus(conn, tenant, job_id, &step, WorkerType::Extraction, value)).await?;
            if applied {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10 * (attempt + 1))).await;
        }
        Err(EtlError::TransientInternal(anyhow::anyhow!("set_substatus CAS did not converge for step {}", step_name)))
    }

    async fn advance_watermark(&self, tenant: TenantId, job_id: Uuid, step_name: &StepName, to: chrono::DateTime<Utc>) -> Result<()> {
        for attempt in 0..5 {
            let step = step_name.clone();
            let pool = self.ctx.pool.clone();
            let applied = db::with_conn(pool, move |conn| EtlJob::advance_watermark(conn, tenant, job_id, &step, to)).await?;
            if applied {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10 * (attempt + 1))).await;
        }
        Err(EtlError::TransientInternal(anyhow::anyhow!("watermark CAS did not converge for step {}", step_name)))
    }

    async fn fail_job(&self, envelope: &Envelope, error: &EtlError) {
        let tenant = envelope.tenant_id;
        let job_id = envelope.job_id;
        let step_name = StepName::from(envelope.step_name.as_str());
        let message = error.truncated_message(2000);

        let _ = db::with_conn(self.ctx.pool.clone(), move |conn| {
            EtlJob::set_substatus(conn, tenant, job_id, &step_name, WorkerType::Extraction, SubStatus::Failed)
        })
        .await;

        let message_for_complete = message.clone();
        let _ = db::with_conn(self.ctx.pool.clone(), move |conn| {
            EtlJob::complete(conn, tenant, job_id, crate::job::OverallStatus::Failed, Utc::now(), None, Some(&message_for_complete))
        })
        .await;
    }
}

/// One-item lookahead buffer: the adapter hands items in one at a time with no
/// knowledge of how many remain, but exactly one `transform` message per step
/// must carry `first_item=true` and exactly one `last_item=true`. Buffering
/// the most recent item and only publishing it once we know whether another
/// follows gives us that without the adapter needing to count ahead.
struct BufferingSink {
    pool: DbPool,
    broker: Arc<dyn QueueBroker>,
    config: Arc<crate::config::Configuration>,
    tenant: TenantId,
    integration_id: Uuid,
    job_id: Uuid,
    step_name: StepName,
    entity_type: String,
    is_last_step: bool,
    pending: Option<RawId>,
    count: usize,
    emitted_first: bool,
}

impl BufferingSink {
    async fn publish_transform(&self, raw_id: RawId, first_item: bool, last_item: bool) -> Result<()> {
        self.wait_for_backpressure().await;
        self.broker
            .publish(
                QueueName::Transform,
                Envelope {
                    tenant_id: self.tenant,
                    integration_id: self.integration_id,
                    job_id: self.job_id,
                    step_name: self.step_name.0.clone(),
                    entity_type: self.entity_type.clone(),
                    message_ref: MessageRef::Transform(raw_id),
                    flags: crate::job::FlagBracket {
                        first_item,
                        last_item,
                        last_job_item: last_item && self.is_last_step,
                    },
                    attempt: 0,
                    enqueued_at: Utc::now(),
                    priority: Priority::DEFAULT,
                },
            )
            .await
            .map_err(EtlError::TransientExternal)
    }

    async fn wait_for_backpressure(&self) {
        let threshold = self.config.transform_queue_backpressure_threshold();
        loop {
            match self.broker.depth(QueueName::Transform).await {
                Ok(depth) if depth.total() > threshold => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                _ => break,
            }
        }
    }

    async fn flush_final(&mut self) -> Result<()> {
        if let Some(raw_id) = self.pending.take() {
            let first_item = !self.emitted_first;
            self.emitted_first = true;
            self.publish_transform(raw_id, first_item, true).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExtractSink for BufferingSink {
    async fn accept(&mut self, item: ExtractedItem) -> Result<()> {
        let tenant = self.tenant;
        let integration_id = self.integration_id;
        let entity_type = self.entity_type.clone();
        let external_id = item.external_id.clone();
        let metadata = serde_json::json!({ "updated_at": item.updated_at });

        let raw_id = db::with_conn(self.pool.clone(), move |conn| {
            NewRawRecord::new(tenant, integration_id, entity_type, external_id, item.payload, metadata).insert(conn)
        })
        .await?;

        self.count += 1;
        if let Some(previous) = self.pending.replace(raw_id) {
            let first_item = !self.emitted_first;
            self.emitted_first = true;
            self.publish_transform(previous, first_item, false).await?;
        }
        Ok(())
    }
}
