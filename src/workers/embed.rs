//! Embed workers: turn a finalized target row into a vector, and close out
//! the job when the last one lands.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::db::models::job::EtlJob;
use crate::db::models::target::{Comment, Commit, EmbeddingText, Project, PullRequest, Review, WorkItem};
use crate::db::{self, DbConn};
use crate::error::{EtlError, Result};
use crate::job::{StepName, SubStatus, WorkerType};
use crate::progress::{ProgressChannel, ProgressEvent};
use crate::provider::EmbeddingProvider;
use crate::queue::{Delivery, Envelope, MessageRef, NackDecision, QueueBroker, QueueName};
use crate::tenant::TenantId;
use crate::vector::{collection_name, VectorStore};

use super::{Disposition, WorkerContext};

pub struct EmbedWorker {
    ctx: WorkerContext,
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl EmbedWorker {
    pub fn new(ctx: WorkerContext, provider: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        EmbedWorker { ctx, provider, store }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let delivery = self.ctx.broker.consume(QueueName::Embed).await.map_err(EtlError::TransientExternal)?;
            let Some(delivery) = delivery else { continue };
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.handle(delivery).await;
            });
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let envelope = delivery.envelope.clone();
        let span = info_span!("embed", job_id = %envelope.job_id, step = %envelope.step_name, tenant_id = %envelope.tenant_id);
        let outcome = self.process(&envelope).instrument(span).await;

        match outcome {
            Ok(()) => {
                let _ = self.ctx.broker.ack(QueueName::Embed, delivery.lease).await;
            }
            Err(error) => {
                warn!(error = %error, "embed message failed");
                match Disposition::for_error(&error, envelope.attempt, self.ctx.config.max_retries()) {
                    Disposition::Ack => {
                        let _ = self.ctx.broker.ack(QueueName::Embed, delivery.lease).await;
                    }
                    Disposition::Nack(decision) => {
                        if decision == NackDecision::DeadLetter {
                            self.fail_job(&envelope, &error).await;
                        }
                        let _ = self.ctx.broker.nack(QueueName::Embed, delivery.lease, decision).await;
                    }
                }
            }
        }
    }

    async fn process(&self, envelope: &Envelope) -> Result<()> {
        let tenant = envelope.tenant_id;
        let job_id = envelope.job_id;
        let step_name = StepName::from(envelope.step_name.as_str());

        if envelope.flags.first_item {
            self.set_substatus(tenant, job_id, &step_name, SubStatus::Running).await?;
            self.publish_progress(tenant, job_id, &step_name, SubStatus::Running);
        }

        match &envelope.message_ref {
            MessageRef::Embed { target_table, external_id } => {
                let text = load_embedding_text(self.ctx.pool.clone(), tenant, target_table.clone(), external_id.clone()).await?;
                let vector = self.provider.embed(&text, tenant).await?;
                let collection = collection_name(tenant, &envelope.entity_type);
                self.store.upsert(tenant, &collection, external_id, vector).await?;
            }
            MessageRef::Sentinel => {}
            _ => return Err(EtlError::PermanentData(anyhow::anyhow!("embed message carried an unexpected ref"))),
        }

        if envelope.flags.last_item {
            self.set_substatus(tenant, job_id, &step_name, SubStatus::Finished).await?;
            self.publish_progress(tenant, job_id, &step_name, SubStatus::Finished);
        }

        if envelope.flags.last_job_item {
            self.maybe_complete_job(tenant, job_id).await?;
        }

        Ok(())
    }

    fn publish_progress(&self, tenant: TenantId, job_id: Uuid, step_name: &StepName, value: SubStatus) {
        self.ctx.progress.publish(
            tenant,
            ProgressEvent {
                job_id,
                step_name: step_name.0.clone(),
                worker_type: WorkerType::Embedding,
                value,
                ts: Utc::now(),
            },
        );
    }

    /// `last_job_item` only tells us this was the last message of the last
    /// step; other steps may still be mid-flight, so the job only completes
    /// once every step's embedding sub-status has actually finished.
    async fn maybe_complete_job(&self, tenant: TenantId, job_id: Uuid) -> Result<()> {
        let job = db::with_conn(self.ctx.pool.clone(), move |conn| EtlJob::find(conn, tenant, job_id)).await?;
        let plan = job.step_plan()?;
        if !plan.all_steps_embedding_finished() {
            return Ok(());
        }

        let started = job.last_run_started.unwrap_or_else(Utc::now);
        let next_run = started + chrono::Duration::seconds(job.schedule_interval_seconds);
        db::with_conn(self.ctx.pool.clone(), move |conn| {
            EtlJob::complete(conn, tenant, job_id, crate::job::OverallStatus::Completed, Utc::now(), Some(next_run), None)
        })
        .await?;

        self.ctx.progress.publish(
            tenant,
            ProgressEvent {
                job_id,
                step_name: String::new(),
                worker_type: WorkerType::Embedding,
                value: SubStatus::Finished,
                ts: Utc::now(),
            },
        );
        info!("job run completed");
        Ok(())
    }

    async fn set_substatus(&self, tenant: TenantId, job_id: Uuid, step_name: &StepName, value: SubStatus) -> Result<()> {
        for attempt in 0..5 {
            let step = step_name.clone();
            let pool = self.ctx.pool.clone();
            let applied = db::with_conn(pool, move |conn| EtlJob::set_substatus(conn, tenant, job_id, &step, WorkerType::Embedding, value)).await?;
            if applied {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10 * (attempt + 1))).await;
        }
        Err(EtlError::TransientInternal(anyhow::anyhow!("set_substatus CAS did not converge for step {}", step_name)))
    }

    async fn fail_job(&self, envelope: &Envelope, error: &EtlError) {
        let tenant = envelope.tenant_id;
        let job_id = envelope.job_id;
        let step_name = StepName::from(envelope.step_name.as_str());
        let message = error.truncated_message(2000);

        let _ = db::with_conn(self.ctx.pool.clone(), move |conn| {
            EtlJob::set_substatus(conn, tenant, job_id, &step_name, WorkerType::Embedding, SubStatus::Failed)
        })
        .await;

        let _ = db::with_conn(self.ctx.pool.clone(), move |conn| {
            EtlJob::complete(conn, tenant, job_id, crate::job::OverallStatus::Failed, Utc::now(), None, Some(&message))
        })
        .await;
    }
}

/// Dispatch on `target_table` to the right Queryable row and render its
/// embedding text. Unknown table names are a permanent data error: they can
/// only come from a bug in the transform worker that produced this message.
async fn load_embedding_text(pool: crate::db::DbPool, tenant: TenantId, target_table: String, external_id: String) -> Result<String> {
    db::with_conn(pool, move |conn| load_embedding_text_sync(conn, tenant, &target_table, &external_id)).await
}

fn load_embedding_text_sync(conn: &mut DbConn, tenant: TenantId, target_table: &str, external_id: &str) -> Result<String> {
    match target_table {
        "work_items" => WorkItem::find(conn, tenant, external_id).map(|row| row.embedding_text()),
        "projects" => Project::find(conn, tenant, external_id).map(|row| row.embedding_text()),
        "prs" => PullRequest::find(conn, tenant, external_id).map(|row| row.embedding_text()),
        "commits" => Commit::find(conn, tenant, external_id).map(|row| row.embedding_text()),
        "reviews" => Review::find(conn, tenant, external_id).map(|row| row.embedding_text()),
        "comments" => Comment::find(conn, tenant, external_id).map(|row| row.embedding_text()),
        other => Err(EtlError::PermanentData(anyhow::anyhow!("no embedding text mapping for target table {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_embedding_text_includes_summary_and_status() {
        let item = crate::db::models::target::WorkItem {
            external_id: "PROJ-1".to_string(),
            tenant_id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            key: "PROJ-1".to_string(),
            summary: "Fix the thing".to_string(),
            description: Some("Longer description".to_string()),
            status: "Open".to_string(),
            assignee: None,
            priority: None,
            issue_type: Some("Bug".to_string()),
            project: None,
            custom_field_01: None,
            custom_field_02: None,
            custom_field_03: None,
            custom_field_04: None,
            custom_field_05: None,
            custom_field_06: None,
            custom_field_07: None,
            custom_field_08: None,
            custom_field_09: None,
            custom_field_10: None,
            custom_field_11: None,
            custom_field_12: None,
            custom_field_13: None,
            custom_field_14: None,
            custom_field_15: None,
            custom_field_16: None,
            custom_field_17: None,
            custom_field_18: None,
            custom_field_19: None,
            custom_field_20: None,
            custom_fields_overflow: serde_json::json!({}),
            created_at: Utc::now(),
            last_updated_at: Utc::now(),
        };
        let text = item.embedding_text();
        assert!(text.contains("Fix the thing"));
        assert!(text.contains("status: Open"));
        assert!(text.contains("type: Bug"));
    }
}
