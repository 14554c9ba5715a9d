//! The Orchestrator: the only component that starts a job run. It ticks on an
//! interval, claims due jobs, and publishes the first `extract` message; every
//! later message in a run is produced by the worker that handled the previous
//! one (see the Queue Broker's message-chaining design). It also reconciles
//! runs that got stuck.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::db::models::integration::Integration;
use crate::db::models::job::EtlJob;
use crate::db::{self, DbPool};
use crate::error::{EtlError, Result};
use crate::job::{FlagBracket, OverallStatus};
use crate::progress::{ProgressChannel, ProgressEvent};
use crate::queue::{Envelope, ExtractParams, MessageRef, Priority, QueueBroker, QueueName};
use crate::tenant::TenantId;

pub struct Orchestrator {
    pool: DbPool,
    broker: Arc<dyn QueueBroker>,
    progress: Arc<dyn ProgressChannel>,
    tick_interval: Duration,
    runaway_threshold: chrono::Duration,
    default_batch_size: usize,
    extract_queue_hwm: usize,
    extract_queue_lwm: usize,
}

impl Orchestrator {
    pub fn new(
        pool: DbPool,
        broker: Arc<dyn QueueBroker>,
        progress: Arc<dyn ProgressChannel>,
        tick_interval: Duration,
        runaway_threshold: Duration,
        default_batch_size: usize,
        extract_queue_hwm: usize,
        extract_queue_lwm: usize,
    ) -> Self {
        Orchestrator {
            pool,
            broker,
            progress,
            tick_interval,
            runaway_threshold: chrono::Duration::from_std(runaway_threshold).unwrap_or(chrono::Duration::seconds(21_600)),
            default_batch_size,
            extract_queue_hwm,
            extract_queue_lwm,
        }
    }

    /// Run forever: one tick, then sleep, repeat. Never returns under normal
    /// operation; a tick's own errors are logged and swallowed so one bad job
    /// doesn't stall every other tenant's schedule.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut paused = false;
        loop {
            if paused {
                paused = !self.below_low_watermark().await;
            } else if self.above_high_watermark().await {
                warn!("extract queue above high watermark, pausing new job claims");
                paused = true;
            }

            if !paused {
                if let Err(error) = self.tick().instrument(info_span!("orchestrator_tick")).await {
                    error!(error = %error, "orchestrator tick failed");
                }
            }

            tokio::time::sleep(self.tick_interval).await;
        }
    }

    async fn above_high_watermark(&self) -> bool {
        matches!(self.broker.depth(QueueName::Extract).await, Ok(depth) if depth.total() > self.extract_queue_hwm)
    }

    async fn below_low_watermark(&self) -> bool {
        matches!(self.broker.depth(QueueName::Extract).await, Ok(depth) if depth.total() <= self.extract_queue_lwm)
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let due = db::with_conn(self.pool.clone(), move |conn| EtlJob::due_jobs(conn, now)).await?;
        for job in due {
            let tenant = job.tenant();
            let job_id = job.job_id;
            if let Err(error) = self.start_run(tenant, job_id, now).await {
                warn!(error = %error, job_id = %job_id, "failed to start job run");
            }
        }

        self.reconcile_stale_runs(now).await?;
        Ok(())
    }

    /// Claim `job_id` (`READY -> RUNNING`) and publish the first `extract`
    /// message for its first step. If the claim loses the race to another
    /// orchestrator instance, this is a silent no-op. If publishing fails
    /// after the claim succeeded, the claim is compensated back to `FAILED`
    /// rather than left `RUNNING` with nothing behind it.
    async fn start_run(&self, tenant: TenantId, job_id: Uuid, now: chrono::DateTime<Utc>) -> Result<()> {
        let claimed = db::with_conn(self.pool.clone(), move |conn| EtlJob::begin_run(conn, tenant, job_id, now)).await?;
        let Some(job) = claimed else { return Ok(()) };

        let plan = job.step_plan()?;
        let Some(first_step) = plan.first() else {
            return db::with_conn(self.pool.clone(), move |conn| {
                EtlJob::complete(conn, tenant, job_id, OverallStatus::Completed, now, Some(now), None)
            })
            .await;
        };

        let integration_id = job.integration_id;
        let watermark = job.watermarks()?.get(&first_step.name);
        let single_step = plan.len() == 1;

        let envelope = Envelope {
            tenant_id: tenant,
            integration_id,
            job_id,
            step_name: first_step.name.0.clone(),
            entity_type: first_step.name.0.clone(),
            message_ref: MessageRef::Extract(ExtractParams {
                entity_type: first_step.name.0.clone(),
                watermark,
                run_started_at: now,
                batch_size: self.default_batch_size,
            }),
            flags: FlagBracket::single(single_step),
            attempt: 0,
            enqueued_at: now,
            priority: Priority::DEFAULT,
        };

        match self.broker.publish(QueueName::Extract, envelope).await {
            Ok(()) => {
                info!(job_id = %job_id, tenant_id = %tenant, "job run started");
                self.progress.publish(
                    tenant,
                    ProgressEvent {
                        job_id,
                        step_name: first_step.name.0.clone(),
                        worker_type: crate::job::WorkerType::Extraction,
                        value: crate::job::SubStatus::Idle,
                        ts: now,
                    },
                );
                Ok(())
            }
            Err(publish_error) => {
                let message = format!("failed to publish initial extract message: {}", publish_error);
                db::with_conn(self.pool.clone(), move |conn| {
                    EtlJob::complete(conn, tenant, job_id, OverallStatus::Failed, now, None, Some(&message))
                })
                .await?;
                Err(EtlError::TransientExternal(publish_error))
            }
        }
    }

    /// Jobs stuck `RUNNING` for longer than `runaway_threshold` get failed so
    /// they become claimable again (via [`EtlJob::begin_run`]'s widened CAS)
    /// rather than left wedged forever; `next_run` is preserved, same as any
    /// other `FAILED` transition, so an operator can also retrigger manually.
    async fn reconcile_stale_runs(&self, now: chrono::DateTime<Utc>) -> Result<()> {
        let stale_before = now - self.runaway_threshold;
        let stale = db::with_conn(self.pool.clone(), move |conn| EtlJob::stale_running(conn, stale_before)).await?;
        for job in stale {
            let tenant = job.tenant();
            let job_id = job.job_id;
            warn!(job_id = %job_id, tenant_id = %tenant, "reconciling stale run");
            let result = db::with_conn(self.pool.clone(), move |conn| {
                EtlJob::complete(conn, tenant, job_id, OverallStatus::Failed, now, None, Some("run exceeded runaway threshold"))
            })
            .await;
            if let Err(error) = result {
                warn!(error = %error, job_id = %job_id, "failed to reconcile stale run");
            }
        }
        Ok(())
    }

    /// Kick off discovery for an integration outside the regular run cycle
    /// (an operator action, not part of the tick loop); updates the custom
    /// field and issue type catalogs directly rather than through a job run.
    pub async fn run_discovery(&self, adapters: &crate::workers::AdapterRegistry, tenant: TenantId, integration_id: Uuid) -> Result<()> {
        let integration = db::with_conn(self.pool.clone(), move |conn| Integration::find(conn, tenant, integration_id)).await?;
        let provider = integration.provider().map_err(EtlError::Configuration)?;
        let adapter = adapters
            .get(provider.as_str())
            .cloned()
            .ok_or_else(|| EtlError::Configuration(anyhow::anyhow!("no adapter registered for provider {}", provider.as_str())))?;

        let discovery = adapter.discover(&integration).await?;
        db::with_conn(self.pool.clone(), move |conn| {
            for field in &discovery.custom_fields {
                crate::db::models::catalog::NewCustomFieldCatalogEntry::seen_now(
                    tenant,
                    field.project_external_id.clone(),
                    field.source_field_id.clone(),
                    field.display_name.clone(),
                )
                .record_sighting(conn)?;
            }
            for issue_type in &discovery.issue_types {
                crate::db::models::catalog::NewIssueTypeCatalogEntry::seen_now(
                    tenant,
                    issue_type.project_external_id.clone(),
                    issue_type.issue_type_id.clone(),
                    issue_type.display_name.clone(),
                )
                .record_sighting(conn)?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_step_job_sets_last_job_item_on_the_one_flag_bracket() {
        let flags = FlagBracket::single(true);
        assert!(flags.first_item);
        assert!(flags.last_item);
        assert!(flags.last_job_item);
    }
}
