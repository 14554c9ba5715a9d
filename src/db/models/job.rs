//! The Job Registry: `etl_jobs`, the durable state machine every worker and the
//! orchestrator read and CAS-update.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use uuid::Uuid;

use crate::error::{EtlError, Result};
use crate::job::watermark::WatermarkMap;
use crate::job::{OverallStatus, StepName, StepPlan, SubStatus, WorkerType};
use crate::schema::etl_jobs;
use crate::tenant::TenantId;

pub use crate::db::models::raw_record::RawId;

#[derive(Debug, Queryable, Identifiable)]
#[diesel(table_name = etl_jobs)]
#[diesel(primary_key(job_id))]
pub struct EtlJob {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    pub job_name: String,
    pub active: bool,
    pub schedule_interval_seconds: i64,
    pub next_run: DateTime<Utc>,
    pub overall_status: String,
    pub steps: serde_json::Value,
    pub retry_count: i32,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_finished: Option<DateTime<Utc>>,
    pub last_sync_watermark: serde_json::Value,
    pub error_message: Option<String>,
}

impl EtlJob {
    pub fn tenant(&self) -> TenantId {
        TenantId::new(self.tenant_id)
    }

    pub fn overall_status(&self) -> Result<OverallStatus> {
        self.overall_status.parse().map_err(EtlError::Other)
    }

    pub fn step_plan(&self) -> Result<StepPlan> {
        let steps = serde_json::from_value(self.steps.clone()).map_err(|e| EtlError::PermanentData(e.into()))?;
        StepPlan::new(steps).map_err(EtlError::PermanentData)
    }

    pub fn watermarks(&self) -> Result<WatermarkMap> {
        serde_json::from_value(self.last_sync_watermark.clone()).map_err(|e| EtlError::PermanentData(e.into()))
    }

    /// Jobs that are `active`, not currently `RUNNING`, and due (`next_run <= now`).
    /// Read-only; the orchestrator claims a job with [`EtlJob::begin_run`] before
    /// acting on it so two orchestrator instances never double-start a run.
    pub fn due_jobs(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<Vec<EtlJob>> {
        use crate::schema::etl_jobs::dsl;

        dsl::etl_jobs
            .filter(dsl::active.eq(true))
            .filter(dsl::overall_status.ne(OverallStatus::Running.as_str()))
            .filter(dsl::next_run.le(now))
            .load::<EtlJob>(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))
    }

    /// Jobs stuck `RUNNING` with no activity since `stale_before` — candidates for
    /// the reconciler to investigate (see the orchestrator's stale-run sweep).
    pub fn stale_running(conn: &mut PgConnection, stale_before: DateTime<Utc>) -> Result<Vec<EtlJob>> {
        use crate::schema::etl_jobs::dsl;

        dsl::etl_jobs
            .filter(dsl::overall_status.eq(OverallStatus::Running.as_str()))
            .filter(dsl::last_run_started.le(stale_before))
            .load::<EtlJob>(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))
    }

    /// Atomic claim: `{READY, COMPLETED, FAILED} -> RUNNING`, conditioned on the
    /// row still being in one of those statuses and on `steps` being unchanged
    /// since the read (the same optimistic CAS idiom as [`EtlJob::set_substatus`]).
    /// Resets every step's sub-statuses to `idle` as part of the same update, so a
    /// re-run starts clean rather than finding every step already `finished`.
    /// Returns `Ok(None)` if another orchestrator already claimed it (the CAS
    /// predicate matched zero rows) rather than erroring, so callers can simply
    /// skip it.
    pub fn begin_run(conn: &mut PgConnection, tenant: TenantId, job_id: Uuid, started_at: DateTime<Utc>) -> Result<Option<EtlJob>> {
        use crate::schema::etl_jobs::dsl;

        let current: EtlJob = match dsl::etl_jobs
            .filter(dsl::job_id.eq(job_id))
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .first(conn)
            .optional()
            .map_err(|e| EtlError::TransientInternal(e.into()))?
        {
            Some(job) => job,
            None => return Ok(None),
        };

        if current.overall_status()? == OverallStatus::Running {
            return Ok(None);
        }

        let old_steps = current.steps.clone();
        let mut plan = current.step_plan()?;
        for state in plan.iter_mut() {
            state.set_substatus(WorkerType::Extraction, SubStatus::Idle);
            state.set_substatus(WorkerType::Transform, SubStatus::Idle);
            state.set_substatus(WorkerType::Embedding, SubStatus::Idle);
        }
        let reset_steps = serde_json::to_value(&plan).map_err(|e| EtlError::Other(e.into()))?;

        diesel::update(
            dsl::etl_jobs
                .filter(dsl::job_id.eq(job_id))
                .filter(dsl::tenant_id.eq(tenant.as_uuid()))
                .filter(dsl::overall_status.ne(OverallStatus::Running.as_str()))
                .filter(dsl::steps.eq(old_steps)),
        )
        .set((
            dsl::overall_status.eq(OverallStatus::Running.as_str()),
            dsl::last_run_started.eq(started_at),
            dsl::error_message.eq(None::<String>),
            dsl::steps.eq(reset_steps),
        ))
        .get_result::<EtlJob>(conn)
        .optional()
        .map_err(|e| EtlError::TransientInternal(e.into()))
    }

    /// Atomic substatus write for one step. Re-reads the current `steps` JSON,
    /// applies the state-machine transition, and writes it back conditioned on the
    /// row being unchanged since the read (`steps = $old_steps`), giving
    /// optimistic CAS semantics without a dedicated version column. Callers should
    /// retry on `Ok(false)` per the transient-internal backoff policy.
    pub fn set_substatus(
        conn: &mut PgConnection,
        tenant: TenantId,
        job_id: Uuid,
        step: &StepName,
        worker_type: WorkerType,
        value: SubStatus,
    ) -> Result<bool> {
        use crate::schema::etl_jobs::dsl;

        let current: EtlJob = dsl::etl_jobs
            .filter(dsl::job_id.eq(job_id))
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .first(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))?;

        let old_steps = current.steps.clone();
        let mut plan = current.step_plan()?;
        let state = plan
            .get_mut(step)
            .ok_or_else(|| EtlError::PermanentData(anyhow::anyhow!("unknown step {}", step)))?;

        let prior = state.substatus(worker_type);
        if !prior.can_transition_to(value) {
            return Err(EtlError::PermanentData(anyhow::anyhow!(
                "illegal substatus transition for step {} ({:?}): {:?} -> {:?}",
                step,
                worker_type,
                prior,
                value
            )));
        }
        state.set_substatus(worker_type, value);

        let new_steps = serde_json::to_value(&plan).map_err(|e| EtlError::Other(e.into()))?;

        let updated = diesel::update(
            dsl::etl_jobs
                .filter(dsl::job_id.eq(job_id))
                .filter(dsl::tenant_id.eq(tenant.as_uuid()))
                .filter(dsl::steps.eq(old_steps)),
        )
        .set(dsl::steps.eq(new_steps))
        .execute(conn)
        .map_err(|e| EtlError::TransientInternal(e.into()))?;

        Ok(updated == 1)
    }

    /// Advance the watermark for `step`, CAS'd against the current watermark JSON
    /// the same way [`EtlJob::set_substatus`] CASes `steps`.
    pub fn advance_watermark(conn: &mut PgConnection, tenant: TenantId, job_id: Uuid, step: &StepName, to: DateTime<Utc>) -> Result<bool> {
        use crate::schema::etl_jobs::dsl;

        let current: EtlJob = dsl::etl_jobs
            .filter(dsl::job_id.eq(job_id))
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .first(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))?;

        let old_watermark = current.last_sync_watermark.clone();
        let mut watermarks = current.watermarks()?;
        watermarks.advance(step, to).map_err(EtlError::PermanentData)?;
        let new_watermark = serde_json::to_value(&watermarks).map_err(|e| EtlError::Other(e.into()))?;

        let updated = diesel::update(
            dsl::etl_jobs
                .filter(dsl::job_id.eq(job_id))
                .filter(dsl::tenant_id.eq(tenant.as_uuid()))
                .filter(dsl::last_sync_watermark.eq(old_watermark)),
        )
        .set(dsl::last_sync_watermark.eq(new_watermark))
        .execute(conn)
        .map_err(|e| EtlError::TransientInternal(e.into()))?;

        Ok(updated == 1)
    }

    /// Terminal transition: `RUNNING -> COMPLETED|FAILED`. On success, schedules
    /// `next_run` and resets `retry_count`; on failure, `next_run` is left
    /// untouched so an operator-triggered retry (or the next natural schedule
    /// hit) is what moves the job again, and `retry_count` is incremented. Also
    /// reachable from the reconciler acting on a stale run, so the current
    /// `overall_status` is not part of the CAS predicate here; the caller decides
    /// when this applies.
    pub fn complete(
        conn: &mut PgConnection,
        tenant: TenantId,
        job_id: Uuid,
        status: OverallStatus,
        finished_at: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<()> {
        use crate::schema::etl_jobs::dsl;

        let updated = match status {
            OverallStatus::Completed => {
                let next_run = next_run
                    .ok_or_else(|| EtlError::Other(anyhow::anyhow!("completing a job requires a next_run")))?;
                diesel::update(
                    dsl::etl_jobs
                        .filter(dsl::job_id.eq(job_id))
                        .filter(dsl::tenant_id.eq(tenant.as_uuid())),
                )
                .set((
                    dsl::overall_status.eq(status.as_str()),
                    dsl::last_run_finished.eq(finished_at),
                    dsl::next_run.eq(next_run),
                    dsl::retry_count.eq(0),
                    dsl::error_message.eq(error),
                ))
                .execute(conn)
            }
            _ => diesel::update(
                dsl::etl_jobs
                    .filter(dsl::job_id.eq(job_id))
                    .filter(dsl::tenant_id.eq(tenant.as_uuid())),
            )
            .set((
                dsl::overall_status.eq(status.as_str()),
                dsl::last_run_finished.eq(finished_at),
                dsl::retry_count.eq(dsl::retry_count + 1),
                dsl::error_message.eq(error),
            ))
            .execute(conn),
        }
        .map_err(|e| EtlError::TransientInternal(e.into()))?;

        if updated == 0 {
            return Err(EtlError::NotFound(format!("job {} for tenant {}", job_id, tenant)));
        }
        Ok(())
    }

    pub fn find(conn: &mut PgConnection, tenant: TenantId, job_id: Uuid) -> Result<EtlJob> {
        use crate::schema::etl_jobs::dsl;

        dsl::etl_jobs
            .filter(dsl::job_id.eq(job_id))
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .first::<EtlJob>(conn)
            .map_err(|_| EtlError::NotFound(format!("job {} for tenant {}", job_id, tenant)))
    }

    /// Force a job due now, for the manual-trigger API. A no-op (not an error)
    /// if the job is already `RUNNING`; the in-flight run is left alone.
    pub fn trigger(conn: &mut PgConnection, tenant: TenantId, job_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        use crate::schema::etl_jobs::dsl;

        let updated = diesel::update(
            dsl::etl_jobs
                .filter(dsl::job_id.eq(job_id))
                .filter(dsl::tenant_id.eq(tenant.as_uuid()))
                .filter(dsl::overall_status.ne(OverallStatus::Running.as_str())),
        )
        .set(dsl::next_run.eq(now))
        .execute(conn)
        .map_err(|e| EtlError::TransientInternal(e.into()))?;

        if updated == 0 {
            EtlJob::find(conn, tenant, job_id)?;
        }
        Ok(())
    }

    pub fn list_for_tenant(conn: &mut PgConnection, tenant: TenantId) -> Result<Vec<EtlJob>> {
        use crate::schema::etl_jobs::dsl;

        dsl::etl_jobs
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .order(dsl::job_name.asc())
            .load::<EtlJob>(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = etl_jobs)]
pub struct NewEtlJob {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    pub job_name: String,
    pub active: bool,
    pub schedule_interval_seconds: i64,
    pub next_run: DateTime<Utc>,
    pub overall_status: String,
    pub steps: serde_json::Value,
    pub retry_count: i32,
    pub last_sync_watermark: serde_json::Value,
}

impl NewEtlJob {
    pub fn insert(self, conn: &mut PgConnection) -> Result<EtlJob> {
        diesel::insert_into(etl_jobs::table)
            .values(&self)
            .get_result(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_etl_job_defaults_to_ready_with_zero_retries() {
        let job = NewEtlJob {
            job_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            job_name: "jira-sync".to_string(),
            active: true,
            schedule_interval_seconds: 900,
            next_run: Utc::now(),
            overall_status: OverallStatus::Ready.as_str().to_string(),
            steps: serde_json::json!([]),
            retry_count: 0,
            last_sync_watermark: serde_json::json!({}),
        };
        assert_eq!(job.overall_status, "READY");
        assert_eq!(job.retry_count, 0);
    }
}
