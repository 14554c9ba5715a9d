//! The Control API: the one surface an operator or another service uses to
//! inspect and nudge a tenant's jobs. Read paths go straight to the Job
//! Registry; the only mutation is `trigger`, which just sets `next_run` and
//! lets the orchestrator's own tick loop pick the job up — there is no
//! separate "start this job now" code path to keep in sync with it.

pub mod error;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;
use uuid::Uuid;

use crate::db::models::job::EtlJob;
use crate::db::models::raw_record::{ProcessingStatus, RawId, RawRecord};
use crate::db::{self, DbPool};
use crate::error::EtlError;
use crate::job::FlagBracket;
use crate::progress::ProgressChannel;
use crate::queue::{Envelope, MessageRef, Priority, QueueBroker, QueueName};
use crate::tenant::TenantId;

use self::error::ApiError;

#[derive(Clone)]
pub struct ApiState {
    pub pool: DbPool,
    pub broker: Arc<dyn QueueBroker>,
    pub progress: Arc<dyn ProgressChannel>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/trigger", post(trigger_job))
        .route("/jobs/stream", get(stream_jobs))
        .route("/admin/queues/:queue/dead-letters", get(list_dead_letters))
        .route("/admin/queues/:queue/dead-letters/:index/replay", post(replay_dead_letter))
        .route("/admin/raw-records/:raw_id/resync", post(resync_raw_record))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TenantQuery {
    tenant_id: Uuid,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    job_id: Uuid,
    job_name: String,
    active: bool,
    overall_status: String,
    next_run: chrono::DateTime<Utc>,
    last_run_started: Option<chrono::DateTime<Utc>>,
    last_run_finished: Option<chrono::DateTime<Utc>>,
    retry_count: i32,
    error_message: Option<String>,
    steps: serde_json::Value,
}

impl From<EtlJob> for JobResponse {
    fn from(job: EtlJob) -> Self {
        JobResponse {
            job_id: job.job_id,
            job_name: job.job_name,
            active: job.active,
            overall_status: job.overall_status,
            next_run: job.next_run,
            last_run_started: job.last_run_started,
            last_run_finished: job.last_run_finished,
            retry_count: job.retry_count,
            error_message: job.error_message,
            steps: job.steps,
        }
    }
}

async fn list_jobs(State(state): State<ApiState>, Query(q): Query<TenantQuery>) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let tenant = TenantId::new(q.tenant_id);
    let jobs = db::with_conn(state.pool, move |conn| EtlJob::list_for_tenant(conn, tenant)).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

async fn get_job(State(state): State<ApiState>, Path(job_id): Path<Uuid>, Query(q): Query<TenantQuery>) -> Result<Json<JobResponse>, ApiError> {
    let tenant = TenantId::new(q.tenant_id);
    let job = db::with_conn(state.pool, move |conn| EtlJob::find(conn, tenant, job_id)).await?;
    Ok(Json(job.into()))
}

async fn trigger_job(State(state): State<ApiState>, Path(job_id): Path<Uuid>, Query(q): Query<TenantQuery>) -> Result<StatusCode, ApiError> {
    let tenant = TenantId::new(q.tenant_id);
    let now = Utc::now();
    db::with_conn(state.pool, move |conn| EtlJob::trigger(conn, tenant, job_id, now)).await?;
    Ok(StatusCode::ACCEPTED)
}

/// A tenant-scoped live feed of job progress events, forwarded as they arrive
/// on the [`crate::progress::ProgressChannel`]. Best-effort: a lagging client
/// sees a gap, never a reconnect loop on its own account.
async fn stream_jobs(State(state): State<ApiState>, Query(q): Query<TenantQuery>, ws: WebSocketUpgrade) -> Response {
    let tenant = TenantId::new(q.tenant_id);
    ws.on_upgrade(move |socket| forward_progress(socket, state.progress, tenant))
}

async fn forward_progress(mut socket: WebSocket, progress: Arc<dyn ProgressChannel>, tenant: TenantId) {
    let rx = progress.subscribe(tenant);
    let mut stream = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            item = stream.next() => {
                match item {
                    Some(Ok(event)) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(p) => p,
                            Err(error) => {
                                warn!(error = %error, "failed to serialize progress event");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, tenant_id = %tenant, "progress stream subscriber lagged");
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct DeadLetterResponse {
    index: usize,
    envelope: Envelope,
}

async fn list_dead_letters(State(state): State<ApiState>, Path(queue): Path<String>) -> Result<Json<Vec<DeadLetterResponse>>, ApiError> {
    let queue: QueueName = queue.parse().map_err(EtlError::Configuration)?;
    let envelopes = state.broker.dead_letters(queue).await.map_err(EtlError::TransientExternal)?;
    Ok(Json(
        envelopes
            .into_iter()
            .enumerate()
            .map(|(index, envelope)| DeadLetterResponse { index, envelope })
            .collect(),
    ))
}

async fn replay_dead_letter(State(state): State<ApiState>, Path((queue, index)): Path<(String, usize)>) -> Result<StatusCode, ApiError> {
    let queue: QueueName = queue.parse().map_err(EtlError::Configuration)?;
    state.broker.replay_dead_letter(queue, index).await.map_err(EtlError::TransientExternal)?;
    Ok(StatusCode::ACCEPTED)
}

/// Reset a raw record to `pending` and republish it onto the transform queue
/// directly, bypassing the job run it originally arrived on. Used to recover
/// from a transform bug fixed after the record was dead-lettered. Not tied to
/// any particular job run, so the republished envelope carries a nil job id
/// and every flag bracket bit false: nothing in the transform worker's job-state
/// handling fires for it.
async fn resync_raw_record(State(state): State<ApiState>, Path(raw_id): Path<RawId>, Query(q): Query<TenantQuery>) -> Result<StatusCode, ApiError> {
    let tenant = TenantId::new(q.tenant_id);
    let pool = state.pool.clone();
    let record = db::with_conn(pool.clone(), move |conn| RawRecord::load(conn, tenant, raw_id)).await?;

    db::with_conn(pool, move |conn| RawRecord::mark(conn, tenant, raw_id, ProcessingStatus::Pending, None)).await?;

    let envelope = Envelope {
        tenant_id: tenant,
        integration_id: record.integration_id,
        job_id: Uuid::nil(),
        step_name: record.entity_type.clone(),
        entity_type: record.entity_type,
        message_ref: MessageRef::Transform(raw_id),
        flags: FlagBracket {
            first_item: false,
            last_item: false,
            last_job_item: false,
        },
        attempt: 0,
        enqueued_at: Utc::now(),
        priority: Priority::LOW,
    };

    state.broker.publish(QueueName::Transform, envelope).await.map_err(EtlError::TransientExternal)?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_response_serializes_index_and_envelope() {
        let envelope = Envelope {
            tenant_id: TenantId::new(Uuid::new_v4()),
            integration_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            step_name: "issues".to_string(),
            entity_type: "jira_issues".to_string(),
            message_ref: MessageRef::Sentinel,
            flags: FlagBracket::single(true),
            attempt: 0,
            enqueued_at: Utc::now(),
            priority: Priority::DEFAULT,
        };
        let response = DeadLetterResponse { index: 0, envelope };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"index\":0"));
    }
}
