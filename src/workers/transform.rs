//! Transform workers: map raw payloads to target rows; drive embedding.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::adapters::{github, jira};
use crate::db::models::catalog::{NewCustomFieldCatalogEntry, NewIssueTypeCatalogEntry};
use crate::db::models::integration::{CustomFieldMappings, Integration};
use crate::db::models::job::EtlJob;
use crate::db::models::raw_record::{ProcessingStatus, RawRecord};
use crate::db::models::target::{NewComment, NewCommit, NewProject, NewPullRequest, NewReview, NewWorkItem};
use crate::db::{self, DbConn};
use crate::error::{EtlError, Result};
use crate::job::{StepName, SubStatus, WorkerType};
use crate::progress::{ProgressChannel, ProgressEvent};
use crate::queue::{Delivery, Envelope, MessageRef, NackDecision, Priority, QueueBroker, QueueName};
use crate::tenant::TenantId;

use super::{Disposition, WorkerContext};

pub struct TransformWorker {
    ctx: WorkerContext,
}

impl TransformWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        TransformWorker { ctx }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let delivery = self.ctx.broker.consume(QueueName::Transform).await.map_err(EtlError::TransientExternal)?;
            let Some(delivery) = delivery else { continue };
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.handle(delivery).await;
            });
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let envelope = delivery.envelope.clone();
        let span = info_span!("transform", job_id = %envelope.job_id, step = %envelope.step_name, tenant_id = %envelope.tenant_id);
        let outcome = self.process(&envelope).instrument(span).await;

        match outcome {
            Ok(()) => {
                let _ = self.ctx.broker.ack(QueueName::Transform, delivery.lease).await;
            }
            Err(error) => {
                warn!(error = %error, "transform message failed");
                match Disposition::for_error(&error, envelope.attempt, self.ctx.config.max_retries()) {
                    Disposition::Ack => {
                        let _ = self.ctx.broker.ack(QueueName::Transform, delivery.lease).await;
                    }
                    Disposition::Nack(decision) => {
                        if decision == NackDecision::DeadLetter {
                            self.fail_job(&envelope, &error).await;
                        }
                        let _ = self.ctx.broker.nack(QueueName::Transform, delivery.lease, decision).await;
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
            self.ctx.progress.publish(
                tenant,
                ProgressEvent {
                    job_id,
                    step_name: step_name.0.clone(),
                    worker_type: WorkerType::Transform,
                    value: SubStatus::Running,
                    ts: Utc::now(),
                },
            );
        }

        let target_ref = match &envelope.message_ref {
            MessageRef::Transform(raw_id) => {
                let raw_id = *raw_id;
                let entity_type = envelope.entity_type.clone();
                let integration_id = envelope.integration_id;

                let target = db::with_conn(self.ctx.pool.clone(), move |conn| {
                    let raw = RawRecord::load(conn, tenant, raw_id)?;
                    if raw.tenant() != tenant {
                        return Err(EtlError::TenantMismatch { expected_tenant: tenant, message_tenant: raw.tenant() });
                    }
                    let integration = Integration::find(conn, tenant, integration_id)?;

                    // Duplicate delivery: a row already marked transformed is a
                    // no-op upsert, not a re-run.
                    if matches!(raw.status(), Ok(ProcessingStatus::Transformed)) {
                        return Ok(None);
                    }

                    match transform_and_upsert(conn, tenant, &integration, &entity_type, &raw) {
                        Ok(target) => {
                            RawRecord::mark(conn, tenant, raw_id, ProcessingStatus::Transformed, None)?;
                            Ok(Some(target))
                        }
                        Err(error) => {
                            let message = error.truncated_message(2000);
                            RawRecord::mark(conn, tenant, raw_id, ProcessingStatus::Failed, Some(&message))?;
                            Err(error)
                        }
                    }
                })
                .await?;
                target
            }
            MessageRef::Sentinel => None,
            _ => return Err(EtlError::PermanentData(anyhow::anyhow!("transform message carried an unexpected ref"))),
        };

        let (target_table, external_id) = target_ref.unwrap_or((String::new(), String::new()));
        let message_ref = if target_table.is_empty() {
            MessageRef::Sentinel
        } else {
            MessageRef::Embed { target_table, external_id }
        };

        self.ctx
            .broker
            .publish(
                QueueName::Embed,
                Envelope {
                    tenant_id: tenant,
                    integration_id: envelope.integration_id,
                    job_id,
                    step_name: step_name.0.clone(),
                    entity_type: envelope.entity_type.clone(),
                    message_ref,
                    flags: envelope.flags,
                    attempt: 0,
                    enqueued_at: Utc::now(),
                    priority: Priority::DEFAULT,
                },
            )
            .await
            .map_err(EtlError::TransientExternal)?;

        if envelope.flags.last_item {
            self.set_substatus(tenant, job_id, &step_name, SubStatus::Finished).await?;
            self.ctx.progress.publish(
                tenant,
                ProgressEvent {
                    job_id,
                    step_name: step_name.0.clone(),
                    worker_type: WorkerType::Transform,
                    value: SubStatus::Finished,
                    ts: Utc::now(),
                },
            );
        }

        Ok(())
    }

    async fn set_substatus(&self, tenant: TenantId, job_id: Uuid, step_name: &StepName, value: SubStatus) -> Result<()> {
        for attempt in 0..5 {
            let step = step_name.clone();
            let pool = self.ctx.pool.clone();
            let applied = db::with_conn(pool, move |conn| EtlJob::set_substatus(conn, tenant, job_id, &step, WorkerType::Transform, value)).await?;
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
            EtlJob::set_substatus(conn, tenant, job_id, &step_name, WorkerType::Transform, SubStatus::Failed)
        })
        .await;

        let _ = db::with_conn(self.ctx.pool.clone(), move |conn| {
            EtlJob::complete(conn, tenant, job_id, crate::job::OverallStatus::Failed, Utc::now(), None, Some(&message))
        })
        .await;
    }
}

/// Dispatch to the entity-specific mapping, upsert the result, and return
/// `(target_table, external_id)` for the downstream embed message.
fn transform_and_upsert(conn: &mut DbConn, tenant: TenantId, integration: &Integration, entity_type: &str, raw: &RawRecord) -> Result<(String, String)> {
    match entity_type {
        jira::ENTITY_ISSUES => {
            let mappings = integration.custom_field_mappings().map_err(EtlError::Configuration)?;
            record_jira_discovery(conn, tenant, &raw.payload)?;
            let row = jira_issue_to_work_item(tenant, integration.integration_id, &raw.payload, &mappings)?;
            let external_id = row.external_id.clone();
            row.upsert(conn)?;
            Ok(("work_items".to_string(), external_id))
        }
        jira::ENTITY_PROJECTS => {
            let row = jira_project_to_project(tenant, integration.integration_id, &raw.payload)?;
            let external_id = row.external_id.clone();
            row.upsert(conn)?;
            Ok(("projects".to_string(), external_id))
        }
        jira::ENTITY_COMMENTS => Err(EtlError::PermanentData(anyhow::anyhow!("jira comments are not staged as standalone raw records in this version"))),
        github::ENTITY_PRS => {
            let row = github_pr_to_row(tenant, integration.integration_id, &raw.payload)?;
            let external_id = row.external_id.clone();
            row.upsert(conn)?;
            Ok(("prs".to_string(), external_id))
        }
        github::ENTITY_COMMITS => {
            let row = github_commit_to_row(tenant, integration.integration_id, &raw.payload)?;
            let external_id = row.external_id.clone();
            row.upsert(conn)?;
            Ok(("commits".to_string(), external_id))
        }
        github::ENTITY_REVIEWS => {
            let row = github_review_to_row(tenant, integration.integration_id, &raw.payload)?;
            let external_id = row.external_id.clone();
            row.upsert(conn)?;
            Ok(("reviews".to_string(), external_id))
        }
        github::ENTITY_COMMENTS => {
            let row = github_comment_to_row(tenant, integration.integration_id, &raw.payload)?;
            let external_id = row.external_id.clone();
            row.upsert(conn)?;
            Ok(("comments".to_string(), external_id))
        }
        other => Err(EtlError::PermanentData(anyhow::anyhow!("no transform mapping for entity type {}", other))),
    }
}

fn require_str(payload: &Value, pointer: &str) -> Result<String> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EtlError::PermanentData(anyhow::anyhow!("payload missing required field at {}", pointer)))
}

fn opt_str(payload: &Value, pointer: &str) -> Option<String> {
    payload.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

/// Collapse a Jira field value per the mapping policy: scalars pass through,
/// objects use their `value` sub-field, arrays join `value` strings with
/// `", "`.
fn stringify_field_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("value").and_then(Value::as_str).map(str::to_string),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    item.get("value")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| item.as_str().map(str::to_string))
                })
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
    }
}

fn jira_issue_to_work_item(tenant: TenantId, integration_id: Uuid, payload: &Value, mappings: &CustomFieldMappings) -> Result<NewWorkItem> {
    let external_id = require_str(payload, "/key")?;
    let fields = payload.get("fields").ok_or_else(|| EtlError::PermanentData(anyhow::anyhow!("issue payload missing fields")))?;

    let mut slots: [Option<String>; 20] = Default::default();
    let mut overflow = serde_json::Map::new();

    if let Value::Object(field_map) = fields {
        for (key, value) in field_map {
            if !key.starts_with("customfield_") {
                continue;
            }
            match mappings.slot_for_source_field(key) {
                Some(slot) => slots[(slot.0 - 1) as usize] = stringify_field_value(value),
                None => {
                    if !value.is_null() {
                        overflow.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    Ok(NewWorkItem {
        external_id,
        tenant_id: *tenant.as_uuid(),
        integration_id,
        key: opt_str(payload, "/key").unwrap_or_default(),
        summary: opt_str(fields, "/summary").unwrap_or_default(),
        description: fields.get("description").and_then(Value::as_str).map(str::to_string),
        status: fields.pointer("/status/name").and_then(Value::as_str).unwrap_or("unknown").to_string(),
        assignee: fields.pointer("/assignee/displayName").and_then(Value::as_str).map(str::to_string),
        priority: fields.pointer("/priority/name").and_then(Value::as_str).map(str::to_string),
        issue_type: fields.pointer("/issuetype/name").and_then(Value::as_str).map(str::to_string),
        project: fields.pointer("/project/key").and_then(Value::as_str).map(str::to_string),
        custom_field_01: slots[0].take(),
        custom_field_02: slots[1].take(),
        custom_field_03: slots[2].take(),
        custom_field_04: slots[3].take(),
        custom_field_05: slots[4].take(),
        custom_field_06: slots[5].take(),
        custom_field_07: slots[6].take(),
        custom_field_08: slots[7].take(),
        custom_field_09: slots[8].take(),
        custom_field_10: slots[9].take(),
        custom_field_11: slots[10].take(),
        custom_field_12: slots[11].take(),
        custom_field_13: slots[12].take(),
        custom_field_14: slots[13].take(),
        custom_field_15: slots[14].take(),
        custom_field_16: slots[15].take(),
        custom_field_17: slots[16].take(),
        custom_field_18: slots[17].take(),
        custom_field_19: slots[18].take(),
        custom_field_20: slots[19].take(),
        custom_fields_overflow: Value::Object(overflow),
        last_updated_at: Utc::now(),
    })
}

/// Record every custom field and issue type this issue mentions into the
/// discovery catalogs, so an operator can later configure mappings without
/// guessing field ids from raw payloads.
fn record_jira_discovery(conn: &mut DbConn, tenant: TenantId, payload: &Value) -> Result<()> {
    let project = payload.pointer("/fields/project/key").and_then(Value::as_str).unwrap_or("UNKNOWN");
    if let Some(Value::Object(field_map)) = payload.get("fields") {
        for (key, _) in field_map {
            if key.starts_with("customfield_") {
                let display_name = payload
                    .pointer(&format!("/names/{}", key))
                    .and_then(Value::as_str)
                    .unwrap_or(key)
                    .to_string();
                NewCustomFieldCatalogEntry::seen_now(tenant, project, key.clone(), display_name).record_sighting(conn)?;
            }
        }
    }
    if let Some(issue_type) = payload.pointer("/fields/issuetype/name").and_then(Value::as_str) {
        let issue_type_id = payload.pointer("/fields/issuetype/id").and_then(Value::as_str).unwrap_or(issue_type);
        NewIssueTypeCatalogEntry::seen_now(tenant, project, issue_type_id, issue_type).record_sighting(conn)?;
    }
    Ok(())
}

fn jira_project_to_project(tenant: TenantId, integration_id: Uuid, payload: &Value) -> Result<NewProject> {
    Ok(NewProject {
        external_id: require_str(payload, "/key")?,
        tenant_id: *tenant.as_uuid(),
        integration_id,
        name: opt_str(payload, "/name").unwrap_or_default(),
        last_updated_at: Utc::now(),
    })
}

fn github_pr_to_row(tenant: TenantId, integration_id: Uuid, payload: &Value) -> Result<NewPullRequest> {
    let external_id = payload.get("id").map(|v| v.to_string()).ok_or_else(|| EtlError::PermanentData(anyhow::anyhow!("pr payload missing id")))?;
    Ok(NewPullRequest {
        external_id,
        tenant_id: *tenant.as_uuid(),
        integration_id,
        title: opt_str(payload, "/title").unwrap_or_default(),
        state: opt_str(payload, "/state").unwrap_or_default(),
        author: payload.pointer("/user/login").and_then(Value::as_str).map(str::to_string),
        repo: payload.pointer("/base/repo/full_name").and_then(Value::as_str).unwrap_or_default().to_string(),
        last_updated_at: Utc::now(),
    })
}

fn github_commit_to_row(tenant: TenantId, integration_id: Uuid, payload: &Value) -> Result<NewCommit> {
    let external_id = require_str(payload, "/sha")?;
    Ok(NewCommit {
        external_id,
        tenant_id: *tenant.as_uuid(),
        integration_id,
        parent_external_id: payload.pointer("/parents/0/sha").and_then(Value::as_str).map(str::to_string),
        message: payload.pointer("/commit/message").and_then(Value::as_str).unwrap_or_default().to_string(),
        author: payload.pointer("/commit/author/name").and_then(Value::as_str).map(str::to_string),
        last_updated_at: Utc::now(),
    })
}

fn github_review_to_row(tenant: TenantId, integration_id: Uuid, payload: &Value) -> Result<NewReview> {
    let external_id = payload.get("id").map(|v| v.to_string()).ok_or_else(|| EtlError::PermanentData(anyhow::anyhow!("review payload missing id")))?;
    Ok(NewReview {
        external_id,
        tenant_id: *tenant.as_uuid(),
        integration_id,
        parent_external_id: payload.pointer("/pull_request_url").and_then(Value::as_str).map(|url| url.rsplit('/').next().unwrap_or(url).to_string()),
        state: opt_str(payload, "/state").unwrap_or_default(),
        author: payload.pointer("/user/login").and_then(Value::as_str).map(str::to_string),
        last_updated_at: Utc::now(),
    })
}

fn github_comment_to_row(tenant: TenantId, integration_id: Uuid, payload: &Value) -> Result<NewComment> {
    let external_id = payload.get("id").map(|v| v.to_string()).ok_or_else(|| EtlError::PermanentData(anyhow::anyhow!("comment payload missing id")))?;
    Ok(NewComment {
        external_id,
        tenant_id: *tenant.as_uuid(),
        integration_id,
        parent_external_id: payload.pointer("/issue_url").and_then(Value::as_str).map(|url| url.rsplit('/').next().unwrap_or(url).to_string()),
        body: opt_str(payload, "/body").unwrap_or_default(),
        author: payload.pointer("/user/login").and_then(Value::as_str).map(str::to_string),
        last_updated_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn stringify_field_value_collapses_object_to_value() {
        let v = serde_json::json!({"value": "High", "id": "3"});
        assert_eq!(stringify_field_value(&v), Some("High".to_string()));
    }

    #[test]
    fn stringify_field_value_joins_array_values() {
        let v = serde_json::json!([{"value": "a"}, {"value": "b"}]);
        assert_eq!(stringify_field_value(&v), Some("a, b".to_string()));
    }

    #[test]
    fn jira_issue_maps_mapped_slot_and_overflow() {
        let mut by_slot = BTreeMap::new();
        by_slot.insert(3, "customfield_10042".to_string());
        let mappings = CustomFieldMappings::new(by_slot).unwrap();

        let payload = serde_json::json!({
            "key": "PROJ-1",
            "fields": {
                "summary": "Fix bug",
                "status": {"name": "Open"},
                "customfield_10042": {"value": "High"},
                "customfield_99999": "unmapped-value",
            }
        });

        let tenant = TenantId::new(Uuid::new_v4());
        let row = jira_issue_to_work_item(tenant, Uuid::new_v4(), &payload, &mappings).unwrap();
        assert_eq!(row.custom_field_03.as_deref(), Some("High"));
        assert_eq!(row.custom_field_01, None);
        assert_eq!(row.custom_fields_overflow.get("customfield_99999").and_then(Value::as_str), Some("unmapped-value"));
    }
}
