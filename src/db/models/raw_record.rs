//! The Raw Store: `raw_extraction_data`, the durable landing zone for every item
//! an extractor pulls before transform ever sees it.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EtlError, Result};
use crate::schema::raw_extraction_data;
use crate::tenant::TenantId;

pub type RawId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Transformed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Transformed => "transformed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "transformed" => Ok(ProcessingStatus::Transformed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => anyhow::bail!("unknown processing_status: {}", other),
        }
    }
}

#[derive(Debug, Queryable, Identifiable)]
#[diesel(table_name = raw_extraction_data)]
#[diesel(primary_key(raw_id))]
pub struct RawRecord {
    pub raw_id: RawId,
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    pub entity_type: String,
    pub external_id: Option<String>,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub processing_status: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl RawRecord {
    pub fn tenant(&self) -> TenantId {
        TenantId::new(self.tenant_id)
    }

    pub fn status(&self) -> Result<ProcessingStatus> {
        self.processing_status.parse().map_err(EtlError::PermanentData)
    }

    /// Load a raw record, scoped to `tenant`. A mismatched tenant is reported the
    /// same as not-found, never leaked as "exists for someone else".
    pub fn load(conn: &mut PgConnection, tenant: TenantId, raw_id: RawId) -> Result<RawRecord> {
        use crate::schema::raw_extraction_data::dsl;

        dsl::raw_extraction_data
            .filter(dsl::raw_id.eq(raw_id))
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .first::<RawRecord>(conn)
            .map_err(|_| EtlError::NotFound(format!("raw record {} for tenant {}", raw_id, tenant)))
    }

    /// Transition to `status`, stamping `processed_at` and recording `error` when
    /// present. `failed -> pending` is the retry-reset path; all other transitions
    /// are terminal.
    pub fn mark(
        conn: &mut PgConnection,
        tenant: TenantId,
        raw_id: RawId,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        use crate::schema::raw_extraction_data::dsl;

        let processed_at = match status {
            ProcessingStatus::Pending => None,
            _ => Some(Utc::now()),
        };

        let updated = diesel::update(
            dsl::raw_extraction_data
                .filter(dsl::raw_id.eq(raw_id))
                .filter(dsl::tenant_id.eq(tenant.as_uuid())),
        )
        .set((
            dsl::processing_status.eq(status.as_str()),
            dsl::processed_at.eq(processed_at),
            dsl::error_message.eq(error),
        ))
        .execute(conn)
        .map_err(|e| EtlError::TransientInternal(e.into()))?;

        if updated == 0 {
            return Err(EtlError::NotFound(format!("raw record {} for tenant {}", raw_id, tenant)));
        }
        Ok(())
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = raw_extraction_data)]
pub struct NewRawRecord {
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    pub entity_type: String,
    pub external_id: Option<String>,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub processing_status: String,
}

impl NewRawRecord {
    pub fn new(
        tenant: TenantId,
        integration_id: Uuid,
        entity_type: impl Into<String>,
        external_id: Option<String>,
        payload: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Self {
        NewRawRecord {
            tenant_id: *tenant.as_uuid(),
            integration_id,
            entity_type: entity_type.into(),
            external_id,
            payload,
            metadata,
            processing_status: ProcessingStatus::Pending.as_str().to_string(),
        }
    }

    /// Insert and return the assigned `raw_id`.
    pub fn insert(self, conn: &mut PgConnection) -> Result<RawId> {
        use crate::schema::raw_extraction_data::dsl;

        diesel::insert_into(raw_extraction_data::table)
            .values(&self)
            .returning(dsl::raw_id)
            .get_result(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_status_round_trips_through_str() {
        for status in [ProcessingStatus::Pending, ProcessingStatus::Transformed, ProcessingStatus::Failed] {
            let parsed: ProcessingStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed.as_str(), status.as_str());
        }
    }
}
