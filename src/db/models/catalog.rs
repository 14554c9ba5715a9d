//! Discovery catalogs: every custom field and issue type a Jira integration has
//! ever seen, per project. Populated by the transform step so an operator can
//! configure [`super::integration::CustomFieldMappings`] without guessing field
//! ids from raw payloads.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use uuid::Uuid;

use crate::error::{EtlError, Result};
use crate::schema::{custom_field_catalog, issue_type_catalog};
use crate::tenant::TenantId;

#[derive(Debug, Queryable, Identifiable)]
#[diesel(table_name = custom_field_catalog)]
#[diesel(primary_key(tenant_id, project_external_id, source_field_id))]
pub struct CustomFieldCatalogEntry {
    pub tenant_id: Uuid,
    pub project_external_id: String,
    pub source_field_id: String,
    pub display_name: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = custom_field_catalog)]
pub struct NewCustomFieldCatalogEntry {
    pub tenant_id: Uuid,
    pub project_external_id: String,
    pub source_field_id: String,
    pub display_name: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,
}

impl NewCustomFieldCatalogEntry {
    pub fn seen_now(tenant: TenantId, project_external_id: impl Into<String>, source_field_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        NewCustomFieldCatalogEntry {
            tenant_id: *tenant.as_uuid(),
            project_external_id: project_external_id.into(),
            source_field_id: source_field_id.into(),
            display_name: display_name.into(),
            first_seen_at: now,
            last_seen_at: now,
            active: true,
        }
    }

    /// Record a sighting: insert on first encounter, otherwise bump `last_seen_at`
    /// and refresh the display name without disturbing `first_seen_at`.
    pub fn record_sighting(&self, conn: &mut PgConnection) -> Result<()> {
        use crate::schema::custom_field_catalog::dsl;

        diesel::insert_into(custom_field_catalog::table)
            .values(self)
            .on_conflict((dsl::tenant_id, dsl::project_external_id, dsl::source_field_id))
            .do_update()
            .set((
                dsl::display_name.eq(&self.display_name),
                dsl::last_seen_at.eq(self.last_seen_at),
                dsl::active.eq(true),
            ))
            .execute(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))?;
        Ok(())
    }
}

impl CustomFieldCatalogEntry {
    pub fn list_for_project(conn: &mut PgConnection, tenant: TenantId, project_external_id: &str) -> Result<Vec<CustomFieldCatalogEntry>> {
        use crate::schema::custom_field_catalog::dsl;

        dsl::custom_field_catalog
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .filter(dsl::project_external_id.eq(project_external_id))
            .order(dsl::source_field_id.asc())
            .load::<CustomFieldCatalogEntry>(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))
    }
}

#[derive(Debug, Queryable, Identifiable)]
#[diesel(table_name = issue_type_catalog)]
#[diesel(primary_key(tenant_id, project_external_id, issue_type_id))]
pub struct IssueTypeCatalogEntry {
    pub tenant_id: Uuid,
    pub project_external_id: String,
    pub issue_type_id: String,
    pub display_name: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = issue_type_catalog)]
pub struct NewIssueTypeCatalogEntry {
    pub tenant_id: Uuid,
    pub project_external_id: String,
    pub issue_type_id: String,
    pub display_name: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,
}

impl NewIssueTypeCatalogEntry {
    pub fn seen_now(tenant: TenantId, project_external_id: impl Into<String>, issue_type_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        NewIssueTypeCatalogEntry {
            tenant_id: *tenant.as_uuid(),
            project_external_id: project_external_id.into(),
            issue_type_id: issue_type_id.into(),
            display_name: display_name.into(),
            first_seen_at: now,
            last_seen_at: now,
            active: true,
        }
    }

    pub fn record_sighting(&self, conn: &mut PgConnection) -> Result<()> {
        use crate::schema::issue_type_catalog::dsl;

        diesel::insert_into(issue_type_catalog::table)
            .values(self)
            .on_conflict((dsl::tenant_id, dsl::project_external_id, dsl::issue_type_id))
            .do_update()
            .set((
                dsl::display_name.eq(&self.display_name),
                dsl::last_seen_at.eq(self.last_seen_at),
                dsl::active.eq(true),
            ))
            .execute(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))?;
        Ok(())
    }
}
