//! Target-row models: the finalized, queryable tables transform workers upsert
//! into and embed workers read back from. One struct per entity type, all
//! keyed on `(external_id, tenant_id)` and all upserted the same way: insert,
//! or on conflict overwrite every non-key column with the transformed value.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use uuid::Uuid;

use crate::error::{EtlError, Result};
use crate::schema::{comments, commits, projects, prs, reviews, work_items};
use crate::tenant::TenantId;

/// Slots `custom_field_01..20` plus the JSON overflow column, shared only by
/// `work_items` today but kept as its own trait since the Jira entity model is
/// the one place dynamic per-tenant columns apply.
pub trait CustomColumns {
    fn custom_field(&self, slot: u8) -> Option<&str>;
    fn overflow(&self) -> &serde_json::Value;
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = work_items)]
pub struct NewWorkItem {
    pub external_id: String,
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    pub key: String,
    pub summary: String,
    pub description: Option<String>,
    pub status: String,
    pub assignee: Option<String>,
    pub priority: Option<String>,
    pub issue_type: Option<String>,
    pub project: Option<String>,
    pub custom_field_01: Option<String>,
    pub custom_field_02: Option<String>,
    pub custom_field_03: Option<String>,
    pub custom_field_04: Option<String>,
    pub custom_field_05: Option<String>,
    pub custom_field_06: Option<String>,
    pub custom_field_07: Option<String>,
    pub custom_field_08: Option<String>,
    pub custom_field_09: Option<String>,
    pub custom_field_10: Option<String>,
    pub custom_field_11: Option<String>,
    pub custom_field_12: Option<String>,
    pub custom_field_13: Option<String>,
    pub custom_field_14: Option<String>,
    pub custom_field_15: Option<String>,
    pub custom_field_16: Option<String>,
    pub custom_field_17: Option<String>,
    pub custom_field_18: Option<String>,
    pub custom_field_19: Option<String>,
    pub custom_field_20: Option<String>,
    pub custom_fields_overflow: serde_json::Value,
    pub last_updated_at: DateTime<Utc>,
}

impl NewWorkItem {
    /// Insert, or on conflict overwrite with the freshly transformed row. Mapping
    /// changes between runs are expected: a field once in slot 3 may move to
    /// overflow or a different slot on the next sync, and the overwrite leaves no
    /// trace of the prior mapping.
    pub fn upsert(&self, conn: &mut PgConnection) -> Result<()> {
        use crate::schema::work_items::dsl;

        diesel::insert_into(work_items::table)
            .values(self)
            .on_conflict((dsl::external_id, dsl::tenant_id))
            .do_update()
            .set(self)
            .execute(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))?;
        Ok(())
    }
}

#[derive(Debug, Queryable, Identifiable)]
#[diesel(table_name = work_items)]
#[diesel(primary_key(external_id, tenant_id))]
pub struct WorkItem {
    pub external_id: String,
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    pub key: String,
    pub summary: String,
    pub description: Option<String>,
    pub status: String,
    pub assignee: Option<String>,
    pub priority: Option<String>,
    pub issue_type: Option<String>,
    pub project: Option<String>,
    pub custom_field_01: Option<String>,
    pub custom_field_02: Option<String>,
    pub custom_field_03: Option<String>,
    pub custom_field_04: Option<String>,
    pub custom_field_05: Option<String>,
    pub custom_field_06: Option<String>,
    pub custom_field_07: Option<String>,
    pub custom_field_08: Option<String>,
    pub custom_field_09: Option<String>,
    pub custom_field_10: Option<String>,
    pub custom_field_11: Option<String>,
    pub custom_field_12: Option<String>,
    pub custom_field_13: Option<String>,
    pub custom_field_14: Option<String>,
    pub custom_field_15: Option<String>,
    pub custom_field_16: Option<String>,
    pub custom_field_17: Option<String>,
    pub custom_field_18: Option<String>,
    pub custom_field_19: Option<String>,
    pub custom_field_20: Option<String>,
    pub custom_fields_overflow: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn tenant(&self) -> TenantId {
        TenantId::new(self.tenant_id)
    }

    pub fn find(conn: &mut PgConnection, tenant: TenantId, external_id: &str) -> Result<WorkItem> {
        use crate::schema::work_items::dsl;

        dsl::work_items
            .filter(dsl::external_id.eq(external_id))
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .first::<WorkItem>(conn)
            .map_err(|_| EtlError::NotFound(format!("work item {} for tenant {}", external_id, tenant)))
    }
}

impl CustomColumns for WorkItem {
    fn custom_field(&self, slot: u8) -> Option<&str> {
        match slot {
            1 => self.custom_field_01.as_deref(),
            2 => self.custom_field_02.as_deref(),
            3 => self.custom_field_03.as_deref(),
            4 => self.custom_field_04.as_deref(),
            5 => self.custom_field_05.as_deref(),
            6 => self.custom_field_06.as_deref(),
            7 => self.custom_field_07.as_deref(),
            8 => self.custom_field_08.as_deref(),
            9 => self.custom_field_09.as_deref(),
            10 => self.custom_field_10.as_deref(),
            11 => self.custom_field_11.as_deref(),
            12 => self.custom_field_12.as_deref(),
            13 => self.custom_field_13.as_deref(),
            14 => self.custom_field_14.as_deref(),
            15 => self.custom_field_15.as_deref(),
            16 => self.custom_field_16.as_deref(),
            17 => self.custom_field_17.as_deref(),
            18 => self.custom_field_18.as_deref(),
            19 => self.custom_field_19.as_deref(),
            20 => self.custom_field_20.as_deref(),
            _ => None,
        }
    }

    fn overflow(&self) -> &serde_json::Value {
        &self.custom_fields_overflow
    }
}

/// Text an embed worker can hand to an [`crate::provider::EmbeddingProvider`]
/// as-is. Each target row type renders its own, in the order a human would
/// read it (title/summary first, identifying metadata after).
pub trait EmbeddingText {
    fn embedding_text(&self) -> String;
}

impl EmbeddingText for WorkItem {
    fn embedding_text(&self) -> String {
        let mut parts = vec![self.summary.clone()];
        if let Some(description) = &self.description {
            parts.push(description.clone());
        }
        parts.push(format!("status: {}", self.status));
        if let Some(issue_type) = &self.issue_type {
            parts.push(format!("type: {}", issue_type));
        }
        parts.join("\n")
    }
}

macro_rules! simple_target_table {
    ($new_struct:ident, $row_struct:ident, $table:ident, $mod_path:path, { $($field:ident : $ty:ty),* $(,)? }, |$self:ident| $text:expr) => {
        #[derive(Debug, Clone, Insertable, AsChangeset)]
        #[diesel(table_name = $mod_path)]
        pub struct $new_struct {
            pub external_id: String,
            pub tenant_id: Uuid,
            pub integration_id: Uuid,
            $(pub $field: $ty,)*
            pub last_updated_at: DateTime<Utc>,
        }

        impl $new_struct {
            pub fn upsert(&self, conn: &mut PgConnection) -> Result<()> {
                use $mod_path::dsl;

                diesel::insert_into($mod_path::table)
                    .values(self)
                    .on_conflict((dsl::external_id, dsl::tenant_id))
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_err(|e| EtlError::TransientInternal(e.into()))?;
                Ok(())
            }
        }

        #[derive(Debug, Queryable, Identifiable)]
        #[diesel(table_name = $mod_path)]
        #[diesel(primary_key(external_id, tenant_id))]
        pub struct $row_struct {
            pub external_id: String,
            pub tenant_id: Uuid,
            pub integration_id: Uuid,
            $(pub $field: $ty,)*
            pub created_at: DateTime<Utc>,
            pub last_updated_at: DateTime<Utc>,
        }

        impl $row_struct {
            pub fn find(conn: &mut PgConnection, tenant: TenantId, external_id: &str) -> Result<$row_struct> {
                use $mod_path::dsl;

                dsl::$table
                    .filter(dsl::external_id.eq(external_id))
                    .filter(dsl::tenant_id.eq(tenant.as_uuid()))
                    .first::<$row_struct>(conn)
                    .map_err(|_| EtlError::NotFound(format!("{} {} for tenant {}", stringify!($table), external_id, tenant)))
            }
        }

        impl EmbeddingText for $row_struct {
            fn embedding_text(&$self) -> String {
                $text
            }
        }
    };
}

simple_target_table!(NewProject, Project, projects, crate::schema::projects, {
    name: String,
}, |self| self.name.clone());

simple_target_table!(NewPullRequest, PullRequest, prs, crate::schema::prs, {
    title: String,
    state: String,
    author: Option<String>,
    repo: String,
}, |self| format!("{}\nstate: {}\nrepo: {}", self.title, self.state, self.repo));

simple_target_table!(NewCommit, Commit, commits, crate::schema::commits, {
    parent_external_id: Option<String>,
    message: String,
    author: Option<String>,
}, |self| self.message.clone());

simple_target_table!(NewReview, Review, reviews, crate::schema::reviews, {
    parent_external_id: Option<String>,
    state: String,
    author: Option<String>,
}, |self| format!("review state: {}", self.state));

simple_target_table!(NewComment, Comment, comments, crate::schema::comments, {
    parent_external_id: Option<String>,
    body: String,
    author: Option<String>,
}, |self| self.body.clone());

#[cfg(test)]
mod tests {
    use super::*;

    fn work_item(custom: [Option<&str>; 20]) -> WorkItem {
        WorkItem {
            external_id: "PROJ-1".to_string(),
            tenant_id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            key: "PROJ-1".to_string(),
            summary: "summary".to_string(),
            description: None,
            status: "open".to_string(),
            assignee: None,
            priority: None,
            issue_type: None,
            project: None,
            custom_field_01: custom[0].map(str::to_string),
            custom_field_02: custom[1].map(str::to_string),
            custom_field_03: custom[2].map(str::to_string),
            custom_field_04: custom[3].map(str::to_string),
            custom_field_05: custom[4].map(str::to_string),
            custom_field_06: custom[5].map(str::to_string),
            custom_field_07: custom[6].map(str::to_string),
            custom_field_08: custom[7].map(str::to_string),
            custom_field_09: custom[8].map(str::to_string),
            custom_field_10: custom[9].map(str::to_string),
            custom_field_11: custom[10].map(str::to_string),
            custom_field_12: custom[11].map(str::to_string),
            custom_field_13: custom[12].map(str::to_string),
            custom_field_14: custom[13].map(str::to_string),
            custom_field_15: custom[14].map(str::to_string),
            custom_field_16: custom[15].map(str::to_string),
            custom_field_17: custom[16].map(str::to_string),
            custom_field_18: custom[17].map(str::to_string),
            custom_field_19: custom[18].map(str::to_string),
            custom_field_20: custom[19].map(str::to_string),
            custom_fields_overflow: serde_json::json!({}),
            created_at: Utc::now(),
            last_updated_at: Utc::now(),
        }
    }

    #[test]
    fn custom_columns_reads_mapped_slot() {
        let mut custom = [None; 20];
        custom[2] = Some("story points value");
        let item = work_item(custom);
        assert_eq!(item.custom_field(3), Some("story points value"));
        assert_eq!(item.custom_field(1), None);
    }
}
