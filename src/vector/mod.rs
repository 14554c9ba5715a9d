//! The vector store: `(tenant_id, collection, external_id) -> float[d]`.
//! Collections are namespaced `tenant_{id}_{entity_type}`; vectors are
//! last-writer-wins, same as the teacher's upsert-everywhere posture for
//! target rows, but with no CAS — no reader depends on seeing an in-progress
//! write.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use uuid::Uuid;

use crate::error::{EtlError, Result};
use crate::schema::vector_records;
use crate::tenant::TenantId;

pub fn collection_name(tenant: TenantId, entity_type: &str) -> String {
    format!("tenant_{}_{}", tenant, entity_type)
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, tenant: TenantId, collection: &str, external_id: &str, embedding: Vec<f64>) -> Result<()>;

    async fn get(&self, tenant: TenantId, collection: &str, external_id: &str) -> Result<Option<Vec<f64>>>;
}

#[derive(Debug, Queryable, Identifiable)]
#[diesel(table_name = vector_records)]
#[diesel(primary_key(tenant_id, collection, external_id))]
struct VectorRecordRow {
    tenant_id: Uuid,
    collection: String,
    external_id: String,
    embedding: Vec<f64>,
    updated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = vector_records)]
struct NewVectorRecordRow {
    tenant_id: Uuid,
    collection: String,
    external_id: String,
    embedding: Vec<f64>,
    updated_at: chrono::DateTime<Utc>,
}

/// Postgres-backed default: same connection pool as everything else, a plain
/// `double precision[]` column. A dedicated vector database is a deployment
/// choice the `VectorStore` trait leaves open; this is the in-the-box path.
pub struct PostgresVectorStore {
    pool: crate::db::DbPool,
}

impl PostgresVectorStore {
    pub fn new(pool: crate::db::DbPool) -> Self {
        PostgresVectorStore { pool }
    }
}

#[async_trait]
impl VectorStore for PostgresVectorStore {
    async fn upsert(&self, tenant: TenantId, collection: &str, external_id: &str, embedding: Vec<f64>) -> Result<()> {
        let mut conn = self.pool.get().map_err(|e| EtlError::TransientExternal(e.into()))?;
        use crate::schema::vector_records::dsl;

        let row = NewVectorRecordRow {
            tenant_id: *tenant.as_uuid(),
            collection: collection.to_string(),
            external_id: external_id.to_string(),
            embedding,
            updated_at: Utc::now(),
        };

        diesel::insert_into(vector_records::table)
            .values(&row)
            .on_conflict((dsl::tenant_id, dsl::collection, dsl::external_id))
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))?;
        Ok(())
    }

    async fn get(&self, tenant: TenantId, collection: &str, external_id: &str) -> Result<Option<Vec<f64>>> {
        let mut conn = self.pool.get().map_err(|e| EtlError::TransientExternal(e.into()))?;
        use crate::schema::vector_records::dsl;

        let row: Option<VectorRecordRow> = dsl::vector_records
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .filter(dsl::collection.eq(collection))
            .filter(dsl::external_id.eq(external_id))
            .first(&mut conn)
            .optional()
            .map_err(|e| EtlError::TransientInternal(e.into()))?;

        Ok(row.map(|r| r.embedding))
    }
}

/// In-memory store for tests and the deterministic end-to-end scenarios.
pub mod memory {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryVectorStore {
        points: Mutex<HashMap<(Uuid, String, String), Vec<f64>>>,
    }

    impl MemoryVectorStore {
        pub fn new() -> Self {
            MemoryVectorStore::default()
        }
    }

    #[async_trait]
    impl VectorStore for MemoryVectorStore {
        async fn upsert(&self, tenant: TenantId, collection: &str, external_id: &str, embedding: Vec<f64>) -> Result<()> {
            self.points
                .lock()
                .insert((*tenant.as_uuid(), collection.to_string(), external_id.to_string()), embedding);
            Ok(())
        }

        async fn get(&self, tenant: TenantId, collection: &str, external_id: &str) -> Result<Option<Vec<f64>>> {
            Ok(self
                .points
                .lock()
                .get(&(*tenant.as_uuid(), collection.to_string(), external_id.to_string()))
                .cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryVectorStore;
    use super::*;

    #[test]
    fn collection_name_is_namespaced_per_tenant() {
        let tenant = TenantId::new(Uuid::new_v4());
        let name = collection_name(tenant, "jira_issues");
        assert!(name.starts_with(&format!("tenant_{}_", tenant)));
        assert!(name.ends_with("jira_issues"));
    }

    #[tokio::test]
    async fn last_write_wins() {
        let store = MemoryVectorStore::new();
        let tenant = TenantId::new(Uuid::new_v4());
        store.upsert(tenant, "tenant_x_issues", "P1", vec![0.1, 0.2]).await.unwrap();
        store.upsert(tenant, "tenant_x_issues", "P1", vec![0.9, 0.9]).await.unwrap();
        assert_eq!(store.get(tenant, "tenant_x_issues", "P1").await.unwrap(), Some(vec![0.9, 0.9]));
    }
}
