//! `integrations`: a configured connection to one external source system.

use std::collections::BTreeMap;

use anyhow::Context;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EtlError;
use crate::schema::integrations;
use crate::tenant::TenantId;

/// A logical custom-field slot, `custom_field_01` .. `custom_field_20`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomFieldSlot(pub u8);

pub const MAX_CUSTOM_FIELD_SLOTS: u8 = 20;

impl CustomFieldSlot {
    pub fn column_name(&self) -> String {
        format!("custom_field_{:02}", self.0)
    }
}

/// Mapping from logical column slot to source field id, bounded at
/// [`MAX_CUSTOM_FIELD_SLOTS`] entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomFieldMappings {
    by_slot: BTreeMap<u8, String>,
}

impl CustomFieldMappings {
    pub fn new(by_slot: BTreeMap<u8, String>) -> anyhow::Result<Self> {
        if by_slot.len() > MAX_CUSTOM_FIELD_SLOTS as usize {
            anyhow::bail!(
                "custom_field_mappings has {} entries, max is {}",
                by_slot.len(),
                MAX_CUSTOM_FIELD_SLOTS
            );
        }
        if let Some(&bad) = by_slot.keys().find(|&&slot| slot == 0 || slot > MAX_CUSTOM_FIELD_SLOTS) {
            anyhow::bail!("custom field slot {} out of range 1..={}", bad, MAX_CUSTOM_FIELD_SLOTS);
        }
        Ok(CustomFieldMappings { by_slot })
    }

    pub fn source_field_for_slot(&self, slot: u8) -> Option<&str> {
        self.by_slot.get(&slot).map(String::as_str)
    }

    /// All configured `(slot, source_field_id)` pairs, in slot order.
    pub fn entries(&self) -> impl Iterator<Item = (CustomFieldSlot, &str)> {
        self.by_slot.iter().map(|(&slot, field)| (CustomFieldSlot(slot), field.as_str()))
    }

    /// Whether `source_field_id` is mapped to any slot (used to decide whether a
    /// custom field value belongs in a slot column or the overflow JSON).
    pub fn slot_for_source_field(&self, source_field_id: &str) -> Option<CustomFieldSlot> {
        self.by_slot
            .iter()
            .find(|(_, v)| v.as_str() == source_field_id)
            .map(|(&slot, _)| CustomFieldSlot(slot))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Jira,
    Github,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Jira => "jira",
            Provider::Github => "github",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "jira" => Ok(Provider::Jira),
            "github" => Ok(Provider::Github),
            other => anyhow::bail!("unknown provider: {}", other),
        }
    }
}

#[derive(Debug, Queryable, Identifiable)]
#[diesel(table_name = integrations)]
#[diesel(primary_key(integration_id))]
pub struct Integration {
    pub integration_id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    pub credentials: Vec<u8>,
    pub settings: serde_json::Value,
    pub custom_field_mappings: serde_json::Value,
    pub active: bool,
}

impl Integration {
    pub fn tenant(&self) -> TenantId {
        TenantId::new(self.tenant_id)
    }

    pub fn provider(&self) -> anyhow::Result<Provider> {
        self.provider.parse()
    }

    pub fn custom_field_mappings(&self) -> anyhow::Result<CustomFieldMappings> {
        serde_json::from_value(self.custom_field_mappings.clone())
            .context("Deserializing custom_field_mappings")
    }

    pub fn find(conn: &mut PgConnection, tenant: TenantId, id: Uuid) -> crate::error::Result<Integration> {
        use crate::schema::integrations::dsl;

        dsl::integrations
            .filter(dsl::integration_id.eq(id))
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .first::<Integration>(conn)
            .map_err(|_| EtlError::NotFound(format!("integration {} for tenant {}", id, tenant)))
    }

    pub fn list_for_tenant(conn: &mut PgConnection, tenant: TenantId) -> crate::error::Result<Vec<Integration>> {
        use crate::schema::integrations::dsl;

        dsl::integrations
            .filter(dsl::tenant_id.eq(tenant.as_uuid()))
            .order(dsl::provider.asc())
            .load::<Integration>(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = integrations)]
pub struct NewIntegration {
    pub integration_id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    pub credentials: Vec<u8>,
    pub settings: serde_json::Value,
    pub custom_field_mappings: serde_json::Value,
    pub active: bool,
}

impl NewIntegration {
    pub fn insert(self, conn: &mut PgConnection) -> crate::error::Result<Integration> {
        diesel::insert_into(integrations::table)
            .values(&self)
            .get_result(conn)
            .map_err(|e| EtlError::TransientInternal(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_more_than_twenty_slots() {
        let map: BTreeMap<u8, String> = (1..=21).map(|i| (i, format!("field_{i}"))).collect();
        assert!(CustomFieldMappings::new(map).is_err());
    }

    #[test]
    fn rejects_out_of_range_slot() {
        let mut map = BTreeMap::new();
        map.insert(21, "field_x".to_string());
        assert!(CustomFieldMappings::new(map).is_err());
    }

    #[test]
    fn finds_slot_for_mapped_source_field() {
        let mut map = BTreeMap::new();
        map.insert(3, "customfield_10042".to_string());
        let mappings = CustomFieldMappings::new(map).unwrap();
        assert_eq!(mappings.slot_for_source_field("customfield_10042"), Some(CustomFieldSlot(3)));
        assert_eq!(mappings.slot_for_source_field("customfield_99999"), None);
    }
}
