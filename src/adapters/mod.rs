//! Source Adapter contract: the only way extract workers talk to an external
//! system. Pagination, rate-limit sleeps, and wire formats live entirely
//! inside an adapter; the worker loop only pumps items through a sink.

pub mod fixture;
pub mod github;
pub mod jira;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::integration::Integration;
use crate::error::Result;

/// One extracted item: the raw payload plus whatever identity/timestamp the
/// adapter could read off it without fully parsing it (full parsing is the
/// transform worker's job).
#[derive(Debug, Clone)]
pub struct ExtractedItem {
    pub external_id: Option<String>,
    pub payload: serde_json::Value,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DiscoveredCustomField {
    pub project_external_id: String,
    pub source_field_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct DiscoveredIssueType {
    pub project_external_id: String,
    pub issue_type_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    pub custom_fields: Vec<DiscoveredCustomField>,
    pub issue_types: Vec<DiscoveredIssueType>,
}

/// Where an adapter hands extracted items as it pages through a source. The
/// worker's implementation does one-item lookahead buffering so it can stamp
/// `first_item`/`last_item` without the adapter needing to know the total
/// count up front.
#[async_trait]
pub trait ExtractSink: Send {
    async fn accept(&mut self, item: ExtractedItem) -> Result<()>;
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn supported_entities(&self) -> Vec<String>;

    /// Page through `entity_type`, calling `sink.accept` for every item whose
    /// update-time is `>= watermark` (or all items, if `watermark` is `None`).
    /// Adapters must be pure w.r.t. watermark monotonicity.
    async fn extract(
        &self,
        entity_type: &str,
        integration: &Integration,
        watermark: Option<DateTime<Utc>>,
        batch_size: usize,
        sink: &mut dyn ExtractSink,
    ) -> Result<()>;

    /// Custom-field and issue-type discovery. A no-op for sources with no
    /// dynamic schema (e.g. GitHub).
    async fn discover(&self, integration: &Integration) -> Result<DiscoveryResult> {
        let _ = integration;
        Ok(DiscoveryResult::default())
    }
}
