//! A programmable in-memory adapter: no network, items supplied up front.
//! Used by the end-to-end scenario tests to exercise the full pipeline
//! deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::adapters::{DiscoveryResult, ExtractSink, ExtractedItem, SourceAdapter};
use crate::db::models::integration::Integration;
use crate::error::Result;

pub struct FixtureAdapter {
    entity_type: String,
    items: Mutex<Vec<ExtractedItem>>,
    discovery: DiscoveryResult,
}

impl FixtureAdapter {
    pub fn new(entity_type: impl Into<String>, items: Vec<ExtractedItem>) -> Self {
        FixtureAdapter {
            entity_type: entity_type.into(),
            items: Mutex::new(items),
            discovery: DiscoveryResult::default(),
        }
    }

    pub fn with_discovery(mut self, discovery: DiscoveryResult) -> Self {
        self.discovery = discovery;
        self
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn supported_entities(&self) -> Vec<String> {
        vec![self.entity_type.clone()]
    }

    async fn extract(
        &self,
        entity_type: &str,
        _integration: &Integration,
        watermark: Option<DateTime<Utc>>,
        _batch_size: usize,
        sink: &mut dyn ExtractSink,
    ) -> Result<()> {
        if entity_type != self.entity_type {
            return Ok(());
        }
        let items = self.items.lock().clone();
        for item in items {
            let passes_watermark = match (watermark, item.updated_at) {
                (Some(wm), Some(updated)) => updated >= wm,
                _ => true,
            };
            if passes_watermark {
                sink.accept(item).await?;
            }
        }
        Ok(())
    }

    async fn discover(&self, _integration: &Integration) -> Result<DiscoveryResult> {
        Ok(self.discovery.clone())
    }
}

pub fn item(external_id: Option<&str>, payload: serde_json::Value, updated_at: Option<DateTime<Utc>>) -> ExtractedItem {
    ExtractedItem {
        external_id: external_id.map(str::to_string),
        payload,
        updated_at,
    }
}
