//! Per-step incremental-sync watermarks.
//!
//! A watermark is a monotonic timestamp marking the last successful incremental
//! position for a `(job, step)` pair. Extractors must be pure with respect to
//! watermark monotonicity: calling with watermark `W` yields only items whose
//! update-time is `>= W`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::StepName;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatermarkMap {
    by_step: BTreeMap<String, DateTime<Utc>>,
}

impl WatermarkMap {
    pub fn get(&self, step: &StepName) -> Option<DateTime<Utc>> {
        self.by_step.get(&step.0).copied()
    }

    /// Advance the watermark for `step`, refusing to move it backwards. On
    /// successful step completion the caller advances to `run_started_at` (not
    /// `now`), so a long-running extraction cannot create a gap past items that
    /// changed while it was running.
    pub fn advance(&mut self, step: &StepName, to: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(existing) = self.by_step.get(&step.0) {
            if to < *existing {
                anyhow::bail!(
                    "watermark for step {} would move backwards ({} -> {})",
                    step,
                    existing,
                    to
                );
            }
        }
        self.by_step.insert(step.0.clone(), to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn advance_refuses_to_move_backwards() {
        let mut wm = WatermarkMap::default();
        let step = StepName::from("issues");
        let now = Utc::now();
        wm.advance(&step, now).unwrap();
        let earlier = now - Duration::seconds(60);
        assert!(wm.advance(&step, earlier).is_err());
        assert_eq!(wm.get(&step), Some(now));
    }
}
