use chrono::{DateTime, Utc};
use sf_domain::{ManufacturingPipeline, PipelineId, TradeGoodSymbol};
use std::collections::HashMap;

/// Coordinator-private view of in-flight work. Owned exclusively by the
/// main loop; every mutation happens in response to a loop event, so no
/// lock guards it.
#[derive(Debug, Default)]
pub struct CoordinatorState {
    pub active_pipelines: HashMap<PipelineId, ManufacturingPipeline>,
    /// Freshness penalty for the opportunity scanner: when scores tie, the
    /// good we built longest ago wins.
    pub last_pipeline_created: HashMap<TradeGoodSymbol, DateTime<Utc>>,
}

impl CoordinatorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_active_pipeline_for(&self, good: &TradeGoodSymbol) -> bool {
        self.active_pipelines.values().any(|p| &p.product_good == good)
    }
}
