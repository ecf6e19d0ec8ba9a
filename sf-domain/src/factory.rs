use crate::model::{SupplyLevel, TradeGoodSymbol, WaypointSymbol};
use crate::pipeline::PipelineId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Observed production state of one factory waypoint for one pipeline's
/// output good. Delivery bookkeeping comes from completed AcquireDeliver
/// tasks; supply level comes from market observation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FactoryState {
    pub pipeline_id: PipelineId,
    pub factory_symbol: WaypointSymbol,
    pub output_good: TradeGoodSymbol,
    pub required_inputs: HashMap<TradeGoodSymbol, u32>,
    pub delivered_inputs: HashMap<TradeGoodSymbol, u32>,
    pub current_supply_level: Option<SupplyLevel>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub ready_for_collection: bool,
    pub version: i64,
}

impl FactoryState {
    pub fn new(
        pipeline_id: PipelineId,
        factory_symbol: WaypointSymbol,
        output_good: TradeGoodSymbol,
        required_inputs: HashMap<TradeGoodSymbol, u32>,
    ) -> Self {
        Self {
            pipeline_id,
            factory_symbol,
            output_good,
            required_inputs,
            delivered_inputs: HashMap::new(),
            current_supply_level: None,
            last_observed_at: None,
            ready_for_collection: false,
            version: 0,
        }
    }

    pub fn record_delivery(&mut self, good: &TradeGoodSymbol, units: u32) {
        *self.delivered_inputs.entry(good.clone()).or_insert(0) += units;
    }

    pub fn all_inputs_delivered(&self) -> bool {
        self.required_inputs
            .iter()
            .all(|(good, required)| self.delivered_inputs.get(good).copied().unwrap_or(0) >= *required)
    }

    /// Applies a fresh market observation. Returns the readiness edge this
    /// observation caused, if any.
    pub fn observe_supply(&mut self, supply: SupplyLevel, now: DateTime<Utc>) -> SupplyObservation {
        let was_ready = self.ready_for_collection;
        self.current_supply_level = Some(supply);
        self.last_observed_at = Some(now);
        self.ready_for_collection = supply.is_collectable();

        match (was_ready, self.ready_for_collection) {
            (false, true) => SupplyObservation::BecameReady,
            (true, false) => SupplyObservation::NoLongerReady,
            _ => SupplyObservation::Unchanged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyObservation {
    BecameReady,
    NoLongerReady,
    Unchanged,
}
