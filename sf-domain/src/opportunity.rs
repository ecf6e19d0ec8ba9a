use crate::model::{ActivityLevel, SupplyLevel, SystemSymbol, TradeGoodSymbol, WaypointSymbol};
use lazy_static::lazy_static;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

lazy_static! {
    /// Canonical activity weights. A WEAK market barely restocks on its
    /// own, which makes it the best fabrication target; a GROWING one
    /// catches up without us.
    pub static ref ACTIVITY_WEIGHTS: HashMap<ActivityLevel, i64> = HashMap::from([
        (ActivityLevel::Weak, 100),
        (ActivityLevel::Restricted, 50),
        (ActivityLevel::Strong, 25),
        (ActivityLevel::Growing, 0),
    ]);
}

pub fn activity_score(activity: Option<ActivityLevel>) -> i64 {
    activity
        .and_then(|a| ACTIVITY_WEIGHTS.get(&a).copied())
        .unwrap_or(0)
}

/// Low supply scores high: a SCARCE export is the one worth fabricating.
pub fn supply_score(supply: SupplyLevel) -> i64 {
    match supply {
        SupplyLevel::Scarce => 100,
        SupplyLevel::Limited => 75,
        SupplyLevel::Moderate => 50,
        SupplyLevel::High => 25,
        SupplyLevel::Abundant => 0,
    }
}

/// One input of a manufacturing opportunity: where to buy it, or the fact
/// that it has to be fabricated one level deeper.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OpportunityInput {
    pub good: TradeGoodSymbol,
    pub units: u32,
    pub best_source: Option<SourceMarket>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SourceMarket {
    pub waypoint_symbol: WaypointSymbol,
    pub purchase_price: i64,
    pub supply: SupplyLevel,
    pub trade_volume: i32,
}

/// A scored candidate trade identified by the scanner. Ephemeral: consumed
/// by the planner, never persisted past pipeline creation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ManufacturingOpportunity {
    pub system_symbol: SystemSymbol,
    pub product_good: TradeGoodSymbol,
    pub factory_symbol: WaypointSymbol,
    pub sell_market: WaypointSymbol,
    pub sell_price: i64,
    pub supply: SupplyLevel,
    pub activity: Option<ActivityLevel>,
    pub inputs: Vec<OpportunityInput>,
    pub tree_depth: u32,
    pub score: OrderedFloat<f64>,
}

impl ManufacturingOpportunity {
    /// Combined score: batch margin dominates, activity and supply nudge.
    /// Kept in one place so scanner ordering and planner tie-breaks agree.
    pub fn compute_score(expected_batch_revenue: i64, estimated_input_cost: i64, supply: SupplyLevel, activity: Option<ActivityLevel>) -> OrderedFloat<f64> {
        let margin = (expected_batch_revenue - estimated_input_cost) as f64;
        let bonus = (activity_score(activity) + supply_score(supply)) as f64;
        OrderedFloat(margin + bonus)
    }
}
