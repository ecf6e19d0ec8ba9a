use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use serde::{Deserialize, Serialize};
use sf_domain::{Coordinate, Market, SystemSymbol, TradeGoodSymbol, WaypointSymbol};
use std::fmt::Debug;

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketQuote {
    pub waypoint_symbol: WaypointSymbol,
    pub price: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub purchase_price: i64,
    pub sell_price: i64,
    pub observed_at: DateTime<Utc>,
}

/// Read-only market view backed by whatever observation machinery the
/// daemon runs (probe ships, cached scans).
#[automock]
#[async_trait]
pub trait MarketData: Send + Sync + Debug {
    async fn get_market_data(&self, waypoint: &WaypointSymbol) -> Result<Market>;
    /// Best market *buying* the good (highest sell-to price), for
    /// liquidation targets.
    async fn find_best_market_buying(&self, good: &TradeGoodSymbol, system: &SystemSymbol) -> Result<Option<MarketQuote>>;
    async fn find_all_markets_in_system(&self, system: &SystemSymbol) -> Result<Vec<WaypointSymbol>>;
    async fn get_price_history(&self, waypoint: &WaypointSymbol, good: &TradeGoodSymbol, since: DateTime<Utc>, limit: usize) -> Result<Vec<PricePoint>>;
    async fn waypoint_coordinate(&self, waypoint: &WaypointSymbol) -> Result<Coordinate>;
}
