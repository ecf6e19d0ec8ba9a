use anyhow::Result;
use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use sf_domain::{FlightMode, ShipSnapshot, ShipSymbol, SystemSymbol, TradeGoodSymbol, WaypointSymbol};
use std::fmt::Debug;

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOutcome {
    pub units_added: u32,
    pub total_cost: i64,
    pub price_per_unit: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SellOutcome {
    pub units_sold: u32,
    pub total_revenue: i64,
    pub price_per_unit: i64,
}

/// Upstream game API surface for driving one ship. Implementations wrap
/// the HTTP client and its rate limiting; the core only sees this trait.
#[automock]
#[async_trait]
pub trait ShipOperations: Send + Sync + Debug {
    async fn load(&self, ship: &ShipSymbol) -> Result<ShipSnapshot>;
    async fn list_ships(&self) -> Result<Vec<ShipSnapshot>>;
    async fn navigate(&self, ship: &ShipSymbol, destination: &WaypointSymbol, flight_mode: FlightMode) -> Result<()>;
    async fn dock(&self, ship: &ShipSymbol) -> Result<()>;
    async fn orbit(&self, ship: &ShipSymbol) -> Result<()>;
    async fn refuel(&self, ship: &ShipSymbol, units: Option<u32>) -> Result<()>;
    async fn purchase_cargo(&self, ship: &ShipSymbol, good: &TradeGoodSymbol, units: u32) -> Result<PurchaseOutcome>;
    async fn sell_cargo(&self, ship: &ShipSymbol, good: &TradeGoodSymbol, units: u32) -> Result<SellOutcome>;
    async fn jump(&self, ship: &ShipSymbol, system: &SystemSymbol) -> Result<()>;
}
