use anyhow::Result;
use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use sf_domain::{FlightMode, ShipSymbol, WaypointSymbol};
use std::collections::HashMap;
use std::fmt::Debug;

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteLeg {
    pub from: WaypointSymbol,
    pub to: WaypointSymbol,
    pub flight_mode: FlightMode,
    pub fuel_cost: u32,
    pub travel_time_seconds: u64,
    pub refuel_before: bool,
    pub refuel_amount: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlan {
    pub legs: Vec<RouteLeg>,
    pub total_time_seconds: u64,
}

/// External routing/TSP/VRP service. The coordinator is greedy and only
/// uses `plan_route`; the richer operations exist for the coordinators
/// that share this port.
#[automock]
#[async_trait]
pub trait Router: Send + Sync + Debug {
    async fn plan_route(&self, ship: &ShipSymbol, destination: &WaypointSymbol) -> Result<RoutePlan>;
    async fn optimize_fueled_tour(&self, ship: &ShipSymbol, targets: &[WaypointSymbol], return_to: Option<WaypointSymbol>) -> Result<RoutePlan>;
    async fn solve_vrp(&self, ships: &[ShipSymbol], waypoints: &[WaypointSymbol]) -> Result<HashMap<ShipSymbol, Vec<WaypointSymbol>>>;
}
