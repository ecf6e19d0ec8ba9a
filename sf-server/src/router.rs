use anyhow::Result;
use async_trait::async_trait;
use sf_core::ports::{MarketData, RouteLeg, RoutePlan, Router, ShipOperations};
use sf_domain::{distance_between, FlightMode, ShipSymbol, WaypointSymbol};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

fn fuel_for(flight_mode: FlightMode, distance: u32) -> u32 {
    match flight_mode {
        FlightMode::Drift => 1,
        FlightMode::Cruise | FlightMode::Stealth => distance.max(1),
        FlightMode::Burn => 2 * distance.max(1),
    }
}

fn travel_time(flight_mode: FlightMode, distance: u32, engine_speed: u32) -> u64 {
    let multiplier: f64 = match flight_mode {
        FlightMode::Drift => 250.0,
        FlightMode::Stealth => 30.0,
        FlightMode::Cruise => 25.0,
        FlightMode::Burn => 12.5,
    };
    ((distance.max(1) as f64) * multiplier / engine_speed.max(1) as f64 + 15.0).round() as u64
}

/// In-process route planning: direct legs, cruise when the tank allows,
/// drift as the fallback, refuel stop before a leg that needs it. The
/// richer tour/VRP shapes are greedy; the coordinator only ever calls
/// `plan_route`.
#[derive(Debug)]
pub struct DirectRouter {
    ship_ops: Arc<dyn ShipOperations>,
    market_data: Arc<dyn MarketData>,
}

impl DirectRouter {
    pub fn new(ship_ops: Arc<dyn ShipOperations>, market_data: Arc<dyn MarketData>) -> Self {
        Self { ship_ops, market_data }
    }

    async fn leg(&self, from: &WaypointSymbol, to: &WaypointSymbol, fuel_available: u32, fuel_capacity: u32, engine_speed: u32) -> Result<RouteLeg> {
        let from_coord = self.market_data.waypoint_coordinate(from).await?;
        let to_coord = self.market_data.waypoint_coordinate(to).await?;
        let distance = distance_between(&from_coord, &to_coord);

        let cruise_fuel = fuel_for(FlightMode::Cruise, distance);
        let (flight_mode, fuel_cost) = if cruise_fuel <= fuel_capacity {
            (FlightMode::Cruise, cruise_fuel)
        } else {
            (FlightMode::Drift, fuel_for(FlightMode::Drift, distance))
        };

        Ok(RouteLeg {
            from: from.clone(),
            to: to.clone(),
            flight_mode,
            fuel_cost,
            travel_time_seconds: travel_time(flight_mode, distance, engine_speed),
            refuel_before: fuel_cost > fuel_available,
            refuel_amount: None,
        })
    }
}

#[async_trait]
impl Router for DirectRouter {
    async fn plan_route(&self, ship: &ShipSymbol, destination: &WaypointSymbol) -> Result<RoutePlan> {
        let snapshot = self.ship_ops.load(ship).await?;
        if &snapshot.location == destination {
            return Ok(RoutePlan {
                legs: vec![],
                total_time_seconds: 0,
            });
        }

        let leg = self
            .leg(&snapshot.location, destination, snapshot.fuel_units, snapshot.fuel_capacity, snapshot.engine_speed)
            .await?;
        Ok(RoutePlan {
            total_time_seconds: leg.travel_time_seconds,
            legs: vec![leg],
        })
    }

    async fn optimize_fueled_tour(&self, ship: &ShipSymbol, targets: &[WaypointSymbol], return_to: Option<WaypointSymbol>) -> Result<RoutePlan> {
        let snapshot = self.ship_ops.load(ship).await?;

        // nearest-neighbor ordering
        let mut remaining: Vec<WaypointSymbol> = targets.to_vec();
        let mut ordered = vec![];
        let mut at = snapshot.location.clone();
        while !remaining.is_empty() {
            let at_coord = self.market_data.waypoint_coordinate(&at).await?;
            let mut best_idx = 0;
            let mut best_distance = u32::MAX;
            for (idx, candidate) in remaining.iter().enumerate() {
                let coord = self.market_data.waypoint_coordinate(candidate).await?;
                let distance = distance_between(&at_coord, &coord);
                if distance < best_distance {
                    best_distance = distance;
                    best_idx = idx;
                }
            }
            at = remaining.remove(best_idx);
            ordered.push(at.clone());
        }
        if let Some(home) = return_to {
            ordered.push(home);
        }

        let mut legs = vec![];
        let mut from = snapshot.location.clone();
        let mut fuel = snapshot.fuel_units;
        for target in ordered {
            let leg = self.leg(&from, &target, fuel, snapshot.fuel_capacity, snapshot.engine_speed).await?;
            // assume a refuel stop tops the tank up
            fuel = if leg.refuel_before {
                snapshot.fuel_capacity - leg.fuel_cost
            } else {
                fuel.saturating_sub(leg.fuel_cost)
            };
            from = target.clone();
            legs.push(leg);
        }

        Ok(RoutePlan {
            total_time_seconds: legs.iter().map(|l| l.travel_time_seconds).sum(),
            legs,
        })
    }

    async fn solve_vrp(&self, ships: &[ShipSymbol], waypoints: &[WaypointSymbol]) -> Result<HashMap<ShipSymbol, Vec<WaypointSymbol>>> {
        let mut positions = HashMap::new();
        for ship in ships {
            let snapshot = self.ship_ops.load(ship).await?;
            let coord = self.market_data.waypoint_coordinate(&snapshot.location).await?;
            positions.insert(ship.clone(), coord);
        }

        let mut assignments: HashMap<ShipSymbol, Vec<WaypointSymbol>> = HashMap::new();
        for waypoint in waypoints {
            let coord = self.market_data.waypoint_coordinate(waypoint).await?;
            let Some((ship, _)) = positions
                .iter()
                .min_by_key(|(ship, position)| (distance_between(position, &coord), (*ship).clone()))
            else {
                continue;
            };
            assignments.entry(ship.clone()).or_default().push(waypoint.clone());
        }
        Ok(assignments)
    }
}
