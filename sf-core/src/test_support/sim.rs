use crate::ports::{MarketData, MarketQuote, PricePoint, PurchaseOutcome, RouteLeg, RoutePlan, Router, SellOutcome, ShipOperations};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use sf_domain::{
    Coordinate, FlightMode, Market, ShipSnapshot, ShipSymbol, SupplyLevel, SystemSymbol, TradeGoodSymbol, TradeGoodType, WaypointSymbol,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct SimTrade {
    pub ship: ShipSymbol,
    pub waypoint: WaypointSymbol,
    pub good: TradeGoodSymbol,
    pub units: u32,
    pub total: i64,
}

#[derive(Debug, Default)]
struct SimState {
    markets: HashMap<WaypointSymbol, Market>,
    coordinates: HashMap<WaypointSymbol, Coordinate>,
    ships: HashMap<ShipSymbol, ShipSnapshot>,
    purchases: Vec<SimTrade>,
    sales: Vec<SimTrade>,
}

/// Deterministic in-memory stand-in for the three external ports, driving
/// executors and scenario tests without any upstream API.
#[derive(Debug, Clone, Default)]
pub struct SimWorld {
    state: Arc<Mutex<SimState>>,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_market(&self, waypoint: WaypointSymbol, market: Market) {
        let mut state = self.state.lock().expect("sim lock poisoned");
        state.markets.insert(waypoint, market);
    }

    pub fn place_waypoint(&self, waypoint: WaypointSymbol, x: i64, y: i64) {
        let mut state = self.state.lock().expect("sim lock poisoned");
        state.coordinates.insert(waypoint, Coordinate { x, y });
    }

    pub fn add_ship(&self, ship: ShipSnapshot) {
        let mut state = self.state.lock().expect("sim lock poisoned");
        state.ships.insert(ship.symbol.clone(), ship);
    }

    pub fn set_supply(&self, waypoint: &WaypointSymbol, good: &TradeGoodSymbol, supply: SupplyLevel) {
        let mut state = self.state.lock().expect("sim lock poisoned");
        if let Some(market) = state.markets.get_mut(waypoint) {
            for tg in market.trade_goods.iter_mut() {
                if &tg.symbol == good {
                    tg.supply = supply;
                }
            }
        }
    }

    pub fn ship(&self, ship: &ShipSymbol) -> ShipSnapshot {
        self.state
            .lock()
            .expect("sim lock poisoned")
            .ships
            .get(ship)
            .cloned()
            .expect("unknown sim ship")
    }

    pub fn purchases(&self) -> Vec<SimTrade> {
        self.state.lock().expect("sim lock poisoned").purchases.clone()
    }

    pub fn sales(&self) -> Vec<SimTrade> {
        self.state.lock().expect("sim lock poisoned").sales.clone()
    }
}

#[async_trait]
impl ShipOperations for SimWorld {
    async fn load(&self, ship: &ShipSymbol) -> Result<ShipSnapshot> {
        let state = self.state.lock().expect("sim lock poisoned");
        state.ships.get(ship).cloned().ok_or_else(|| anyhow!("no such ship {ship}"))
    }

    async fn list_ships(&self) -> Result<Vec<ShipSnapshot>> {
        let state = self.state.lock().expect("sim lock poisoned");
        Ok(state.ships.values().cloned().sorted_by_key(|s| s.symbol.clone()).collect_vec())
    }

    async fn navigate(&self, ship: &ShipSymbol, destination: &WaypointSymbol, _flight_mode: FlightMode) -> Result<()> {
        let mut state = self.state.lock().expect("sim lock poisoned");
        let snapshot = state.ships.get_mut(ship).ok_or_else(|| anyhow!("no such ship {ship}"))?;
        snapshot.location = destination.clone();
        snapshot.is_docked = false;
        Ok(())
    }

    async fn dock(&self, ship: &ShipSymbol) -> Result<()> {
        let mut state = self.state.lock().expect("sim lock poisoned");
        let snapshot = state.ships.get_mut(ship).ok_or_else(|| anyhow!("no such ship {ship}"))?;
        snapshot.is_docked = true;
        Ok(())
    }

    async fn orbit(&self, ship: &ShipSymbol) -> Result<()> {
        let mut state = self.state.lock().expect("sim lock poisoned");
        let snapshot = state.ships.get_mut(ship).ok_or_else(|| anyhow!("no such ship {ship}"))?;
        snapshot.is_docked = false;
        Ok(())
    }

    async fn refuel(&self, ship: &ShipSymbol, _units: Option<u32>) -> Result<()> {
        let mut state = self.state.lock().expect("sim lock poisoned");
        let snapshot = state.ships.get_mut(ship).ok_or_else(|| anyhow!("no such ship {ship}"))?;
        snapshot.fuel_units = snapshot.fuel_capacity;
        Ok(())
    }

    async fn purchase_cargo(&self, ship: &ShipSymbol, good: &TradeGoodSymbol, units: u32) -> Result<PurchaseOutcome> {
        let mut state = self.state.lock().expect("sim lock poisoned");

        let (location, cargo) = {
            let snapshot = state.ships.get(ship).ok_or_else(|| anyhow!("no such ship {ship}"))?;
            (snapshot.location.clone(), snapshot.cargo.clone())
        };

        let price = state
            .markets
            .get(&location)
            .and_then(|market| market.trade_good(good))
            .filter(|tg| tg.trade_good_type != TradeGoodType::Import)
            .map(|tg| tg.purchase_price)
            .ok_or_else(|| anyhow!("{location} does not sell {good}"))?;

        let new_cargo = cargo.with_item_added(good.clone(), units).map_err(|e| anyhow!(e))?;
        state.ships.get_mut(ship).expect("ship vanished").cargo = new_cargo;

        let total = price * units as i64;
        state.purchases.push(SimTrade {
            ship: ship.clone(),
            waypoint: location,
            good: good.clone(),
            units,
            total,
        });

        Ok(PurchaseOutcome {
            units_added: units,
            total_cost: total,
            price_per_unit: price,
        })
    }

    async fn sell_cargo(&self, ship: &ShipSymbol, good: &TradeGoodSymbol, units: u32) -> Result<SellOutcome> {
        let mut state = self.state.lock().expect("sim lock poisoned");

        let (location, cargo) = {
            let snapshot = state.ships.get(ship).ok_or_else(|| anyhow!("no such ship {ship}"))?;
            (snapshot.location.clone(), snapshot.cargo.clone())
        };

        let price = state
            .markets
            .get(&location)
            .and_then(|market| market.trade_good(good))
            .map(|tg| tg.sell_price)
            .ok_or_else(|| anyhow!("{location} does not trade {good}"))?;

        let new_cargo = cargo.with_units_removed(good.clone(), units).map_err(|e| anyhow!(e))?;
        state.ships.get_mut(ship).expect("ship vanished").cargo = new_cargo;

        let total = price * units as i64;
        state.sales.push(SimTrade {
            ship: ship.clone(),
            waypoint: location,
            good: good.clone(),
            units,
            total,
        });

        Ok(SellOutcome {
            units_sold: units,
            total_revenue: total,
            price_per_unit: price,
        })
    }

    async fn jump(&self, _ship: &ShipSymbol, _system: &SystemSymbol) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl MarketData for SimWorld {
    async fn get_market_data(&self, waypoint: &WaypointSymbol) -> Result<Market> {
        let state = self.state.lock().expect("sim lock poisoned");
        state
            .markets
            .get(waypoint)
            .cloned()
            .ok_or_else(|| anyhow!("no market at {waypoint}"))
    }

    async fn find_best_market_buying(&self, good: &TradeGoodSymbol, _system: &SystemSymbol) -> Result<Option<MarketQuote>> {
        let state = self.state.lock().expect("sim lock poisoned");
        Ok(state
            .markets
            .iter()
            .filter_map(|(wps, market)| {
                market
                    .imports()
                    .find(|tg| &tg.symbol == good)
                    .map(|tg| MarketQuote {
                        waypoint_symbol: wps.clone(),
                        price: tg.sell_price,
                    })
            })
            .max_by_key(|quote| quote.price))
    }

    async fn find_all_markets_in_system(&self, _system: &SystemSymbol) -> Result<Vec<WaypointSymbol>> {
        let state = self.state.lock().expect("sim lock poisoned");
        Ok(state.markets.keys().cloned().sorted().collect_vec())
    }

    async fn get_price_history(&self, _waypoint: &WaypointSymbol, _good: &TradeGoodSymbol, _since: DateTime<Utc>, _limit: usize) -> Result<Vec<PricePoint>> {
        Ok(vec![])
    }

    async fn waypoint_coordinate(&self, waypoint: &WaypointSymbol) -> Result<Coordinate> {
        let state = self.state.lock().expect("sim lock poisoned");
        Ok(state.coordinates.get(waypoint).copied().unwrap_or(Coordinate { x: 0, y: 0 }))
    }
}

#[async_trait]
impl Router for SimWorld {
    async fn plan_route(&self, ship: &ShipSymbol, destination: &WaypointSymbol) -> Result<RoutePlan> {
        let from = self.load(ship).await?.location;
        if &from == destination {
            return Ok(RoutePlan {
                legs: vec![],
                total_time_seconds: 0,
            });
        }
        Ok(RoutePlan {
            legs: vec![RouteLeg {
                from,
                to: destination.clone(),
                flight_mode: FlightMode::Cruise,
                fuel_cost: 1,
                travel_time_seconds: 0,
                refuel_before: false,
                refuel_amount: None,
            }],
            total_time_seconds: 0,
        })
    }

    async fn optimize_fueled_tour(&self, ship: &ShipSymbol, targets: &[WaypointSymbol], _return_to: Option<WaypointSymbol>) -> Result<RoutePlan> {
        let mut legs = vec![];
        let mut from = self.load(ship).await?.location;
        for target in targets {
            legs.push(RouteLeg {
                from: from.clone(),
                to: target.clone(),
                flight_mode: FlightMode::Cruise,
                fuel_cost: 1,
                travel_time_seconds: 0,
                refuel_before: false,
                refuel_amount: None,
            });
            from = target.clone();
        }
        Ok(RoutePlan {
            legs,
            total_time_seconds: 0,
        })
    }

    async fn solve_vrp(&self, ships: &[ShipSymbol], waypoints: &[WaypointSymbol]) -> Result<HashMap<ShipSymbol, Vec<WaypointSymbol>>> {
        // round-robin is plenty for tests
        let mut assignments: HashMap<ShipSymbol, Vec<WaypointSymbol>> = HashMap::new();
        for (idx, waypoint) in waypoints.iter().enumerate() {
            if let Some(ship) = ships.get(idx % ships.len().max(1)) {
                assignments.entry(ship.clone()).or_default().push(waypoint.clone());
            }
        }
        Ok(assignments)
    }
}

pub fn hauler(symbol: &str, at: &str, capacity: u32) -> ShipSnapshot {
    ShipSnapshot {
        symbol: ShipSymbol(symbol.to_string()),
        location: WaypointSymbol(at.to_string()),
        is_docked: false,
        fuel_units: 400,
        fuel_capacity: 400,
        cargo: sf_domain::Cargo::empty(capacity),
        engine_speed: 30,
        is_hauler: true,
    }
}
