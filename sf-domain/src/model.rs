use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::hash::Hash;
use strum::{Display, EnumIter, EnumString};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PlayerId(pub String);

impl Display for PlayerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct SystemSymbol(pub String);

impl SystemSymbol {
    pub fn with_waypoint_suffix(&self, suffix: &str) -> WaypointSymbol {
        WaypointSymbol(format!("{}-{}", self.0, suffix))
    }
}

impl Display for SystemSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct WaypointSymbol(pub String);

impl WaypointSymbol {
    /// `X1-AB12-C34` belongs to system `X1-AB12`.
    pub fn system_symbol(&self) -> SystemSymbol {
        let parts: Vec<&str> = self.0.splitn(3, '-').collect();
        if parts.len() >= 2 {
            SystemSymbol(format!("{}-{}", parts[0], parts[1]))
        } else {
            SystemSymbol(self.0.clone())
        }
    }
}

impl Display for WaypointSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ShipSymbol(pub String);

impl Display for ShipSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TradeGoodSymbol(pub String);

impl TradeGoodSymbol {
    pub fn new(s: impl Into<String>) -> Self {
        TradeGoodSymbol(s.into())
    }
}

impl Display for TradeGoodSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SupplyLevel {
    Scarce = 0,
    Limited = 1,
    Moderate = 2,
    High = 3,
    Abundant = 4,
}

impl SupplyLevel {
    pub fn is_collectable(&self) -> bool {
        matches!(self, SupplyLevel::High | SupplyLevel::Abundant)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityLevel {
    Weak,
    Growing,
    Strong,
    Restricted,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeGoodType {
    Export,
    Import,
    Exchange,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketTradeGood {
    pub symbol: TradeGoodSymbol,
    #[serde(rename = "type")]
    pub trade_good_type: TradeGoodType,
    pub trade_volume: i32,
    pub supply: SupplyLevel,
    pub activity: Option<ActivityLevel>,
    pub purchase_price: i64,
    pub sell_price: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub symbol: WaypointSymbol,
    pub trade_goods: Vec<MarketTradeGood>,
    pub last_updated: DateTime<Utc>,
}

impl Market {
    pub fn trade_good(&self, good: &TradeGoodSymbol) -> Option<&MarketTradeGood> {
        self.trade_goods.iter().find(|tg| &tg.symbol == good)
    }

    pub fn exports(&self) -> impl Iterator<Item = &MarketTradeGood> {
        self.trade_goods
            .iter()
            .filter(|tg| tg.trade_good_type == TradeGoodType::Export)
    }

    pub fn imports(&self) -> impl Iterator<Item = &MarketTradeGood> {
        self.trade_goods
            .iter()
            .filter(|tg| tg.trade_good_type == TradeGoodType::Import)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightMode {
    Drift,
    Stealth,
    Cruise,
    Burn,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub symbol: TradeGoodSymbol,
    pub units: u32,
}

impl Inventory {
    pub fn new(symbol: TradeGoodSymbol, units: u32) -> Self {
        Self { symbol, units }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cargo {
    pub capacity: u32,
    pub units: u32,
    pub inventory: Vec<Inventory>,
}

impl Cargo {
    pub fn empty(capacity: u32) -> Self {
        Self {
            capacity,
            units: 0,
            inventory: vec![],
        }
    }

    pub fn available_space(&self) -> u32 {
        self.capacity.saturating_sub(self.units)
    }

    pub fn units_of(&self, good: &TradeGoodSymbol) -> u32 {
        self.inventory
            .iter()
            .filter(|inv| &inv.symbol == good)
            .map(|inv| inv.units)
            .sum()
    }

    pub fn with_item_added(mut self, good: TradeGoodSymbol, units: u32) -> Result<Self, CargoError> {
        if self.available_space() < units {
            return Err(CargoError::NotEnoughSpace {
                capacity: self.capacity,
                units: self.units,
                requested: units,
            });
        }
        self.units += units;
        match self.inventory.iter_mut().find(|inv| inv.symbol == good) {
            Some(entry) => entry.units += units,
            None => self.inventory.push(Inventory::new(good, units)),
        }
        Ok(self)
    }

    pub fn with_units_removed(mut self, good: TradeGoodSymbol, units: u32) -> Result<Self, CargoError> {
        let held = self.units_of(&good);
        if held < units {
            return Err(CargoError::NotEnoughUnits { good, held, requested: units });
        }
        self.units -= units;
        if let Some(entry) = self.inventory.iter_mut().find(|inv| inv.symbol == good) {
            entry.units -= units;
        }
        self.inventory.retain(|inv| inv.units > 0);
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CargoError {
    #[error("not enough space in cargo ({units}/{capacity} used, requested {requested})")]
    NotEnoughSpace { capacity: u32, units: u32, requested: u32 },
    #[error("not enough units of {good} in cargo (held {held}, requested {requested})")]
    NotEnoughUnits {
        good: TradeGoodSymbol,
        held: u32,
        requested: u32,
    },
}

/// Current view of a ship as reported by the upstream game API.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShipSnapshot {
    pub symbol: ShipSymbol,
    pub location: WaypointSymbol,
    pub is_docked: bool,
    pub fuel_units: u32,
    pub fuel_capacity: u32,
    pub cargo: Cargo,
    pub engine_speed: u32,
    pub is_hauler: bool,
}

impl ShipSnapshot {
    pub fn system_symbol(&self) -> SystemSymbol {
        self.location.system_symbol()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Coordinate {
    pub x: i64,
    pub y: i64,
}

pub fn distance_between(a: &Coordinate, b: &Coordinate) -> u32 {
    let dx = (b.x - a.x) as f64;
    let dy = (b.y - a.y) as f64;
    (dx * dx + dy * dy).sqrt().round() as u32
}
