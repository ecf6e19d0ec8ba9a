use chrono::Utc;
use sf_domain::{ActivityLevel, Market, MarketTradeGood, SupplyLevel, TradeGoodSymbol, TradeGoodType, WaypointSymbol};

pub fn export_good(symbol: &str, purchase_price: i64, supply: SupplyLevel, activity: Option<ActivityLevel>, trade_volume: i32) -> MarketTradeGood {
    MarketTradeGood {
        symbol: TradeGoodSymbol::new(symbol),
        trade_good_type: TradeGoodType::Export,
        trade_volume,
        supply,
        activity,
        purchase_price,
        sell_price: purchase_price - purchase_price / 10,
    }
}

pub fn import_good(symbol: &str, sell_price: i64, trade_volume: i32) -> MarketTradeGood {
    MarketTradeGood {
        symbol: TradeGoodSymbol::new(symbol),
        trade_good_type: TradeGoodType::Import,
        trade_volume,
        supply: SupplyLevel::Moderate,
        activity: None,
        purchase_price: sell_price + sell_price / 10,
        sell_price,
    }
}

pub fn market(waypoint: &str, trade_goods: Vec<MarketTradeGood>) -> (WaypointSymbol, Market) {
    let symbol = WaypointSymbol(waypoint.to_string());
    (
        symbol.clone(),
        Market {
            symbol,
            trade_goods,
            last_updated: Utc::now(),
        },
    )
}
