use crate::ports::MarketData;
use anyhow::{anyhow, Result};
use itertools::Itertools;
use sf_domain::{Market, MarketTradeGood, SupplyLevel, SystemSymbol, TradeGoodSymbol, WaypointSymbol};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PlanningStrategy {
    PreferBuy,
    PreferFabricate,
    Smart,
}

impl PlanningStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        Self::from_str(s).map_err(|_| anyhow!("unknown strategy '{}', expected prefer-buy | prefer-fabricate | smart", s))
    }
}

/// One scan's worth of market data for a system, indexed for the queries
/// the finder and the resolver keep asking.
#[derive(Debug, Clone)]
pub struct SystemMarkets {
    pub system_symbol: SystemSymbol,
    pub markets: HashMap<WaypointSymbol, Market>,
}

impl SystemMarkets {
    pub async fn snapshot(market_data: &dyn MarketData, system_symbol: &SystemSymbol) -> Result<Self> {
        let waypoints = market_data.find_all_markets_in_system(system_symbol).await?;
        let mut markets = HashMap::new();
        for waypoint in waypoints {
            let market = market_data.get_market_data(&waypoint).await?;
            markets.insert(waypoint, market);
        }
        Ok(Self {
            system_symbol: system_symbol.clone(),
            markets,
        })
    }

    pub fn exporters_of(&self, good: &TradeGoodSymbol) -> Vec<(&WaypointSymbol, &MarketTradeGood)> {
        self.markets
            .iter()
            .filter_map(|(wps, market)| market.exports().find(|tg| &tg.symbol == good).map(|tg| (wps, tg)))
            .collect_vec()
    }

    pub fn importers_of(&self, good: &TradeGoodSymbol) -> Vec<(&WaypointSymbol, &MarketTradeGood)> {
        self.markets
            .iter()
            .filter_map(|(wps, market)| market.imports().find(|tg| &tg.symbol == good).map(|tg| (wps, tg)))
            .collect_vec()
    }

    /// Cheapest export market selling the good.
    pub fn best_export_of(&self, good: &TradeGoodSymbol) -> Option<(&WaypointSymbol, &MarketTradeGood)> {
        self.exporters_of(good)
            .into_iter()
            .min_by_key(|(_, tg)| tg.purchase_price)
    }

    /// Highest-paying import market buying the good, excluding the factory
    /// itself.
    pub fn best_import_of(&self, good: &TradeGoodSymbol, exclude: &WaypointSymbol) -> Option<(&WaypointSymbol, &MarketTradeGood)> {
        self.importers_of(good)
            .into_iter()
            .filter(|(wps, _)| *wps != exclude)
            .max_by_key(|(_, tg)| tg.sell_price)
    }

    /// The goods a factory waypoint consumes to produce its exports.
    pub fn required_inputs_of(&self, factory: &WaypointSymbol) -> HashMap<TradeGoodSymbol, u32> {
        self.markets
            .get(factory)
            .map(|market| {
                market
                    .imports()
                    .map(|tg| (tg.symbol.clone(), tg.trade_volume.max(1) as u32))
                    .collect()
            })
            .unwrap_or_default()
    }
}

const MAX_FABRICATION_DEPTH: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum PlannedSource {
    /// Plain purchase at an export market.
    Buy {
        market: WaypointSymbol,
        purchase_price: i64,
    },
    /// The input comes out of another factory we also feed.
    Fabricate { plan: Box<FactoryPlan> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedInput {
    pub good: TradeGoodSymbol,
    pub quantity: u32,
    pub source: PlannedSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactoryPlan {
    pub factory_symbol: WaypointSymbol,
    pub output_good: TradeGoodSymbol,
    pub inputs: Vec<PlannedInput>,
    pub depth: u32,
}

impl FactoryPlan {
    pub fn max_depth(&self) -> u32 {
        self.inputs
            .iter()
            .filter_map(|input| match &input.source {
                PlannedSource::Fabricate { plan } => Some(plan.max_depth()),
                PlannedSource::Buy { .. } => None,
            })
            .max()
            .unwrap_or(self.depth)
    }
}

/// Decides buy-vs-fabricate per input and unfolds the factory tree.
#[derive(Debug, Default)]
pub struct SupplyChainResolver;

impl SupplyChainResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(
        &self,
        markets: &SystemMarkets,
        factory_symbol: &WaypointSymbol,
        output_good: &TradeGoodSymbol,
        strategy: PlanningStrategy,
    ) -> Result<FactoryPlan> {
        let mut on_path = HashSet::new();
        self.resolve_factory(markets, factory_symbol, output_good, strategy, 1, &mut on_path)
    }

    fn resolve_factory(
        &self,
        markets: &SystemMarkets,
        factory_symbol: &WaypointSymbol,
        output_good: &TradeGoodSymbol,
        strategy: PlanningStrategy,
        depth: u32,
        on_path: &mut HashSet<TradeGoodSymbol>,
    ) -> Result<FactoryPlan> {
        on_path.insert(output_good.clone());

        let required = markets.required_inputs_of(factory_symbol);
        if required.is_empty() {
            return Err(anyhow!("factory {} has no import side for {}", factory_symbol, output_good));
        }

        let mut inputs = vec![];
        for (good, quantity) in required.into_iter().sorted_by_key(|(good, _)| good.clone()) {
            let (source_market, source_entry) = markets
                .best_export_of(&good)
                .ok_or_else(|| anyhow!("no market in {} sells {}", markets.system_symbol, good))?;

            let fabricate = !on_path.contains(&good)
                && depth < MAX_FABRICATION_DEPTH
                && match strategy {
                    PlanningStrategy::PreferBuy => false,
                    PlanningStrategy::PreferFabricate => true,
                    // feed the source factory only when its own production
                    // is starved enough that plain buying would stall
                    PlanningStrategy::Smart => matches!(source_entry.supply, SupplyLevel::Scarce | SupplyLevel::Limited),
                };

            let source = if fabricate {
                match self.resolve_factory(markets, source_market, &good, strategy, depth + 1, on_path) {
                    Ok(plan) => PlannedSource::Fabricate { plan: Box::new(plan) },
                    // a source factory we cannot feed is still a valid buy
                    Err(_) => PlannedSource::Buy {
                        market: source_market.clone(),
                        purchase_price: source_entry.purchase_price,
                    },
                }
            } else {
                PlannedSource::Buy {
                    market: source_market.clone(),
                    purchase_price: source_entry.purchase_price,
                }
            };

            inputs.push(PlannedInput { good, quantity, source });
        }

        on_path.remove(output_good);

        Ok(FactoryPlan {
            factory_symbol: factory_symbol.clone(),
            output_good: output_good.clone(),
            inputs,
            depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::markets::{export_good, import_good, market};
    use sf_domain::ActivityLevel;

    fn electronics_system() -> SystemMarkets {
        // F1 exports ELECTRONICS from COPPER; M2 exports COPPER; M1 buys ELECTRONICS
        SystemMarkets {
            system_symbol: SystemSymbol("X1-A".to_string()),
            markets: HashMap::from([
                market(
                    "X1-A-F1",
                    vec![
                        export_good("ELECTRONICS", 1_500, SupplyLevel::Moderate, Some(ActivityLevel::Weak), 40),
                        import_good("COPPER", 45, 100),
                    ],
                ),
                market("X1-A-M2", vec![export_good("COPPER", 30, SupplyLevel::High, None, 60)]),
                market("X1-A-M1", vec![import_good("ELECTRONICS", 1_800, 40)]),
            ]),
        }
    }

    #[test]
    fn prefer_buy_resolves_flat_plan() {
        let markets = electronics_system();
        let plan = SupplyChainResolver::new()
            .resolve(
                &markets,
                &WaypointSymbol("X1-A-F1".to_string()),
                &TradeGoodSymbol::new("ELECTRONICS"),
                PlanningStrategy::PreferBuy,
            )
            .unwrap();

        assert_eq!(plan.inputs.len(), 1);
        assert_eq!(plan.inputs[0].good, TradeGoodSymbol::new("COPPER"));
        assert_eq!(plan.inputs[0].quantity, 100);
        assert!(matches!(
            &plan.inputs[0].source,
            PlannedSource::Buy { market, .. } if market.0 == "X1-A-M2"
        ));
    }

    #[test]
    fn unsourceable_input_fails_resolution() {
        let markets = SystemMarkets {
            system_symbol: SystemSymbol("X1-A".to_string()),
            markets: HashMap::from([market(
                "X1-A-F1",
                vec![
                    export_good("ELECTRONICS", 1_500, SupplyLevel::Moderate, None, 40),
                    import_good("RARE_EARTHS", 45, 100),
                ],
            )]),
        };

        let result = SupplyChainResolver::new().resolve(
            &markets,
            &WaypointSymbol("X1-A-F1".to_string()),
            &TradeGoodSymbol::new("ELECTRONICS"),
            PlanningStrategy::PreferBuy,
        );
        assert!(result.is_err());
    }

    #[test]
    fn smart_fabricates_only_starved_inputs() {
        // copper is scarce at its export market, so smart feeds the copper factory
        let markets = SystemMarkets {
            system_symbol: SystemSymbol("X1-A".to_string()),
            markets: HashMap::from([
                market(
                    "X1-A-F1",
                    vec![
                        export_good("ELECTRONICS", 1_500, SupplyLevel::Moderate, None, 40),
                        import_good("COPPER", 45, 100),
                    ],
                ),
                market(
                    "X1-A-F2",
                    vec![
                        export_good("COPPER", 30, SupplyLevel::Scarce, None, 60),
                        import_good("COPPER_ORE", 8, 120),
                    ],
                ),
                market("X1-A-M3", vec![export_good("COPPER_ORE", 5, SupplyLevel::Abundant, None, 200)]),
            ]),
        };

        let plan = SupplyChainResolver::new()
            .resolve(
                &markets,
                &WaypointSymbol("X1-A-F1".to_string()),
                &TradeGoodSymbol::new("ELECTRONICS"),
                PlanningStrategy::Smart,
            )
            .unwrap();

        match &plan.inputs[0].source {
            PlannedSource::Fabricate { plan: sub } => {
                assert_eq!(sub.factory_symbol.0, "X1-A-F2");
                assert_eq!(sub.inputs.len(), 1);
                assert_eq!(sub.inputs[0].good, TradeGoodSymbol::new("COPPER_ORE"));
                // abundant ore is bought, not fabricated further
                assert!(matches!(&sub.inputs[0].source, PlannedSource::Buy { .. }));
            }
            other => panic!("expected fabricate, got {other:?}"),
        }
        assert_eq!(plan.max_depth(), 2);
    }

    #[test]
    fn strategy_parses_kebab_case() {
        assert_eq!(PlanningStrategy::parse("prefer-buy").unwrap(), PlanningStrategy::PreferBuy);
        assert_eq!(PlanningStrategy::parse("smart").unwrap(), PlanningStrategy::Smart);
        assert!(PlanningStrategy::parse("greedy").is_err());
    }
}
