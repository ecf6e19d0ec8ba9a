use crate::supply_chain::SystemMarkets;
use itertools::Itertools;
use sf_domain::{ManufacturingOpportunity, OpportunityInput, SourceMarket};
use tracing::{event, Level};

/// Scans a system's markets for goods worth manufacturing: an export
/// market (the factory) with a distinct import market willing to pay for
/// the product.
#[derive(Debug, Default)]
pub struct DemandFinder;

impl DemandFinder {
    pub fn new() -> Self {
        Self
    }

    pub fn find_opportunities(&self, markets: &SystemMarkets, min_purchase_price: i64, limit: usize) -> Vec<ManufacturingOpportunity> {
        let mut opportunities = vec![];

        for (factory_symbol, market) in markets.markets.iter() {
            for export in market.exports() {
                if export.purchase_price < min_purchase_price {
                    continue;
                }

                let Some((sell_market, sell_entry)) = markets.best_import_of(&export.symbol, factory_symbol) else {
                    continue;
                };

                let required = markets.required_inputs_of(factory_symbol);
                if required.is_empty() {
                    continue;
                }

                let inputs = required
                    .into_iter()
                    .sorted_by_key(|(good, _)| good.clone())
                    .map(|(good, units)| {
                        let best_source = markets.best_export_of(&good).map(|(wps, tg)| SourceMarket {
                            waypoint_symbol: wps.clone(),
                            purchase_price: tg.purchase_price,
                            supply: tg.supply,
                            trade_volume: tg.trade_volume,
                        });
                        OpportunityInput { good, units, best_source }
                    })
                    .collect_vec();

                // an input nobody sells makes the whole chain unbuildable
                if inputs.iter().any(|input| input.best_source.is_none()) {
                    continue;
                }

                let estimated_input_cost: i64 = inputs
                    .iter()
                    .map(|input| {
                        input
                            .best_source
                            .as_ref()
                            .map(|source| source.purchase_price * input.units as i64)
                            .unwrap_or(0)
                    })
                    .sum();

                // one production batch: what a full trade volume fetches at
                // the sell market against feeding the factory once
                let expected_batch_revenue = sell_entry.sell_price * export.trade_volume.max(1) as i64;
                let score = ManufacturingOpportunity::compute_score(expected_batch_revenue, estimated_input_cost, export.supply, export.activity);

                opportunities.push(ManufacturingOpportunity {
                    system_symbol: markets.system_symbol.clone(),
                    product_good: export.symbol.clone(),
                    factory_symbol: factory_symbol.clone(),
                    sell_market: sell_market.clone(),
                    sell_price: sell_entry.sell_price,
                    supply: export.supply,
                    activity: export.activity,
                    inputs,
                    tree_depth: 1,
                    score,
                });
            }
        }

        event!(
            Level::DEBUG,
            "demand scan found {} candidates in {}",
            opportunities.len(),
            markets.system_symbol
        );

        opportunities
            .into_iter()
            .sorted_by(|a, b| b.score.cmp(&a.score))
            .take(limit)
            .collect_vec()
    }
}
