use crate::supply_chain::{FactoryPlan, PlannedSource, PlanningStrategy, SupplyChainResolver, SystemMarkets};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use sf_domain::{
    FactoryState, ManufacturingOpportunity, ManufacturingPipeline, ManufacturingTask, PlayerId, TaskId, TaskType,
};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct PlannedPipeline {
    pub pipeline: ManufacturingPipeline,
    pub tasks: Vec<ManufacturingTask>,
    pub factory_states: Vec<FactoryState>,
}

/// Turns a scored opportunity into a persistable pipeline: the resolved
/// factory tree becomes AcquireDeliver tasks per input, one FactoryState
/// per factory, and a single CollectSell for the product.
#[derive(Debug, Default)]
pub struct PipelinePlanner {
    resolver: SupplyChainResolver,
}

impl PipelinePlanner {
    pub fn new() -> Self {
        Self {
            resolver: SupplyChainResolver::new(),
        }
    }

    pub fn create_pipeline(
        &self,
        player_id: &PlayerId,
        opportunity: &ManufacturingOpportunity,
        markets: &SystemMarkets,
        strategy: PlanningStrategy,
        now: DateTime<Utc>,
    ) -> Result<PlannedPipeline> {
        let plan = self
            .resolver
            .resolve(markets, &opportunity.factory_symbol, &opportunity.product_good, strategy)?;

        let pipeline = ManufacturingPipeline::new(
            player_id.clone(),
            opportunity.system_symbol.clone(),
            opportunity.product_good.clone(),
            opportunity.sell_market.clone(),
            now,
        );

        let mut tasks = vec![];
        let mut factory_states = vec![];
        let product_feeders = self.flatten_factory(&plan, &pipeline, player_id, &mut tasks, &mut factory_states, now);

        let mut collect = ManufacturingTask::new(
            pipeline.id.clone(),
            player_id.clone(),
            TaskType::CollectSell,
            opportunity.product_good.clone(),
            0,
            None,
            Some(opportunity.factory_symbol.clone()),
            Some(opportunity.sell_market.clone()),
            now,
        );
        collect.depends_on = product_feeders;
        tasks.push(collect);

        Self::ensure_acyclic(&tasks)?;

        Ok(PlannedPipeline {
            pipeline,
            tasks,
            factory_states,
        })
    }

    /// Emits the AcquireDeliver tasks feeding one factory (recursing into
    /// fabricated inputs) and returns their ids.
    fn flatten_factory(
        &self,
        plan: &FactoryPlan,
        pipeline: &ManufacturingPipeline,
        player_id: &PlayerId,
        tasks: &mut Vec<ManufacturingTask>,
        factory_states: &mut Vec<FactoryState>,
        now: DateTime<Utc>,
    ) -> HashSet<TaskId> {
        let required_inputs = plan
            .inputs
            .iter()
            .map(|input| (input.good.clone(), input.quantity))
            .collect::<HashMap<_, _>>();
        factory_states.push(FactoryState::new(
            pipeline.id.clone(),
            plan.factory_symbol.clone(),
            plan.output_good.clone(),
            required_inputs,
        ));

        let mut feeders = HashSet::new();
        for input in &plan.inputs {
            match &input.source {
                PlannedSource::Buy { market, .. } => {
                    let task = ManufacturingTask::new(
                        pipeline.id.clone(),
                        player_id.clone(),
                        TaskType::AcquireDeliver,
                        input.good.clone(),
                        input.quantity,
                        Some(market.clone()),
                        Some(plan.factory_symbol.clone()),
                        None,
                        now,
                    );
                    feeders.insert(task.id.clone());
                    tasks.push(task);
                }
                PlannedSource::Fabricate { plan: sub } => {
                    let sub_feeders = self.flatten_factory(sub, pipeline, player_id, tasks, factory_states, now);
                    let mut task = ManufacturingTask::new(
                        pipeline.id.clone(),
                        player_id.clone(),
                        TaskType::AcquireDeliver,
                        input.good.clone(),
                        input.quantity,
                        Some(sub.factory_symbol.clone()),
                        Some(plan.factory_symbol.clone()),
                        None,
                        now,
                    );
                    task.depends_on = sub_feeders;
                    feeders.insert(task.id.clone());
                    tasks.push(task);
                }
            }
        }
        feeders
    }

    fn ensure_acyclic(tasks: &[ManufacturingTask]) -> Result<()> {
        let mut graph: DiGraph<&TaskId, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for task in tasks {
            nodes.insert(&task.id, graph.add_node(&task.id));
        }
        for task in tasks {
            for dep in &task.depends_on {
                let dep_node = nodes
                    .get(dep)
                    .copied()
                    .ok_or_else(|| anyhow!("task {} depends on unknown task {}", task.id, dep))?;
                graph.add_edge(dep_node, nodes[&task.id], ());
            }
        }
        toposort(&graph, None).map_err(|_| anyhow!("planned task graph contains a cycle"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demand_finder::DemandFinder;
    use crate::test_support::markets::{export_good, import_good, market};
    use sf_domain::{ActivityLevel, PipelineStatus, SupplyLevel, SystemSymbol, TaskStatus, TradeGoodSymbol, WaypointSymbol};

    fn electronics_markets() -> SystemMarkets {
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

    fn plan(markets: &SystemMarkets, strategy: PlanningStrategy) -> PlannedPipeline {
        let opportunity = DemandFinder::new()
            .find_opportunities(markets, 0, 1)
            .into_iter()
            .next()
            .expect("no opportunity found");
        PipelinePlanner::new()
            .create_pipeline(&PlayerId("player-1".to_string()), &opportunity, markets, strategy, Utc::now())
            .unwrap()
    }

    #[test]
    fn single_input_pipeline_shape() {
        let planned = plan(&electronics_markets(), PlanningStrategy::PreferBuy);

        assert_eq!(planned.pipeline.status, PipelineStatus::Planning);
        assert_eq!(planned.pipeline.product_good, TradeGoodSymbol::new("ELECTRONICS"));
        assert_eq!(planned.tasks.len(), 2);
        assert_eq!(planned.factory_states.len(), 1);

        let acquire = planned
            .tasks
            .iter()
            .find(|t| t.task_type == TaskType::AcquireDeliver)
            .unwrap();
        assert_eq!(acquire.good, TradeGoodSymbol::new("COPPER"));
        assert_eq!(acquire.quantity, 100);
        assert_eq!(acquire.source_market, Some(WaypointSymbol("X1-A-M2".to_string())));
        assert_eq!(acquire.factory_symbol, Some(WaypointSymbol("X1-A-F1".to_string())));
        assert!(acquire.is_root());
        assert_eq!(acquire.status, TaskStatus::Pending);

        let collect = planned
            .tasks
            .iter()
            .find(|t| t.task_type == TaskType::CollectSell)
            .unwrap();
        assert_eq!(collect.quantity, 0);
        assert_eq!(collect.target_market, Some(WaypointSymbol("X1-A-M1".to_string())));
        assert_eq!(collect.depends_on, HashSet::from([acquire.id.clone()]));

        let factory = &planned.factory_states[0];
        assert_eq!(factory.required_inputs.get(&TradeGoodSymbol::new("COPPER")), Some(&100));
        assert!(!factory.ready_for_collection);
    }

    #[test]
    fn fabricated_input_chains_dependencies() {
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
                market("X1-A-M1", vec![import_good("ELECTRONICS", 1_800, 40)]),
            ]),
        };

        let planned = plan(&markets, PlanningStrategy::Smart);

        // ore -> copper factory, copper -> electronics factory, collect
        assert_eq!(planned.tasks.len(), 3);
        assert_eq!(planned.factory_states.len(), 2);

        let ore_task = planned
            .tasks
            .iter()
            .find(|t| t.good == TradeGoodSymbol::new("COPPER_ORE"))
            .unwrap();
        assert!(ore_task.is_root());

        let copper_task = planned
            .tasks
            .iter()
            .find(|t| t.good == TradeGoodSymbol::new("COPPER"))
            .unwrap();
        assert_eq!(copper_task.source_market, Some(WaypointSymbol("X1-A-F2".to_string())));
        assert_eq!(copper_task.depends_on, HashSet::from([ore_task.id.clone()]));

        let collect = planned
            .tasks
            .iter()
            .find(|t| t.task_type == TaskType::CollectSell)
            .unwrap();
        assert_eq!(collect.depends_on, HashSet::from([copper_task.id.clone()]));
    }
}
