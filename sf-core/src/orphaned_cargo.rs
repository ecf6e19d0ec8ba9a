use crate::ports::{Clock, MarketData, ShipOperations};
use crate::task_queue::TaskQueue;
use anyhow::Result;
use sf_domain::{ManufacturingTask, PlayerId, ShipSymbol, SystemSymbol, TaskStatus, TaskType};
use sf_store::bmc::Bmc;
use sf_store::Ctx;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{event, Level};

/// Resumes interrupted trades: a ship sitting idle with cargo nobody
/// claims gets a pre-bound Liquidate task towards the best demand market
/// in its system.
pub struct OrphanedCargoHandler {
    bmc: Arc<dyn Bmc>,
    ship_ops: Arc<dyn ShipOperations>,
    market_data: Arc<dyn MarketData>,
    queue: Arc<TaskQueue>,
    clock: Arc<dyn Clock>,
    player_id: PlayerId,
}

impl OrphanedCargoHandler {
    pub fn new(
        bmc: Arc<dyn Bmc>,
        ship_ops: Arc<dyn ShipOperations>,
        market_data: Arc<dyn MarketData>,
        queue: Arc<TaskQueue>,
        clock: Arc<dyn Clock>,
        player_id: PlayerId,
    ) -> Self {
        Self {
            bmc,
            ship_ops,
            market_data,
            queue,
            clock,
            player_id,
        }
    }

    /// One sweep over idle ships. Returns the number of Liquidate tasks
    /// created.
    pub async fn rescue_orphaned_cargo(&self, ctx: &Ctx, system: &SystemSymbol) -> Result<usize> {
        let ships = self.ship_ops.list_ships().await?;
        let busy: HashSet<ShipSymbol> = self
            .bmc
            .ship_assignment_bmc()
            .load_active(ctx, &self.player_id)
            .await?
            .into_iter()
            .map(|a| a.ship_symbol)
            .collect();

        let open_tasks = self
            .bmc
            .task_bmc()
            .load_tasks_by_status(
                ctx,
                &self.player_id,
                &[TaskStatus::Pending, TaskStatus::Ready, TaskStatus::Assigned, TaskStatus::Executing],
            )
            .await?;

        let mut created = 0;
        for ship in ships.into_iter().filter(|s| !busy.contains(&s.symbol)) {
            for inventory in ship.cargo.inventory.iter().filter(|inv| inv.units > 0) {
                let claimed = open_tasks.iter().any(|task| {
                    task.assigned_ship.as_ref() == Some(&ship.symbol)
                        && task.good == inventory.symbol
                        && (task.status.is_active() || task.task_type == TaskType::Liquidate)
                });
                if claimed {
                    continue;
                }

                let Some(quote) = self.market_data.find_best_market_buying(&inventory.symbol, system).await? else {
                    event!(
                        Level::WARN,
                        "ship {} holds {} {} but no market in {} buys it",
                        ship.symbol,
                        inventory.units,
                        inventory.symbol,
                        system
                    );
                    continue;
                };

                let now = self.clock.now();
                let mut task = ManufacturingTask::standalone_liquidate(
                    self.player_id.clone(),
                    inventory.symbol.clone(),
                    quote.waypoint_symbol.clone(),
                    ship.symbol.clone(),
                    now,
                );
                task.mark_ready(now)?;

                self.bmc.task_bmc().insert_task(ctx, &task).await?;
                self.queue.enqueue_priority(task.clone());

                event!(
                    Level::INFO,
                    "ship {} holds orphaned {} {}; liquidating at {} ({}/unit)",
                    ship.symbol,
                    inventory.units,
                    inventory.symbol,
                    quote.waypoint_symbol,
                    quote.price
                );
                metrics::counter!("manufacturing_liquidations_created_total").increment(1);
                created += 1;
            }
        }

        Ok(created)
    }
}
