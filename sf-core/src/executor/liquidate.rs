use crate::error::ExecutorError;
use crate::executor::{call_with_retries, navigate_and_dock, record_ledger, ExecutionContext, TaskExecutor, TaskOutcome};
use async_trait::async_trait;
use sf_domain::{LedgerEntryType, ManufacturingTask, TaskType};
use tracing::{event, Level};

/// Emergency sale of orphaned cargo. The cost side stays with whatever
/// task bought the goods; this one only books revenue.
pub struct LiquidateExecutor;

#[async_trait]
impl TaskExecutor for LiquidateExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Liquidate
    }

    async fn execute(&self, exec: &ExecutionContext, task: &ManufacturingTask) -> Result<TaskOutcome, ExecutorError> {
        let target_market = task
            .target_market
            .as_ref()
            .ok_or_else(|| ExecutorError::Precondition(format!("liquidate task {} has no target market", task.id)))?;

        let snapshot = call_with_retries(|| exec.ship_ops.load(&exec.ship_symbol))
            .await
            .map_err(|e| ExecutorError::Transient(format!("{e:#}")))?;

        let held = snapshot.cargo.units_of(&task.good);
        if held == 0 {
            // already liquidated on a previous run
            return Ok(TaskOutcome::default());
        }

        navigate_and_dock(exec, target_market).await?;

        let outcome = call_with_retries(|| exec.ship_ops.sell_cargo(&exec.ship_symbol, &task.good, held))
            .await
            .map_err(|e| ExecutorError::Transient(format!("{e:#}")))?;

        record_ledger(
            exec,
            task,
            LedgerEntryType::CargoSale,
            outcome.total_revenue,
            format!("liquidated {} {} at {}", outcome.units_sold, task.good, target_market),
        )
        .await?;

        event!(
            Level::INFO,
            "liquidated {} {} at {} for {}",
            outcome.units_sold,
            task.good,
            target_market,
            outcome.total_revenue
        );

        Ok(TaskOutcome {
            actual_quantity: outcome.units_sold,
            total_cost: 0,
            total_revenue: outcome.total_revenue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests_support::{electronics_world, exec_context};
    use crate::test_support::sim::hauler;
    use chrono::Utc;
    use sf_domain::{ManufacturingTask, PipelineId, PlayerId, TradeGoodSymbol, WaypointSymbol, LIQUIDATE_TASK_PRIORITY};

    fn liquidate_task(good: &str, target: &str) -> ManufacturingTask {
        let mut task = ManufacturingTask::new(
            PipelineId::generate(),
            PlayerId("player-1".to_string()),
            TaskType::Liquidate,
            TradeGoodSymbol::new(good),
            0,
            None,
            None,
            Some(WaypointSymbol(target.to_string())),
            Utc::now(),
        );
        task.priority = LIQUIDATE_TASK_PRIORITY;
        task
    }

    #[tokio::test]
    async fn sells_everything_held_at_target() {
        let (world, ledger) = electronics_world();
        let mut ship = hauler("SHIP-1", "X1-A-M2", 60);
        ship.cargo = ship.cargo.with_item_added(TradeGoodSymbol::new("COPPER"), 40).unwrap();
        world.add_ship(ship);

        let exec = exec_context(&world, &ledger);
        let task = liquidate_task("COPPER", "X1-A-F1");

        let outcome = LiquidateExecutor.execute(&exec, &task).await.unwrap();

        assert_eq!(outcome.actual_quantity, 40);
        assert_eq!(outcome.total_cost, 0);
        assert_eq!(outcome.total_revenue, 40 * 45);
        assert_eq!(world.ship(&exec.ship_symbol).cargo.units, 0);
    }

    #[tokio::test]
    async fn empty_hold_is_a_no_op() {
        let (world, ledger) = electronics_world();
        world.add_ship(hauler("SHIP-1", "X1-A-M2", 60));

        let exec = exec_context(&world, &ledger);
        let task = liquidate_task("COPPER", "X1-A-F1");

        let outcome = LiquidateExecutor.execute(&exec, &task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::default());
        assert!(world.sales().is_empty());
    }
}
