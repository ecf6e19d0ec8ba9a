use crate::error::ExecutorError;
use crate::executor::{call_with_retries, navigate_and_dock, purchase_loop, record_ledger, ExecutionContext, TaskExecutor, TaskOutcome};
use async_trait::async_trait;
use sf_domain::{LedgerEntryType, ManufacturingTask, TaskType};
use tracing::{event, Level};

/// Atomic collect-then-sell: buy the produced output at the factory's
/// export side, sell it at the target market. Precondition: the bound
/// factory was observed ready for collection; the executor re-verifies on
/// arrival because supply keeps moving.
pub struct CollectSellExecutor;

#[async_trait]
impl TaskExecutor for CollectSellExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::CollectSell
    }

    async fn execute(&self, exec: &ExecutionContext, task: &ManufacturingTask) -> Result<TaskOutcome, ExecutorError> {
        let factory_symbol = task
            .factory_symbol
            .as_ref()
            .ok_or_else(|| ExecutorError::Precondition(format!("task {} has no factory", task.id)))?;
        let target_market = task
            .target_market
            .as_ref()
            .ok_or_else(|| ExecutorError::Precondition(format!("task {} has no target market", task.id)))?;

        let snapshot = call_with_retries(|| exec.ship_ops.load(&exec.ship_symbol))
            .await
            .map_err(|e| ExecutorError::Transient(format!("{e:#}")))?;

        // phase 1: collect. A ship already holding produce resumes at the
        // sale.
        let mut total_cost = 0;
        if snapshot.cargo.units_of(&task.good) == 0 {
            navigate_and_dock(exec, factory_symbol).await?;

            let market = call_with_retries(|| exec.market_data.get_market_data(factory_symbol))
                .await
                .map_err(|e| ExecutorError::Transient(format!("{e:#}")))?;
            let entry = market
                .trade_good(&task.good)
                .ok_or_else(|| ExecutorError::Precondition(format!("{factory_symbol} does not export {}", task.good)))?;
            if !entry.supply.is_collectable() {
                return Err(ExecutorError::MarketChanged(format!(
                    "factory {} supply dropped to {} before collection",
                    factory_symbol, entry.supply
                )));
            }

            let target = (task.quantity > 0).then_some(task.quantity);
            let (units, cost) = purchase_loop(exec, task, factory_symbol, &task.good, target).await?;
            total_cost = cost;

            if units == 0 {
                return Err(ExecutorError::MarketChanged(format!(
                    "collected zero units of {} at {}",
                    task.good, factory_symbol
                )));
            }
            event!(Level::INFO, "collected {} {} from factory {}", units, task.good, factory_symbol);
        }

        // phase 2: sell everything held
        let snapshot = call_with_retries(|| exec.ship_ops.load(&exec.ship_symbol))
            .await
            .map_err(|e| ExecutorError::Transient(format!("{e:#}")))?;
        let to_sell = snapshot.cargo.units_of(&task.good);
        if to_sell == 0 {
            return Ok(TaskOutcome::default());
        }

        navigate_and_dock(exec, target_market).await?;

        let outcome = call_with_retries(|| exec.ship_ops.sell_cargo(&exec.ship_symbol, &task.good, to_sell))
            .await
            .map_err(|e| ExecutorError::Transient(format!("{e:#}")))?;

        record_ledger(
            exec,
            task,
            LedgerEntryType::CargoSale,
            outcome.total_revenue,
            format!("sold {} {} at {}", outcome.units_sold, task.good, target_market),
        )
        .await?;

        event!(
            Level::INFO,
            "sold {} {} at {} for {} (phase-1 cost {})",
            outcome.units_sold,
            task.good,
            target_market,
            outcome.total_revenue,
            total_cost
        );

        Ok(TaskOutcome {
            actual_quantity: outcome.units_sold,
            total_cost,
            total_revenue: outcome.total_revenue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests_support::{electronics_world, exec_context, spec_task};
    use crate::test_support::sim::hauler;
    use sf_domain::{SupplyLevel, TradeGoodSymbol, WaypointSymbol};

    #[tokio::test]
    async fn collects_from_ready_factory_and_sells_at_target() {
        let (world, ledger) = electronics_world();
        world.add_ship(hauler("SHIP-1", "X1-A-F1", 60));
        world.set_supply(
            &WaypointSymbol("X1-A-F1".to_string()),
            &TradeGoodSymbol::new("ELECTRONICS"),
            SupplyLevel::High,
        );

        let exec = exec_context(&world, &ledger);
        let task = spec_task(TaskType::CollectSell, "ELECTRONICS", 0);

        let outcome = CollectSellExecutor.execute(&exec, &task).await.unwrap();

        // volume 40 at HIGH caps rounds at 24; cargo 60 fits 24+24+12
        assert_eq!(outcome.actual_quantity, 60);
        assert_eq!(outcome.total_cost, 60 * 1_500);
        assert_eq!(outcome.total_revenue, 60 * 1_800);

        let ship = world.ship(&exec.ship_symbol);
        assert_eq!(ship.location, WaypointSymbol("X1-A-M1".to_string()));
        assert_eq!(ship.cargo.units, 0);
    }

    #[tokio::test]
    async fn factory_not_ready_fails_retryable() {
        let (world, ledger) = electronics_world();
        world.add_ship(hauler("SHIP-1", "X1-A-M3", 60));
        // factory export stays Scarce

        let exec = exec_context(&world, &ledger);
        let task = spec_task(TaskType::CollectSell, "ELECTRONICS", 0);

        let result = CollectSellExecutor.execute(&exec, &task).await;
        match result {
            Err(err @ ExecutorError::MarketChanged(_)) => assert!(err.is_retryable()),
            other => panic!("expected MarketChanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_with_produce_skips_collection() {
        let (world, ledger) = electronics_world();
        let mut ship = hauler("SHIP-1", "X1-A-F1", 60);
        ship.cargo = ship.cargo.with_item_added(TradeGoodSymbol::new("ELECTRONICS"), 30).unwrap();
        world.add_ship(ship);

        let exec = exec_context(&world, &ledger);
        let task = spec_task(TaskType::CollectSell, "ELECTRONICS", 0);

        let outcome = CollectSellExecutor.execute(&exec, &task).await.unwrap();

        assert_eq!(outcome.actual_quantity, 30);
        assert_eq!(outcome.total_cost, 0);
        assert!(world.purchases().is_empty());
        assert_eq!(outcome.total_revenue, 30 * 1_800);
    }
}
