use crate::error::ExecutorError;
use crate::executor::{call_with_retries, navigate_and_dock, purchase_loop, record_ledger, ExecutionContext, TaskExecutor, TaskOutcome};
use async_trait::async_trait;
use sf_domain::{LedgerEntryType, ManufacturingTask, TaskType};
use tracing::{event, Level};

/// Atomic buy-then-deliver: purchase up to `task.quantity` units of
/// `task.good` at the source market, then sell everything held to the
/// factory (the factory pays per unit as an import).
pub struct AcquireDeliverExecutor;

#[async_trait]
impl TaskExecutor for AcquireDeliverExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::AcquireDeliver
    }

    async fn execute(&self, exec: &ExecutionContext, task: &ManufacturingTask) -> Result<TaskOutcome, ExecutorError> {
        let source_market = task
            .source_market
            .as_ref()
            .ok_or_else(|| ExecutorError::Precondition(format!("task {} has no source market", task.id)))?;
        let factory_symbol = task
            .factory_symbol
            .as_ref()
            .ok_or_else(|| ExecutorError::Precondition(format!("task {} has no factory", task.id)))?;

        let snapshot = call_with_retries(|| exec.ship_ops.load(&exec.ship_symbol))
            .await
            .map_err(|e| ExecutorError::Transient(format!("{e:#}")))?;

        // phase 1: acquire. A ship already holding the good resumes at
        // delivery.
        let mut total_cost = 0;
        if snapshot.cargo.units_of(&task.good) == 0 {
            navigate_and_dock(exec, source_market).await?;

            let target = (task.quantity > 0).then_some(task.quantity);
            let (units, cost) = purchase_loop(exec, task, source_market, &task.good, target).await?;
            total_cost = cost;

            if units == 0 {
                return Err(ExecutorError::MarketChanged(format!(
                    "acquired zero units of {} at {}",
                    task.good, source_market
                )));
            }
            event!(Level::INFO, "acquired {} {} at {} for {}", units, task.good, source_market, cost);
        }

        // phase 2: deliver everything held
        let snapshot = call_with_retries(|| exec.ship_ops.load(&exec.ship_symbol))
            .await
            .map_err(|e| ExecutorError::Transient(format!("{e:#}")))?;
        let to_deliver = snapshot.cargo.units_of(&task.good);
        if to_deliver == 0 {
            // resumed after a completed delivery
            return Ok(TaskOutcome::default());
        }

        navigate_and_dock(exec, factory_symbol).await?;

        let outcome = call_with_retries(|| exec.ship_ops.sell_cargo(&exec.ship_symbol, &task.good, to_deliver))
            .await
            .map_err(|e| ExecutorError::Transient(format!("{e:#}")))?;

        record_ledger(
            exec,
            task,
            LedgerEntryType::FactoryDelivery,
            outcome.total_revenue,
            format!("delivered {} {} to {}", outcome.units_sold, task.good, factory_symbol),
        )
        .await?;

        event!(
            Level::INFO,
            "delivered {} {} to factory {} (import payment {})",
            outcome.units_sold,
            task.good,
            factory_symbol,
            outcome.total_revenue
        );

        Ok(TaskOutcome {
            actual_quantity: outcome.units_sold,
            total_cost,
            total_revenue: outcome.total_revenue,
        })
    }
}
