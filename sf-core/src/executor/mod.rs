use crate::error::ExecutorError;
use crate::ports::{Clock, MarketData, Router, ShipOperations};
use anyhow::Result;
use async_trait::async_trait;
use sf_domain::{
    supply_aware_limit, ContainerId, LedgerEntryType, LedgerTransaction, ManufacturingTask, OperationType, PlayerId, RelatedEntity, ShipSymbol,
    TradeGoodSymbol, WaypointSymbol,
};
use sf_store::bmc::ledger_bmc::LedgerBmcTrait;
use sf_store::Ctx;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

pub mod acquire_deliver;
pub mod collect_sell;
pub mod liquidate;

pub use acquire_deliver::AcquireDeliverExecutor;
pub use collect_sell::CollectSellExecutor;
pub use liquidate::LiquidateExecutor;

use sf_domain::TaskType;

const MAX_PURCHASE_ROUNDS: usize = 10;
const PORT_CALL_ATTEMPTS: usize = 3;
const PORT_CALL_BASE_DELAY: Duration = Duration::from_millis(250);

/// Everything a worker needs to run one task against the outside world.
#[derive(Clone)]
pub struct ExecutionContext {
    pub player_id: PlayerId,
    pub ship_symbol: ShipSymbol,
    pub container_id: ContainerId,
    pub ship_ops: Arc<dyn ShipOperations>,
    pub market_data: Arc<dyn MarketData>,
    pub router: Arc<dyn Router>,
    pub ledger: Arc<dyn LedgerBmcTrait>,
    pub clock: Arc<dyn Clock>,
}

impl ExecutionContext {
    fn ctx(&self) -> Ctx {
        Ctx::for_player(self.player_id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    pub actual_quantity: u32,
    pub total_cost: i64,
    pub total_revenue: i64,
}

/// Task-type strategy. Implementations are idempotent on resume: they
/// read ship location and cargo on entry and skip phases already done.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn task_type(&self) -> TaskType;
    async fn execute(&self, exec: &ExecutionContext, task: &ManufacturingTask) -> Result<TaskOutcome, ExecutorError>;
}

/// Strategy registry keyed by task type; built once at startup and closed
/// for modification afterwards.
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn standard() -> Self {
        let executors: Vec<Arc<dyn TaskExecutor>> = vec![
            Arc::new(AcquireDeliverExecutor),
            Arc::new(CollectSellExecutor),
            Arc::new(LiquidateExecutor),
        ];
        Self {
            executors: executors.into_iter().map(|e| (e.task_type(), e)).collect(),
        }
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type).cloned()
    }
}

/// Bounded exponential backoff around a single port call. Only transient
/// failures are worth the wait; the caller classifies whatever survives.
pub(crate) async fn call_with_retries<T, Fut>(mut attempt: impl FnMut() -> Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let mut delay = PORT_CALL_BASE_DELAY;
    let mut last_err = None;
    for round in 0..PORT_CALL_ATTEMPTS {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if round + 1 < PORT_CALL_ATTEMPTS {
                    event!(Level::DEBUG, "port call failed (attempt {}): {err:#}", round + 1);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_err = Some(err);
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}

fn transient(err: anyhow::Error) -> ExecutorError {
    ExecutorError::Transient(format!("{err:#}"))
}

/// Walks the planned route leg by leg and ends docked at the destination.
/// A ship already there only gets the dock call.
pub(crate) async fn navigate_and_dock(exec: &ExecutionContext, destination: &WaypointSymbol) -> Result<(), ExecutorError> {
    let snapshot = call_with_retries(|| exec.ship_ops.load(&exec.ship_symbol))
        .await
        .map_err(transient)?;

    if &snapshot.location != destination {
        let plan = call_with_retries(|| exec.router.plan_route(&exec.ship_symbol, destination))
            .await
            .map_err(transient)?;
        for leg in plan.legs {
            if leg.refuel_before {
                call_with_retries(|| exec.ship_ops.dock(&exec.ship_symbol))
                    .await
                    .map_err(transient)?;
                call_with_retries(|| exec.ship_ops.refuel(&exec.ship_symbol, leg.refuel_amount))
                    .await
                    .map_err(transient)?;
            }
            call_with_retries(|| exec.ship_ops.navigate(&exec.ship_symbol, &leg.to, leg.flight_mode))
                .await
                .map_err(transient)?;
        }
    }

    let snapshot = call_with_retries(|| exec.ship_ops.load(&exec.ship_symbol))
        .await
        .map_err(transient)?;
    if !snapshot.is_docked {
        call_with_retries(|| exec.ship_ops.dock(&exec.ship_symbol))
            .await
            .map_err(transient)?;
    }
    Ok(())
}

/// Supply-aware purchase loop shared by AcquireDeliver (source market) and
/// CollectSell (factory export). Exits when supply erodes below HIGH,
/// cargo is full, the target is met, or the round limit is hit.
pub(crate) async fn purchase_loop(
    exec: &ExecutionContext,
    task: &ManufacturingTask,
    market_symbol: &WaypointSymbol,
    good: &TradeGoodSymbol,
    target: Option<u32>,
) -> Result<(u32, i64), ExecutorError> {
    let mut total_units: u32 = 0;
    let mut total_cost: i64 = 0;

    for _round in 0..MAX_PURCHASE_ROUNDS {
        let market = call_with_retries(|| exec.market_data.get_market_data(market_symbol))
            .await
            .map_err(transient)?;
        let entry = market
            .trade_good(good)
            .ok_or_else(|| ExecutorError::Precondition(format!("{market_symbol} does not trade {good}")))?;

        if !entry.supply.is_collectable() {
            event!(Level::INFO, "supply of {good} at {market_symbol} eroded to {}, stopping purchases", entry.supply);
            break;
        }

        let snapshot = call_with_retries(|| exec.ship_ops.load(&exec.ship_symbol))
            .await
            .map_err(transient)?;
        let available_cargo = snapshot.cargo.available_space();
        if available_cargo == 0 {
            break;
        }

        let remaining = target.map(|t| t.saturating_sub(total_units)).unwrap_or(u32::MAX);
        let quantity_this_round = available_cargo
            .min(remaining)
            .min(supply_aware_limit(Some(entry.supply), entry.trade_volume));
        if quantity_this_round == 0 {
            break;
        }

        let outcome = call_with_retries(|| exec.ship_ops.purchase_cargo(&exec.ship_symbol, good, quantity_this_round))
            .await
            .map_err(transient)?;

        total_units += outcome.units_added;
        total_cost += outcome.total_cost;

        record_ledger(
            exec,
            task,
            LedgerEntryType::CargoPurchase,
            -outcome.total_cost,
            format!("bought {} {} at {} ({}/unit)", outcome.units_added, good, market_symbol, outcome.price_per_unit),
        )
        .await?;
    }

    Ok((total_units, total_cost))
}

pub(crate) async fn record_ledger(
    exec: &ExecutionContext,
    task: &ManufacturingTask,
    entry_type: LedgerEntryType,
    amount: i64,
    description: String,
) -> Result<(), ExecutorError> {
    let operation_type = match task.task_type {
        TaskType::Liquidate => OperationType::Liquidation,
        _ => OperationType::Manufacturing,
    };
    let transaction = LedgerTransaction {
        player_id: exec.player_id.clone(),
        entry_type,
        amount,
        description,
        related_entity: Some(RelatedEntity {
            entity_type: "task".to_string(),
            entity_id: task.id.0.clone(),
        }),
        operation_type,
        metadata: None,
        created_at: exec.clock.now(),
    };
    exec.ledger
        .record_transaction(&exec.ctx(), &transaction)
        .await
        .map_err(|e| ExecutorError::Other(e))?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = call_with_retries(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("flaky"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let result: Result<u32> = call_with_retries(|| async { Err(anyhow::anyhow!("down")) }).await;
        assert!(result.is_err());
    }
}
