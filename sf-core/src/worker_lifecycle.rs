use crate::error::ExecutorError;
use crate::executor::{ExecutionContext, ExecutorRegistry, TaskExecutor, TaskOutcome};
use crate::ports::{Clock, MarketData, Router, ShipOperations};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mockall::automock;
use sf_domain::{
    ContainerId, ContainerStatus, LogLevel, ManufacturingTask, PlayerId, ReleaseReason, TaskCompletion, TaskId, TaskStatus,
};
use sf_store::bmc::Bmc;
use sf_store::{Ctx, StoreError};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

const CAS_ATTEMPTS: usize = 3;
const ASSIGNED_WAIT_ATTEMPTS: usize = 10;
const ASSIGNED_WAIT_DELAY: Duration = Duration::from_millis(50);

/// The one interface TaskAssignmentManager needs from the worker side.
#[automock]
#[async_trait]
pub trait WorkerStarter: Send + Sync {
    async fn start_worker(&self, container_id: &ContainerId, task: &ManufacturingTask) -> Result<()>;
}

/// Launches and reaps the per-task worker tasks and shuttles completion
/// signals back to the coordinator loop.
pub struct WorkerLifecycleManager {
    bmc: Arc<dyn Bmc>,
    ship_ops: Arc<dyn ShipOperations>,
    market_data: Arc<dyn MarketData>,
    router: Arc<dyn Router>,
    clock: Arc<dyn Clock>,
    registry: Arc<ExecutorRegistry>,
    completion_tx: mpsc::Sender<TaskCompletion>,
    cancellation: CancellationToken,
    player_id: PlayerId,
}

impl WorkerLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bmc: Arc<dyn Bmc>,
        ship_ops: Arc<dyn ShipOperations>,
        market_data: Arc<dyn MarketData>,
        router: Arc<dyn Router>,
        clock: Arc<dyn Clock>,
        completion_tx: mpsc::Sender<TaskCompletion>,
        cancellation: CancellationToken,
        player_id: PlayerId,
    ) -> Self {
        Self {
            bmc,
            ship_ops,
            market_data,
            router,
            clock,
            registry: Arc::new(ExecutorRegistry::standard()),
            completion_tx,
            cancellation,
            player_id,
        }
    }

    /// Releases the ship and closes the container for a completion the
    /// coordinator received. Returns false when the assignment was already
    /// gone (the safety net reaped it first) so the caller can skip the
    /// downstream bookkeeping.
    pub async fn handle_worker_completion(&self, ctx: &Ctx, completion: &TaskCompletion) -> Result<bool> {
        let Some(assignment) = self
            .bmc
            .ship_assignment_bmc()
            .get_active_for_ship(ctx, &self.player_id, &completion.ship_symbol)
            .await?
        else {
            return Ok(false);
        };

        // a late signal must not release a lease the ship got afterwards
        let container = self.bmc.container_bmc().get_container(ctx, &assignment.container_id).await?;
        let belongs_to_completion = container
            .as_ref()
            .and_then(|c| c.metadata.task_id.as_ref())
            .map(|task_id| task_id == &completion.task_id)
            .unwrap_or(false);
        if !belongs_to_completion {
            return Ok(false);
        }

        let now = self.clock.now();
        let (reason, container_status) = if completion.success {
            (ReleaseReason::WorkerCompleted, ContainerStatus::Completed)
        } else {
            (ReleaseReason::WorkerFailed, ContainerStatus::Failed)
        };

        self.bmc
            .ship_assignment_bmc()
            .release(ctx, &self.player_id, &completion.ship_symbol, reason, now)
            .await?;
        self.bmc
            .container_bmc()
            .set_container_status(ctx, &assignment.container_id, container_status, completion.error.clone(), now)
            .await?;

        Ok(true)
    }

    /// Retry-or-fail decision for an unsuccessful completion. Returns the
    /// status the task ended up in.
    pub async fn handle_task_failure(&self, ctx: &Ctx, completion: &TaskCompletion, max_retries: u32) -> Result<TaskStatus> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut task) = self.bmc.task_bmc().get_task(ctx, &completion.task_id).await? else {
                return Err(anyhow!("completion for unknown task {}", completion.task_id));
            };
            if task.status.is_terminal() {
                return Ok(task.status);
            }

            task.retry_count += 1;
            let target = if completion.retryable && task.retry_count < max_retries {
                task.error_message = completion.error.clone();
                task.reset_to_pending()?;
                TaskStatus::Pending
            } else {
                let reason = completion.error.clone().unwrap_or_else(|| "worker failed".to_string());
                task.fail(reason, self.clock.now())?;
                TaskStatus::Failed
            };

            match self.bmc.task_bmc().update_task(ctx, &task).await {
                Ok(_) => {
                    metrics::counter!("manufacturing_task_retries_total").increment(1);
                    return Ok(target);
                }
                Err(err) if is_version_conflict(&err) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(anyhow!("task {} kept moving while handling its failure", completion.task_id))
    }

    /// Safety net for lost completion signals: any active assignment whose
    /// task already reached a terminal status is released here, at most
    /// one completion tick after the worker persisted it.
    pub async fn reap_finished(&self, ctx: &Ctx) -> Result<Vec<TaskCompletion>> {
        let mut completions = vec![];
        for assignment in self.bmc.ship_assignment_bmc().load_active(ctx, &self.player_id).await? {
            let Some(container) = self.bmc.container_bmc().get_container(ctx, &assignment.container_id).await? else {
                continue;
            };
            let Some(task_id) = container.metadata.task_id.clone() else {
                continue;
            };
            let Some(task) = self.bmc.task_bmc().get_task(ctx, &task_id).await? else {
                continue;
            };

            let completion = match task.status {
                TaskStatus::Completed => TaskCompletion::success(task.id.clone(), task.pipeline_id.clone(), assignment.ship_symbol.clone()),
                TaskStatus::Failed | TaskStatus::Cancelled => TaskCompletion::failure(
                    task.id.clone(),
                    task.pipeline_id.clone(),
                    assignment.ship_symbol.clone(),
                    false,
                    task.error_message.clone().unwrap_or_else(|| "task failed".to_string()),
                ),
                _ => continue,
            };

            event!(Level::INFO, "reaping finished worker {} for task {}", assignment.container_id, task.id);
            self.handle_worker_completion(ctx, &completion).await?;
            completions.push(completion);
        }
        Ok(completions)
    }
}

#[async_trait]
impl WorkerStarter for WorkerLifecycleManager {
    async fn start_worker(&self, container_id: &ContainerId, task: &ManufacturingTask) -> Result<()> {
        let ctx = Ctx::for_player(self.player_id.clone());

        let assignment = self
            .bmc
            .ship_assignment_bmc()
            .get_active_for_container(&ctx, container_id)
            .await?
            .ok_or_else(|| anyhow!("no active assignment for container {}", container_id))?;

        let executor = self
            .registry
            .get(task.task_type)
            .ok_or_else(|| anyhow!("no executor registered for {}", task.task_type))?;

        self.bmc
            .container_bmc()
            .set_container_status(&ctx, container_id, ContainerStatus::Running, None, self.clock.now())
            .await?;

        let exec = ExecutionContext {
            player_id: self.player_id.clone(),
            ship_symbol: assignment.ship_symbol.clone(),
            container_id: container_id.clone(),
            ship_ops: Arc::clone(&self.ship_ops),
            market_data: Arc::clone(&self.market_data),
            router: Arc::clone(&self.router),
            ledger: self.bmc.ledger_bmc(),
            clock: Arc::clone(&self.clock),
        };

        metrics::gauge!("manufacturing_active_workers").increment(1.0);
        tokio::spawn(run_worker(
            Arc::clone(&self.bmc),
            exec,
            executor,
            task.id.clone(),
            self.completion_tx.clone(),
            self.cancellation.child_token(),
        ));

        Ok(())
    }
}

fn is_version_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::VersionConflict { .. }))
}

async fn container_log(bmc: &Arc<dyn Bmc>, ctx: &Ctx, exec: &ExecutionContext, level: LogLevel, message: String) {
    if let Err(err) = bmc
        .container_log_bmc()
        .append(ctx, &exec.container_id, level, message, exec.clock.now())
        .await
    {
        event!(Level::WARN, "failed to persist container log: {err:#}");
    }
}

/// The worker body: one task, one ship, one executor run. Never touches
/// coordinator state; everything flows back through the completion channel
/// or the repositories.
async fn run_worker(
    bmc: Arc<dyn Bmc>,
    exec: ExecutionContext,
    executor: Arc<dyn TaskExecutor>,
    task_id: TaskId,
    completion_tx: mpsc::Sender<TaskCompletion>,
    cancel: CancellationToken,
) {
    let ctx = Ctx::for_player(exec.player_id.clone());

    let task = match wait_and_mark_executing(&bmc, &ctx, &task_id, &exec).await {
        Ok(task) => task,
        Err(err) => {
            event!(Level::ERROR, "worker for task {task_id} could not start executing: {err:#}");
            metrics::gauge!("manufacturing_active_workers").decrement(1.0);
            return;
        }
    };

    container_log(
        &bmc,
        &ctx,
        &exec,
        LogLevel::Info,
        format!("executing {} task {} with ship {}", task.task_type, task.id, exec.ship_symbol),
    )
    .await;

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            handle_shutdown(&bmc, &ctx, &exec, &task_id).await;
            metrics::gauge!("manufacturing_active_workers").decrement(1.0);
            return;
        }
        result = executor.execute(&exec, &task) => result,
    };

    match result {
        Ok(outcome) => {
            if let Err(err) = persist_outcome(&bmc, &ctx, &task_id, &outcome, &exec).await {
                event!(Level::ERROR, "worker could not persist completion of {task_id}: {err:#}");
            } else {
                container_log(
                    &bmc,
                    &ctx,
                    &exec,
                    LogLevel::Info,
                    format!("task {} completed ({} units, net {})", task_id, outcome.actual_quantity, outcome.total_revenue - outcome.total_cost),
                )
                .await;
                let completion = TaskCompletion::success(task_id.clone(), task.pipeline_id.clone(), exec.ship_symbol.clone());
                if completion_tx.try_send(completion).is_err() {
                    // status is persisted; the 30s safety tick observes it
                    event!(Level::WARN, "completion channel full, task {task_id} relies on the safety net");
                }
            }
        }
        Err(err) => {
            container_log(&bmc, &ctx, &exec, LogLevel::Error, format!("task {} failed: {err}", task_id)).await;
            let completion = TaskCompletion::failure(
                task_id.clone(),
                task.pipeline_id.clone(),
                exec.ship_symbol.clone(),
                err.is_retryable(),
                err.to_string(),
            );
            if completion_tx.try_send(completion).is_err() {
                fallback_persist_failure(&bmc, &ctx, &task_id, &err, &exec).await;
            }
        }
    }
    metrics::gauge!("manufacturing_active_workers").decrement(1.0);
}

/// The coordinator persists `Ready -> Assigned` immediately after worker
/// start; absorb that ordering with a short wait before `Executing`.
async fn wait_and_mark_executing(bmc: &Arc<dyn Bmc>, ctx: &Ctx, task_id: &TaskId, exec: &ExecutionContext) -> Result<ManufacturingTask> {
    for _ in 0..ASSIGNED_WAIT_ATTEMPTS {
        let Some(mut task) = bmc.task_bmc().get_task(ctx, task_id).await? else {
            return Err(anyhow!("task {task_id} vanished before execution"));
        };
        match task.status {
            TaskStatus::Assigned => {
                task.start(exec.clock.now())?;
                match bmc.task_bmc().update_task(ctx, &task).await {
                    Ok(task) => return Ok(task),
                    Err(err) if is_version_conflict(&err) => continue,
                    Err(err) => return Err(err),
                }
            }
            TaskStatus::Ready => {
                tokio::time::sleep(ASSIGNED_WAIT_DELAY).await;
            }
            other => return Err(anyhow!("task {task_id} in unexpected status {other} at worker start")),
        }
    }
    Err(anyhow!("task {task_id} never reached Assigned"))
}

async fn persist_outcome(bmc: &Arc<dyn Bmc>, ctx: &Ctx, task_id: &TaskId, outcome: &TaskOutcome, exec: &ExecutionContext) -> Result<()> {
    for _ in 0..CAS_ATTEMPTS {
        let Some(mut task) = bmc.task_bmc().get_task(ctx, task_id).await? else {
            return Err(anyhow!("task {task_id} vanished before completion"));
        };
        task.actual_quantity = outcome.actual_quantity;
        task.total_cost += outcome.total_cost;
        task.total_revenue += outcome.total_revenue;
        task.complete(exec.clock.now())?;
        match bmc.task_bmc().update_task(ctx, &task).await {
            Ok(_) => return Ok(()),
            Err(err) if is_version_conflict(&err) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(anyhow!("task {task_id} kept moving while persisting its outcome"))
}

async fn fallback_persist_failure(bmc: &Arc<dyn Bmc>, ctx: &Ctx, task_id: &TaskId, err: &ExecutorError, exec: &ExecutionContext) {
    for _ in 0..CAS_ATTEMPTS {
        let Ok(Some(mut task)) = bmc.task_bmc().get_task(ctx, task_id).await else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        if task.fail(err.to_string(), exec.clock.now()).is_err() {
            return;
        }
        match bmc.task_bmc().update_task(ctx, &task).await {
            Ok(_) => return,
            Err(e) if is_version_conflict(&e) => continue,
            Err(e) => {
                event!(Level::ERROR, "fallback persistence for task {task_id} failed: {e:#}");
                return;
            }
        }
    }
}

async fn handle_shutdown(bmc: &Arc<dyn Bmc>, ctx: &Ctx, exec: &ExecutionContext, task_id: &TaskId) {
    event!(Level::INFO, "worker for task {task_id} observed shutdown");

    for _ in 0..CAS_ATTEMPTS {
        let Ok(Some(mut task)) = bmc.task_bmc().get_task(ctx, task_id).await else {
            break;
        };
        if task.status != TaskStatus::Executing {
            break;
        }
        if task.revert_to_assigned().is_err() {
            break;
        }
        match bmc.task_bmc().update_task(ctx, &task).await {
            Ok(_) => break,
            Err(err) if is_version_conflict(&err) => continue,
            Err(_) => break,
        }
    }

    let now = exec.clock.now();
    if let Err(err) = bmc
        .ship_assignment_bmc()
        .release(ctx, &exec.player_id, &exec.ship_symbol, ReleaseReason::CoordinatorShutdown, now)
        .await
    {
        event!(Level::WARN, "failed to release {} on shutdown: {err:#}", exec.ship_symbol);
    }
    if let Err(err) = bmc
        .container_bmc()
        .set_container_status(ctx, &exec.container_id, ContainerStatus::Cancelled, Some("coordinator_shutdown".to_string()), now)
        .await
    {
        event!(Level::WARN, "failed to cancel container {} on shutdown: {err:#}", exec.container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use crate::test_support::sim::{hauler, SimWorld};
    use chrono::Utc;
    use sf_domain::{ContainerMetadata, ContainerType, PipelineId, ShipAssignment, ShipSymbol, TradeGoodSymbol, WaypointSymbol, WorkerContainer};
    use sf_store::bmc::InMemoryBmc;

    fn make_manager(world: &SimWorld, bmc: &Arc<InMemoryBmc>) -> (WorkerLifecycleManager, mpsc::Receiver<TaskCompletion>) {
        let (tx, rx) = mpsc::channel(100);
        let manager = WorkerLifecycleManager::new(
            Arc::clone(bmc) as Arc<dyn Bmc>,
            Arc::new(world.clone()),
            Arc::new(world.clone()),
            Arc::new(world.clone()),
            Arc::new(SystemClock),
            tx,
            CancellationToken::new(),
            PlayerId("player-1".to_string()),
        );
        (manager, rx)
    }

    fn executing_task(ship: &str) -> ManufacturingTask {
        let now = Utc::now();
        let mut task = ManufacturingTask::new(
            PipelineId::generate(),
            PlayerId("player-1".to_string()),
            sf_domain::TaskType::AcquireDeliver,
            TradeGoodSymbol::new("COPPER"),
            60,
            Some(WaypointSymbol("X1-A-M2".to_string())),
            Some(WaypointSymbol("X1-A-F1".to_string())),
            None,
            now,
        );
        task.mark_ready(now).unwrap();
        task.assign(ShipSymbol(ship.to_string())).unwrap();
        task.start(now).unwrap();
        task
    }

    #[tokio::test]
    async fn retryable_failure_returns_task_to_pending() {
        let world = SimWorld::new();
        let bmc = Arc::new(InMemoryBmc::new());
        let (manager, _rx) = make_manager(&world, &bmc);
        let ctx = Ctx::Anonymous;

        let task = executing_task("SHIP-1");
        bmc.task_bmc().insert_task(&ctx, &task).await.unwrap();

        let completion = TaskCompletion::failure(task.id.clone(), task.pipeline_id.clone(), ShipSymbol("SHIP-1".to_string()), true, "supply dropped");
        let status = manager.handle_task_failure(&ctx, &completion, 3).await.unwrap();

        assert_eq!(status, TaskStatus::Pending);
        let stored = bmc.task_bmc().get_task(&ctx, &task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.assigned_ship, None);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_task() {
        let world = SimWorld::new();
        let bmc = Arc::new(InMemoryBmc::new());
        let (manager, _rx) = make_manager(&world, &bmc);
        let ctx = Ctx::Anonymous;

        let mut task = executing_task("SHIP-1");
        task.retry_count = 2;
        bmc.task_bmc().insert_task(&ctx, &task).await.unwrap();

        let completion = TaskCompletion::failure(task.id.clone(), task.pipeline_id.clone(), ShipSymbol("SHIP-1".to_string()), true, "supply dropped");
        let status = manager.handle_task_failure(&ctx, &completion, 3).await.unwrap();

        assert_eq!(status, TaskStatus::Failed);
        let stored = bmc.task_bmc().get_task(&ctx, &task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("supply dropped"));
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal_immediately() {
        let world = SimWorld::new();
        let bmc = Arc::new(InMemoryBmc::new());
        let (manager, _rx) = make_manager(&world, &bmc);
        let ctx = Ctx::Anonymous;

        let task = executing_task("SHIP-1");
        bmc.task_bmc().insert_task(&ctx, &task).await.unwrap();

        let completion = TaskCompletion::failure(task.id.clone(), task.pipeline_id.clone(), ShipSymbol("SHIP-1".to_string()), false, "no such waypoint");
        let status = manager.handle_task_failure(&ctx, &completion, 3).await.unwrap();
        assert_eq!(status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn reap_finished_releases_assignments_of_terminal_tasks() {
        let world = SimWorld::new();
        world.add_ship(hauler("SHIP-1", "X1-A-M2", 60));
        let bmc = Arc::new(InMemoryBmc::new());
        let (manager, _rx) = make_manager(&world, &bmc);
        let ctx = Ctx::Anonymous;
        let now = Utc::now();

        // worker persisted Completed but its channel message was lost
        let mut task = executing_task("SHIP-1");
        task.complete(now).unwrap();
        bmc.task_bmc().insert_task(&ctx, &task).await.unwrap();

        let container_id = ContainerId::generate(ContainerType::ManufacturingTaskWorker, Some(&task.assigned_ship.clone().unwrap()));
        let container = WorkerContainer::new(
            container_id.clone(),
            PlayerId("player-1".to_string()),
            None,
            ContainerType::ManufacturingTaskWorker,
            ContainerMetadata {
                task_id: Some(task.id.clone()),
                pipeline_id: task.pipeline_id.clone(),
                ship_symbol: task.assigned_ship.clone(),
                system_symbol: None,
            },
            now,
        );
        bmc.container_bmc().insert_container(&ctx, &container).await.unwrap();
        bmc.ship_assignment_bmc()
            .assign(
                &ctx,
                &ShipAssignment::new(ShipSymbol("SHIP-1".to_string()), PlayerId("player-1".to_string()), container_id.clone(), now),
            )
            .await
            .unwrap();

        let completions = manager.reap_finished(&ctx).await.unwrap();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].success);

        // assignment released, container closed
        assert!(bmc
            .ship_assignment_bmc()
            .get_active_for_ship(&ctx, &PlayerId("player-1".to_string()), &ShipSymbol("SHIP-1".to_string()))
            .await
            .unwrap()
            .is_none());
        let stored = bmc.container_bmc().get_container(&ctx, &container_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContainerStatus::Completed);

        // second pass finds nothing
        assert!(manager.reap_finished(&ctx).await.unwrap().is_empty());
    }
}
