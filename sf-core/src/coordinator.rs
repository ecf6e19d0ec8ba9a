use crate::config::CoordinatorConfig;
use crate::factory_state_manager::FactoryStateManager;
use crate::orphaned_cargo::OrphanedCargoHandler;
use crate::pipeline_lifecycle::PipelineLifecycleManager;
use crate::ports::{Clock, MarketData, Router, ShipOperations};
use crate::recovery::StateRecoveryManager;
use crate::state::CoordinatorState;
use crate::supply_monitor::SupplyMonitor;
use crate::task_assignment::TaskAssignmentManager;
use crate::task_queue::TaskQueue;
use crate::worker_lifecycle::{WorkerLifecycleManager, WorkerStarter};
use anyhow::Result;
use sf_domain::{ContainerId, TaskCompletion, TaskId, TaskStatus};
use sf_store::bmc::Bmc;
use sf_store::Ctx;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

const COMPLETION_CHANNEL_CAPACITY: usize = 100;
const TASK_READY_CHANNEL_CAPACITY: usize = 10;

/// The parallel manufacturing coordinator: one instance per container,
/// all parameters passed in, no global state. The main loop is a single
/// task selecting over tickers and channels; workers run beside it and
/// report back through the completion channel.
pub struct ManufacturingCoordinator {
    config: CoordinatorConfig,
    container_id: ContainerId,
    bmc: Arc<dyn Bmc>,
    queue: Arc<TaskQueue>,

    pipeline_manager: PipelineLifecycleManager,
    assignment_manager: TaskAssignmentManager,
    worker_manager: Arc<WorkerLifecycleManager>,
    factory_manager: FactoryStateManager,
    orphan_handler: OrphanedCargoHandler,
    recovery_manager: StateRecoveryManager,
    supply_monitor: Option<SupplyMonitor>,

    completion_rx: Option<mpsc::Receiver<TaskCompletion>>,
    task_ready_rx: Option<mpsc::Receiver<TaskId>>,
}

impl ManufacturingCoordinator {
    /// Wires every manager against the shared ports and repositories.
    /// The cancellation token is the root for every worker this
    /// coordinator spawns.
    pub fn new(
        config: CoordinatorConfig,
        container_id: ContainerId,
        bmc: Arc<dyn Bmc>,
        ship_ops: Arc<dyn ShipOperations>,
        market_data: Arc<dyn MarketData>,
        router: Arc<dyn Router>,
        clock: Arc<dyn Clock>,
        cancellation: CancellationToken,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new());
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);
        let (task_ready_tx, task_ready_rx) = mpsc::channel(TASK_READY_CHANNEL_CAPACITY);

        let pipeline_manager = PipelineLifecycleManager::new(
            Arc::clone(&bmc),
            Arc::clone(&queue),
            Arc::clone(&market_data),
            Arc::clone(&clock),
        );
        let assignment_manager = TaskAssignmentManager::new(
            Arc::clone(&bmc),
            Arc::clone(&queue),
            Arc::clone(&ship_ops),
            Arc::clone(&market_data),
            Arc::clone(&clock),
            config.player_id.clone(),
            config.min_cargo_capacity,
        );
        let worker_manager = Arc::new(WorkerLifecycleManager::new(
            Arc::clone(&bmc),
            Arc::clone(&ship_ops),
            Arc::clone(&market_data),
            Arc::clone(&router),
            Arc::clone(&clock),
            completion_tx,
            cancellation,
            config.player_id.clone(),
        ));
        let factory_manager = FactoryStateManager::new(Arc::clone(&bmc), Arc::clone(&queue), Arc::clone(&clock));
        let orphan_handler = OrphanedCargoHandler::new(
            Arc::clone(&bmc),
            Arc::clone(&ship_ops),
            Arc::clone(&market_data),
            Arc::clone(&queue),
            Arc::clone(&clock),
            config.player_id.clone(),
        );
        let recovery_manager = StateRecoveryManager::new(
            Arc::clone(&bmc),
            Arc::clone(&queue),
            Arc::clone(&clock),
            config.player_id.clone(),
        );
        let supply_monitor = SupplyMonitor::new(
            Arc::clone(&bmc),
            Arc::clone(&market_data),
            Arc::clone(&queue),
            Arc::clone(&clock),
            config.player_id.clone(),
            task_ready_tx,
        );

        Self {
            config,
            container_id,
            bmc,
            queue,
            pipeline_manager,
            assignment_manager,
            worker_manager,
            factory_manager,
            orphan_handler,
            recovery_manager,
            supply_monitor: Some(supply_monitor),
            completion_rx: Some(completion_rx),
            task_ready_rx: Some(task_ready_rx),
        }
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.queue)
    }

    /// Blocks until cancellation. Recovery first, then the steady-state
    /// loop.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let ctx = Ctx::for_player(self.config.player_id.clone());

        let mut state = self.recovery_manager.recover(&ctx).await?;
        self.pipeline_manager.check_all_pipelines_for_completion(&ctx, &mut state).await?;

        let monitor = self.supply_monitor.take().expect("run called twice");
        let monitor_handle = tokio::spawn(monitor.run(self.config.supply_poll_interval, cancel.child_token()));

        // the receivers live outside self so the select arms do not hold
        // a borrow across the handler bodies
        let mut completion_rx = self.completion_rx.take().expect("run called twice");
        let mut task_ready_rx = self.task_ready_rx.take().expect("run called twice");

        let mut scan_tick = tokio::time::interval(self.config.opportunity_scan_interval);
        let mut idle_tick = tokio::time::interval(self.config.idle_ship_interval);
        let mut stuck_tick = tokio::time::interval(self.config.stuck_pipeline_interval);
        let mut completion_tick = tokio::time::interval(self.config.pipeline_completion_interval);
        for tick in [&mut scan_tick, &mut idle_tick, &mut stuck_tick, &mut completion_tick] {
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        event!(
            Level::INFO,
            "coordinator {} running for {} in {} (strategy {}, {} pipelines, {} tasks)",
            self.container_id,
            self.config.player_id,
            self.config.system_symbol,
            self.config.strategy,
            self.config.max_pipelines,
            self.config.max_concurrent_tasks
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    event!(Level::INFO, "coordinator {} shutting down", self.container_id);
                    break;
                }
                _ = scan_tick.tick() => {
                    if let Err(err) = self.pipeline_manager.scan_and_create_pipelines(&ctx, &mut state, &self.config).await {
                        event!(Level::ERROR, "opportunity scan failed: {err:#}");
                    }
                }
                _ = idle_tick.tick() => {
                    if let Err(err) = self.idle_ship_pass(&ctx).await {
                        event!(Level::ERROR, "idle-ship pass failed: {err:#}");
                    }
                }
                _ = stuck_tick.tick() => {
                    match self.pipeline_manager.detect_and_recycle_stuck_pipelines(&ctx, &mut state, self.config.stuck_threshold).await {
                        Ok(0) => {}
                        Ok(recycled) => event!(Level::WARN, "recycled {} stuck pipelines", recycled),
                        Err(err) => event!(Level::ERROR, "stuck-pipeline scan failed: {err:#}"),
                    }
                }
                _ = completion_tick.tick() => {
                    if let Err(err) = self.safety_net_pass(&ctx, &mut state).await {
                        event!(Level::ERROR, "completion safety net failed: {err:#}");
                    }
                }
                Some(task_id) = task_ready_rx.recv() => {
                    event!(Level::DEBUG, "task {} became ready, running assignment pass", task_id);
                    if let Err(err) = self.assignment_pass(&ctx).await {
                        event!(Level::ERROR, "assignment pass failed: {err:#}");
                    }
                }
                Some(completion) = completion_rx.recv() => {
                    if let Err(err) = self.handle_completion(&ctx, &mut state, completion).await {
                        event!(Level::ERROR, "completion handling failed: {err:#}");
                    }
                }
            }
        }

        monitor_handle.abort();
        Ok(())
    }

    async fn assignment_pass(&self, ctx: &Ctx) -> Result<usize> {
        self.assignment_manager
            .assign_tasks(
                ctx,
                &self.container_id,
                self.config.max_concurrent_tasks,
                self.worker_manager.as_ref() as &dyn WorkerStarter,
            )
            .await
    }

    /// idleShip tick: rescue drifted collect tasks, sweep for orphaned
    /// cargo, then hand out work.
    async fn idle_ship_pass(&self, ctx: &Ctx) -> Result<()> {
        self.pipeline_manager
            .rescue_ready_collect_sell_tasks(ctx, &self.config.player_id)
            .await?;
        self.orphan_handler
            .rescue_orphaned_cargo(ctx, &self.config.system_symbol)
            .await?;
        self.assignment_pass(ctx).await?;

        metrics::gauge!("manufacturing_queue_fabrication").set(self.queue.fabrication_size() as f64);
        metrics::gauge!("manufacturing_queue_collection").set(self.queue.collection_size() as f64);
        Ok(())
    }

    /// 30s tick: reap workers whose completion message was lost, then
    /// recompute completion for every active pipeline.
    async fn safety_net_pass(&self, ctx: &Ctx, state: &mut CoordinatorState) -> Result<()> {
        for completion in self.worker_manager.reap_finished(ctx).await? {
            self.apply_completion_effects(ctx, state, &completion).await?;
        }
        self.pipeline_manager.check_all_pipelines_for_completion(ctx, state).await?;
        Ok(())
    }

    /// workerCompletion event: release the lease, apply task/pipeline/
    /// factory effects, then immediately look for new work.
    async fn handle_completion(&self, ctx: &Ctx, state: &mut CoordinatorState, completion: TaskCompletion) -> Result<()> {
        let was_active = self.worker_manager.handle_worker_completion(ctx, &completion).await?;
        if !was_active {
            // the safety net reaped this one already
            return Ok(());
        }

        self.apply_completion_effects(ctx, state, &completion).await?;
        self.assignment_pass(ctx).await?;
        Ok(())
    }

    async fn apply_completion_effects(&self, ctx: &Ctx, state: &mut CoordinatorState, completion: &TaskCompletion) -> Result<()> {
        if completion.success {
            metrics::counter!("manufacturing_tasks_completed_total").increment(1);
            let Some(task) = self.bmc.task_bmc().get_task(ctx, &completion.task_id).await? else {
                return Ok(());
            };

            self.factory_manager.update_factory_state_on_delivery(ctx, &task).await?;

            if let Some(pipeline_id) = &completion.pipeline_id {
                self.factory_manager.update_dependent_tasks(ctx, &completion.task_id, pipeline_id).await?;
                self.pipeline_manager.record_progress(ctx, state, pipeline_id).await?;
                self.pipeline_manager.check_pipeline_completion(ctx, state, pipeline_id).await?;
            }
        } else {
            metrics::counter!("manufacturing_tasks_failed_total").increment(1);
            let ended_in = self
                .worker_manager
                .handle_task_failure(ctx, completion, self.config.max_retries)
                .await?;

            if ended_in == TaskStatus::Pending {
                self.factory_manager.reevaluate_task(ctx, &completion.task_id).await?;
            }
            if let Some(pipeline_id) = &completion.pipeline_id {
                self.pipeline_manager.check_pipeline_completion(ctx, state, pipeline_id).await?;
            }
        }
        Ok(())
    }
}
