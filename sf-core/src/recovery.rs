use crate::ports::Clock;
use crate::state::CoordinatorState;
use crate::task_queue::TaskQueue;
use anyhow::Result;
use itertools::Itertools;
use sf_domain::{ContainerStatus, ManufacturingTask, PipelineStatus, PlayerId, ReleaseReason, TaskId, TaskStatus, TaskType};
use sf_store::bmc::Bmc;
use sf_store::{Ctx, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

const CAS_ATTEMPTS: usize = 3;

/// Boot-time rehydration: rebuilds the coordinator's in-memory view from
/// the repositories and repairs whatever the previous process left behind.
/// Running it twice is the same as running it once.
pub struct StateRecoveryManager {
    bmc: Arc<dyn Bmc>,
    queue: Arc<TaskQueue>,
    clock: Arc<dyn Clock>,
    player_id: PlayerId,
}

impl StateRecoveryManager {
    pub fn new(bmc: Arc<dyn Bmc>, queue: Arc<TaskQueue>, clock: Arc<dyn Clock>, player_id: PlayerId) -> Self {
        Self {
            bmc,
            queue,
            clock,
            player_id,
        }
    }

    pub async fn recover(&self, ctx: &Ctx) -> Result<CoordinatorState> {
        let mut state = CoordinatorState::new();

        // 1. active pipelines back into the working set
        let pipelines = self
            .bmc
            .pipeline_bmc()
            .load_pipelines_by_status(ctx, &self.player_id, &[PipelineStatus::Planning, PipelineStatus::Executing])
            .await?;
        for pipeline in pipelines {
            state
                .last_pipeline_created
                .entry(pipeline.product_good.clone())
                .and_modify(|at| *at = (*at).max(pipeline.created_at))
                .or_insert(pipeline.created_at);
            state.active_pipelines.insert(pipeline.id.clone(), pipeline);
        }
        event!(Level::INFO, "recovered {} active pipelines", state.active_pipelines.len());

        // 2. tasks that were running when the process died: their workers
        // are gone, so release the leases and put the work back
        let in_flight = self
            .bmc
            .task_bmc()
            .load_tasks_by_status(ctx, &self.player_id, &[TaskStatus::Assigned, TaskStatus::Executing])
            .await?;
        for task in in_flight {
            self.reset_dead_worker_task(ctx, &task.id).await?;
        }

        // 3. re-evaluate Pending tasks and rebuild the queue cache
        let queue_worthy = self.promote_and_collect_queueable(ctx, &state).await?;
        self.queue.load_from_repository(queue_worthy);
        event!(
            Level::INFO,
            "queue rebuilt with {} entries ({} ready)",
            self.queue.size(),
            self.queue.get_ready_tasks().len()
        );

        Ok(state)
    }

    async fn reset_dead_worker_task(&self, ctx: &Ctx, task_id: &TaskId) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut task) = self.bmc.task_bmc().get_task(ctx, task_id).await? else {
                return Ok(());
            };
            if !task.status.is_active() {
                return Ok(());
            }

            if let Some(ship) = task.assigned_ship.clone() {
                if let Some(assignment) = self.bmc.ship_assignment_bmc().get_active_for_ship(ctx, &self.player_id, &ship).await? {
                    let now = self.clock.now();
                    self.bmc
                        .ship_assignment_bmc()
                        .release(ctx, &self.player_id, &ship, ReleaseReason::RecoveryReset, now)
                        .await?;
                    self.bmc
                        .container_bmc()
                        .set_container_status(ctx, &assignment.container_id, ContainerStatus::Failed, Some("worker died".to_string()), now)
                        .await?;
                }
            }

            task.reset_to_pending()?;
            match self.bmc.task_bmc().update_task(ctx, &task).await {
                Ok(_) => {
                    event!(Level::INFO, "reset task {} to Pending (its worker died)", task_id);
                    return Ok(());
                }
                Err(err) if is_version_conflict(&err) => continue,
                Err(err) => return Err(err),
            }
        }
        anyhow::bail!("task {} kept moving during recovery", task_id)
    }

    /// Promotes Pending tasks whose dependencies completed during (or
    /// before) the downtime, then returns everything the queue cache
    /// should hold: Ready tasks plus dependency-complete Pending
    /// CollectSell tasks (staged awaiting supply).
    async fn promote_and_collect_queueable(&self, ctx: &Ctx, state: &CoordinatorState) -> Result<Vec<ManufacturingTask>> {
        let mut queueable = vec![];

        for pipeline_id in state.active_pipelines.keys() {
            let tasks = self.bmc.task_bmc().load_tasks_for_pipeline(ctx, pipeline_id).await?;
            let statuses: HashMap<TaskId, TaskStatus> = tasks.iter().map(|t| (t.id.clone(), t.status)).collect();

            for task in tasks {
                match task.status {
                    TaskStatus::Ready => queueable.push(task),
                    TaskStatus::Pending => {
                        let deps_completed = task
                            .depends_on
                            .iter()
                            .all(|dep| statuses.get(dep).map(|s| *s == TaskStatus::Completed).unwrap_or(false));
                        if !deps_completed {
                            continue;
                        }

                        if task.task_type == TaskType::CollectSell {
                            let factory_ready = match (&task.pipeline_id, &task.factory_symbol) {
                                (Some(pipeline_id), Some(factory)) => self
                                    .bmc
                                    .factory_state_bmc()
                                    .get_factory_state(ctx, pipeline_id, factory, &task.good)
                                    .await?
                                    .map(|s| s.ready_for_collection)
                                    .unwrap_or(false),
                                _ => false,
                            };
                            if factory_ready {
                                if let Some(ready) = self.persist_promotion(ctx, &task.id).await? {
                                    queueable.push(ready);
                                }
                            } else {
                                // staged: supply observation promotes it
                                queueable.push(task);
                            }
                        } else if let Some(ready) = self.persist_promotion(ctx, &task.id).await? {
                            queueable.push(ready);
                        }
                    }
                    _ => {}
                }
            }
        }

        // standalone liquidations have no pipeline; Ready ones re-enter
        // the queue directly
        let standalone = self
            .bmc
            .task_bmc()
            .load_tasks_by_status(ctx, &self.player_id, &[TaskStatus::Ready])
            .await?
            .into_iter()
            .filter(|t| t.pipeline_id.is_none())
            .collect_vec();
        queueable.extend(standalone);

        Ok(queueable)
    }

    async fn persist_promotion(&self, ctx: &Ctx, task_id: &TaskId) -> Result<Option<ManufacturingTask>> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut task) = self.bmc.task_bmc().get_task(ctx, task_id).await? else {
                return Ok(None);
            };
            if task.status != TaskStatus::Pending {
                return Ok(Some(task));
            }
            task.mark_ready(self.clock.now())?;
            match self.bmc.task_bmc().update_task(ctx, &task).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(err) if is_version_conflict(&err) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

fn is_version_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::VersionConflict { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use chrono::Utc;
    use sf_domain::{
        ContainerId, ContainerMetadata, ContainerType, FactoryState, ManufacturingPipeline, ShipAssignment, ShipSymbol, SupplyLevel, SystemSymbol,
        TradeGoodSymbol, WaypointSymbol, WorkerContainer,
    };
    use sf_store::bmc::InMemoryBmc;

    struct Fixture {
        manager: StateRecoveryManager,
        bmc: Arc<InMemoryBmc>,
        queue: Arc<TaskQueue>,
        pipeline: ManufacturingPipeline,
        acquire: ManufacturingTask,
        collect: ManufacturingTask,
    }

    async fn seeded_world(factory_supply: SupplyLevel, acquire_status: TaskStatus) -> Fixture {
        let bmc = Arc::new(InMemoryBmc::new());
        let queue = Arc::new(TaskQueue::new());
        let player = PlayerId("player-1".to_string());
        let ctx = Ctx::Anonymous;
        let now = Utc::now();

        let mut pipeline = ManufacturingPipeline::new(
            player.clone(),
            SystemSymbol("X1-A".to_string()),
            TradeGoodSymbol::new("ELECTRONICS"),
            WaypointSymbol("X1-A-M1".to_string()),
            now,
        );
        pipeline.start_executing().unwrap();

        let mut acquire = ManufacturingTask::new(
            pipeline.id.clone(),
            player.clone(),
            TaskType::AcquireDeliver,
            TradeGoodSymbol::new("COPPER"),
            100,
            Some(WaypointSymbol("X1-A-M2".to_string())),
            Some(WaypointSymbol("X1-A-F1".to_string())),
            None,
            now,
        );
        let mut collect = ManufacturingTask::new(
            pipeline.id.clone(),
            player.clone(),
            TaskType::CollectSell,
            TradeGoodSymbol::new("ELECTRONICS"),
            0,
            None,
            Some(WaypointSymbol("X1-A-F1".to_string())),
            Some(WaypointSymbol("X1-A-M1".to_string())),
            now,
        );
        collect.depends_on.insert(acquire.id.clone());

        match acquire_status {
            TaskStatus::Pending => {}
            TaskStatus::Ready => acquire.mark_ready(now).unwrap(),
            TaskStatus::Executing => {
                acquire.mark_ready(now).unwrap();
                acquire.assign(ShipSymbol("SHIP-1".to_string())).unwrap();
                acquire.start(now).unwrap();
            }
            TaskStatus::Completed => {
                acquire.mark_ready(now).unwrap();
                acquire.assign(ShipSymbol("SHIP-1".to_string())).unwrap();
                acquire.start(now).unwrap();
                acquire.complete(now).unwrap();
            }
            other => panic!("unsupported seed status {other}"),
        }

        let mut factory = FactoryState::new(
            pipeline.id.clone(),
            WaypointSymbol("X1-A-F1".to_string()),
            TradeGoodSymbol::new("ELECTRONICS"),
            std::collections::HashMap::from([(TradeGoodSymbol::new("COPPER"), 100)]),
        );
        factory.observe_supply(factory_supply, now);

        bmc.pipeline_bmc()
            .save_pipeline_with_tasks(&ctx, &pipeline, &[acquire.clone(), collect.clone()], std::slice::from_ref(&factory))
            .await
            .unwrap();

        let manager = StateRecoveryManager::new(
            Arc::clone(&bmc) as Arc<dyn Bmc>,
            Arc::clone(&queue),
            Arc::new(SystemClock),
            player,
        );

        Fixture {
            manager,
            bmc,
            queue,
            pipeline,
            acquire,
            collect,
        }
    }

    #[tokio::test]
    async fn dead_worker_task_is_reset_and_its_lease_released() {
        let fx = seeded_world(SupplyLevel::Moderate, TaskStatus::Executing).await;
        let ctx = Ctx::Anonymous;
        let now = Utc::now();

        // the previous process left an assignment and a running container
        let container_id = ContainerId::generate(ContainerType::ManufacturingTaskWorker, Some(&ShipSymbol("SHIP-1".to_string())));
        let mut container = WorkerContainer::new(
            container_id.clone(),
            PlayerId("player-1".to_string()),
            None,
            ContainerType::ManufacturingTaskWorker,
            ContainerMetadata {
                task_id: Some(fx.acquire.id.clone()),
                pipeline_id: fx.acquire.pipeline_id.clone(),
                ship_symbol: Some(ShipSymbol("SHIP-1".to_string())),
                system_symbol: None,
            },
            now,
        );
        container.status = ContainerStatus::Running;
        fx.bmc.container_bmc().insert_container(&ctx, &container).await.unwrap();
        fx.bmc
            .ship_assignment_bmc()
            .assign(
                &ctx,
                &ShipAssignment::new(ShipSymbol("SHIP-1".to_string()), PlayerId("player-1".to_string()), container_id.clone(), now),
            )
            .await
            .unwrap();

        let state = fx.manager.recover(&ctx).await.unwrap();
        assert_eq!(state.active_pipelines.len(), 1);

        assert!(fx
            .bmc
            .ship_assignment_bmc()
            .get_active_for_ship(&ctx, &PlayerId("player-1".to_string()), &ShipSymbol("SHIP-1".to_string()))
            .await
            .unwrap()
            .is_none());

        let stored_container = fx.bmc.container_bmc().get_container(&ctx, &container_id).await.unwrap().unwrap();
        assert_eq!(stored_container.status, ContainerStatus::Failed);

        // reset to Pending, then re-promoted to Ready (no dependencies)
        let stored = fx.bmc.task_bmc().get_task(&ctx, &fx.acquire.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Ready);
        assert_eq!(stored.assigned_ship, None);
        let requeued = fx.queue.get_ready_tasks();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].id, fx.acquire.id);
    }

    #[tokio::test]
    async fn pending_root_tasks_promote_and_ready_tasks_enqueue() {
        let fx = seeded_world(SupplyLevel::Moderate, TaskStatus::Pending).await;
        let ctx = Ctx::Anonymous;

        fx.manager.recover(&ctx).await.unwrap();

        let ready = fx.queue.get_ready_tasks();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, fx.acquire.id);
        let stored = fx.bmc.task_bmc().get_task(&ctx, &fx.acquire.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Ready);

        // collect's dependency is open: neither ready nor staged
        assert_eq!(fx.queue.collection_size(), 0);
    }

    #[tokio::test]
    async fn dependency_complete_collect_is_staged_or_promoted_by_supply() {
        // factory not ready: staged
        let fx = seeded_world(SupplyLevel::Moderate, TaskStatus::Completed).await;
        let ctx = Ctx::Anonymous;
        fx.manager.recover(&ctx).await.unwrap();
        assert_eq!(fx.queue.collection_size(), 1);
        assert!(fx.queue.get_ready_tasks().is_empty());
        let stored = fx.bmc.task_bmc().get_task(&ctx, &fx.collect.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);

        // factory ready: promoted
        let fx = seeded_world(SupplyLevel::High, TaskStatus::Completed).await;
        fx.manager.recover(&ctx).await.unwrap();
        let ready = fx.queue.get_ready_tasks();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, fx.collect.id);
        let stored = fx.bmc.task_bmc().get_task(&ctx, &fx.collect.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn recover_twice_equals_recover_once() {
        let fx = seeded_world(SupplyLevel::High, TaskStatus::Completed).await;
        let ctx = Ctx::Anonymous;

        let first = fx.manager.recover(&ctx).await.unwrap();
        let ready_after_first = fx.queue.get_ready_tasks();

        let second = fx.manager.recover(&ctx).await.unwrap();
        let ready_after_second = fx.queue.get_ready_tasks();

        assert_eq!(first.active_pipelines.keys().collect_vec(), second.active_pipelines.keys().collect_vec());
        assert_eq!(
            ready_after_first.iter().map(|t| t.id.clone()).collect_vec(),
            ready_after_second.iter().map(|t| t.id.clone()).collect_vec()
        );
        assert!(first.active_pipelines.contains_key(&fx.pipeline.id));
    }
}
