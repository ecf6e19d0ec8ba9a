use crate::ports::{Clock, MarketData, ShipOperations};
use crate::task_queue::TaskQueue;
use crate::worker_lifecycle::WorkerStarter;
use anyhow::{anyhow, Result};
use itertools::Itertools;
use sf_domain::{
    distance_between, ContainerId, ContainerMetadata, ContainerStatus, ContainerType, ManufacturingTask, PlayerId, ReleaseReason, ShipAssignment,
    ShipSnapshot, ShipSymbol, TaskStatus, TaskType, WorkerContainer,
};
use sf_store::bmc::Bmc;
use sf_store::{Ctx, StoreError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{event, Level};

const CAS_ATTEMPTS: usize = 3;

/// Pairs ready tasks with idle ships and runs the reservation protocol:
/// container row, assignment row, worker start, task transition -- in that
/// order, all-or-nothing per pair.
pub struct TaskAssignmentManager {
    bmc: Arc<dyn Bmc>,
    queue: Arc<TaskQueue>,
    ship_ops: Arc<dyn ShipOperations>,
    market_data: Arc<dyn MarketData>,
    clock: Arc<dyn Clock>,
    player_id: PlayerId,
    min_cargo_capacity: u32,
}

impl TaskAssignmentManager {
    pub fn new(
        bmc: Arc<dyn Bmc>,
        queue: Arc<TaskQueue>,
        ship_ops: Arc<dyn ShipOperations>,
        market_data: Arc<dyn MarketData>,
        clock: Arc<dyn Clock>,
        player_id: PlayerId,
        min_cargo_capacity: u32,
    ) -> Self {
        Self {
            bmc,
            queue,
            ship_ops,
            market_data,
            clock,
            player_id,
            min_cargo_capacity,
        }
    }

    /// One assignment pass. Returns how many workers were started.
    pub async fn assign_tasks(&self, ctx: &Ctx, parent_container: &ContainerId, max_concurrent_tasks: usize, starter: &dyn WorkerStarter) -> Result<usize> {
        let active = self
            .bmc
            .task_bmc()
            .count_tasks_by_status(ctx, &self.player_id, &[TaskStatus::Assigned, TaskStatus::Executing])
            .await?;
        if active >= max_concurrent_tasks {
            return Ok(0);
        }
        let mut slots = max_concurrent_tasks - active;

        let ready_tasks = self.queue.get_ready_tasks();
        if ready_tasks.is_empty() {
            return Ok(0);
        }

        let mut idle_ships = self.idle_ships(ctx).await?;
        let mut started = 0;

        for task in ready_tasks {
            if slots == 0 || idle_ships.is_empty() {
                break;
            }

            let Some(ship) = self.select_ship(&task, &idle_ships).await? else {
                // no suitable ship this pass; the task stays queued
                continue;
            };

            match self.reserve(ctx, &task, &ship, parent_container, starter).await {
                Ok(()) => {
                    self.queue.remove(&task.id);
                    idle_ships.retain(|s| s.symbol != ship.symbol);
                    slots -= 1;
                    started += 1;
                }
                Err(err) => {
                    event!(Level::WARN, "could not reserve ship {} for task {}: {err:#}", ship.symbol, task.id);
                }
            }
        }

        Ok(started)
    }

    async fn idle_ships(&self, ctx: &Ctx) -> Result<Vec<ShipSnapshot>> {
        let ships = self.ship_ops.list_ships().await?;
        let busy: HashSet<ShipSymbol> = self
            .bmc
            .ship_assignment_bmc()
            .load_active(ctx, &self.player_id)
            .await?
            .into_iter()
            .map(|a| a.ship_symbol)
            .collect();

        Ok(ships
            .into_iter()
            .filter(|ship| ship.is_hauler && ship.cargo.capacity >= self.min_cargo_capacity && !busy.contains(&ship.symbol))
            .collect_vec())
    }

    /// Ship selection rules, in order: a pre-bound ship (Liquidate, or a
    /// CollectSell resuming with cargo aboard) must itself be idle or the
    /// task waits; otherwise the nearest idle ship to where the work
    /// starts wins, ties broken by ship symbol.
    async fn select_ship(&self, task: &ManufacturingTask, idle_ships: &[ShipSnapshot]) -> Result<Option<ShipSnapshot>> {
        if let Some(bound) = &task.assigned_ship {
            return Ok(idle_ships.iter().find(|ship| &ship.symbol == bound).cloned());
        }

        let work_start = match task.task_type {
            TaskType::AcquireDeliver => task.source_market.clone(),
            TaskType::CollectSell => task.factory_symbol.clone(),
            TaskType::Liquidate => task.target_market.clone(),
        };
        let Some(work_start) = work_start else {
            return Err(anyhow!("task {} has no starting waypoint", task.id));
        };

        let target = self.market_data.waypoint_coordinate(&work_start).await?;

        let mut best: Option<(u32, &ShipSnapshot)> = None;
        for ship in idle_ships {
            let at = self.market_data.waypoint_coordinate(&ship.location).await?;
            let distance = distance_between(&at, &target);
            best = match best {
                None => Some((distance, ship)),
                Some((best_distance, best_ship)) => {
                    if distance < best_distance || (distance == best_distance && ship.symbol < best_ship.symbol) {
                        Some((distance, ship))
                    } else {
                        Some((best_distance, best_ship))
                    }
                }
            };
        }
        Ok(best.map(|(_, ship)| ship.clone()))
    }

    /// Steps are strictly ordered so a crash between any two of them is
    /// recoverable: the container row alone is garbage-collected, the
    /// assignment row alone is released by recovery, and the worker only
    /// starts once the assignment is committed.
    async fn reserve(&self, ctx: &Ctx, task: &ManufacturingTask, ship: &ShipSnapshot, parent_container: &ContainerId, starter: &dyn WorkerStarter) -> Result<()> {
        let now = self.clock.now();
        let container_id = ContainerId::generate(ContainerType::ManufacturingTaskWorker, Some(&ship.symbol));
        let container = WorkerContainer::new(
            container_id.clone(),
            self.player_id.clone(),
            Some(parent_container.clone()),
            ContainerType::ManufacturingTaskWorker,
            ContainerMetadata {
                task_id: Some(task.id.clone()),
                pipeline_id: task.pipeline_id.clone(),
                ship_symbol: Some(ship.symbol.clone()),
                system_symbol: Some(ship.location.system_symbol().0),
            },
            now,
        );
        self.bmc.container_bmc().insert_container(ctx, &container).await?;

        let assignment = ShipAssignment::new(ship.symbol.clone(), self.player_id.clone(), container_id.clone(), now);
        if let Err(err) = self.bmc.ship_assignment_bmc().assign(ctx, &assignment).await {
            // lost the race for this ship; undo the container row
            self.bmc.container_bmc().delete_container(ctx, &container_id).await?;
            if matches!(err.downcast_ref::<StoreError>(), Some(StoreError::ActiveAssignmentExists { .. })) {
                return Err(anyhow!("ship {} was taken concurrently", ship.symbol));
            }
            return Err(err);
        }

        if let Err(err) = starter.start_worker(&container_id, task).await {
            self.bmc
                .ship_assignment_bmc()
                .release(ctx, &self.player_id, &ship.symbol, ReleaseReason::WorkerStartFailed, self.clock.now())
                .await?;
            self.bmc
                .container_bmc()
                .set_container_status(ctx, &container_id, ContainerStatus::Failed, Some("worker_start_failed".to_string()), self.clock.now())
                .await?;
            return Err(err);
        }

        if let Err(err) = self.persist_assignment_transition(ctx, task, &ship.symbol).await {
            // the task slipped away (demoted or cancelled concurrently);
            // release the lease so the waiting worker aborts cleanly
            self.bmc
                .ship_assignment_bmc()
                .release(ctx, &self.player_id, &ship.symbol, ReleaseReason::WorkerStartFailed, self.clock.now())
                .await?;
            self.bmc
                .container_bmc()
                .set_container_status(ctx, &container_id, ContainerStatus::Failed, Some("assignment_lost".to_string()), self.clock.now())
                .await?;
            return Err(err);
        }
        event!(Level::INFO, "assigned task {} to ship {} (container {})", task.id, ship.symbol, container_id);
        metrics::counter!("manufacturing_tasks_assigned_total").increment(1);
        Ok(())
    }

    async fn persist_assignment_transition(&self, ctx: &Ctx, task: &ManufacturingTask, ship: &ShipSymbol) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut fresh) = self.bmc.task_bmc().get_task(ctx, &task.id).await? else {
                return Err(anyhow!("task {} vanished during assignment", task.id));
            };
            fresh.assign(ship.clone())?;
            match self.bmc.task_bmc().update_task(ctx, &fresh).await {
                Ok(_) => return Ok(()),
                Err(err) if matches!(err.downcast_ref::<StoreError>(), Some(StoreError::VersionConflict { .. })) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(anyhow!("task {} kept moving during assignment", task.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use crate::test_support::markets::{export_good, import_good, market};
    use crate::test_support::sim::{hauler, SimWorld};
    use crate::worker_lifecycle::MockWorkerStarter;
    use chrono::Utc;
    use sf_domain::{PipelineId, SupplyLevel, TradeGoodSymbol, WaypointSymbol};
    use sf_store::bmc::InMemoryBmc;

    fn world_with_markets() -> SimWorld {
        let world = SimWorld::new();
        let (m2, m2_market) = market("X1-A-M2", vec![export_good("COPPER", 30, SupplyLevel::High, None, 60)]);
        let (m4, m4_market) = market("X1-A-M4", vec![export_good("IRON", 40, SupplyLevel::High, None, 60)]);
        let (f1, f1_market) = market("X1-A-F1", vec![import_good("COPPER", 45, 100)]);
        world.add_market(m2, m2_market);
        world.add_market(m4, m4_market);
        world.add_market(f1, f1_market);
        world.place_waypoint(WaypointSymbol("X1-A-M2".to_string()), 0, 0);
        world.place_waypoint(WaypointSymbol("X1-A-M4".to_string()), 100, 0);
        world.place_waypoint(WaypointSymbol("X1-A-M3".to_string()), 10, 0);
        world
    }

    fn manager_with_queue(world: &SimWorld, bmc: &Arc<InMemoryBmc>, queue: Arc<TaskQueue>) -> TaskAssignmentManager {
        TaskAssignmentManager::new(
            Arc::clone(bmc) as Arc<dyn Bmc>,
            queue,
            Arc::new(world.clone()),
            Arc::new(world.clone()),
            Arc::new(SystemClock),
            PlayerId("player-1".to_string()),
            40,
        )
    }

    fn ready_acquire_task(good: &str, source: &str) -> ManufacturingTask {
        let mut task = ManufacturingTask::new(
            PipelineId::generate(),
            PlayerId("player-1".to_string()),
            TaskType::AcquireDeliver,
            TradeGoodSymbol::new(good),
            100,
            Some(WaypointSymbol(source.to_string())),
            Some(WaypointSymbol("X1-A-F1".to_string())),
            None,
            Utc::now(),
        );
        task.mark_ready(Utc::now()).unwrap();
        task
    }

    #[tokio::test]
    async fn assigns_nearest_idle_ship_and_runs_protocol() {
        let world = world_with_markets();
        world.add_ship(hauler("SHIP-NEAR", "X1-A-M3", 60));
        world.add_ship(hauler("SHIP-FAR", "X1-A-M4", 60));

        let bmc = Arc::new(InMemoryBmc::new());
        let queue = Arc::new(TaskQueue::new());
        let manager = manager_with_queue(&world, &bmc, Arc::clone(&queue));
        let ctx = Ctx::Anonymous;

        let task = ready_acquire_task("COPPER", "X1-A-M2");
        bmc.task_bmc().insert_task(&ctx, &task).await.unwrap();
        queue.enqueue(task.clone());

        let mut starter = MockWorkerStarter::new();
        starter.expect_start_worker().times(1).returning(|_, _| Ok(()));

        let parent = ContainerId::generate(ContainerType::ManufacturingCoordinator, None);
        let started = manager.assign_tasks(&ctx, &parent, 4, &starter).await.unwrap();
        assert_eq!(started, 1);

        // nearest ship got it
        let assignment = bmc
            .ship_assignment_bmc()
            .get_active_for_ship(&ctx, &PlayerId("player-1".to_string()), &ShipSymbol("SHIP-NEAR".to_string()))
            .await
            .unwrap();
        assert!(assignment.is_some());

        let stored = bmc.task_bmc().get_task(&ctx, &task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert_eq!(stored.assigned_ship, Some(ShipSymbol("SHIP-NEAR".to_string())));

        // task left the queue
        assert!(queue.get_ready_tasks().is_empty());

        // container exists with the right parent
        let container_id = assignment.unwrap().container_id;
        let container = bmc.container_bmc().get_container(&ctx, &container_id).await.unwrap().unwrap();
        assert_eq!(container.parent_container_id, Some(parent));
        assert_eq!(container.metadata.task_id, Some(task.id));
    }

    #[tokio::test]
    async fn respects_max_concurrent_tasks() {
        let world = world_with_markets();
        world.add_ship(hauler("SHIP-1", "X1-A-M3", 60));

        let bmc = Arc::new(InMemoryBmc::new());
        let queue = Arc::new(TaskQueue::new());
        let manager = manager_with_queue(&world, &bmc, Arc::clone(&queue));
        let ctx = Ctx::Anonymous;

        // an already-active task saturates the single slot
        let mut active = ready_acquire_task("IRON", "X1-A-M4");
        active.assign(ShipSymbol("SHIP-0".to_string())).unwrap();
        bmc.task_bmc().insert_task(&ctx, &active).await.unwrap();

        let task = ready_acquire_task("COPPER", "X1-A-M2");
        bmc.task_bmc().insert_task(&ctx, &task).await.unwrap();
        queue.enqueue(task.clone());

        let starter = MockWorkerStarter::new();
        let parent = ContainerId::generate(ContainerType::ManufacturingCoordinator, None);
        let started = manager.assign_tasks(&ctx, &parent, 1, &starter).await.unwrap();

        assert_eq!(started, 0);
        assert_eq!(queue.get_ready_tasks().len(), 1);
    }

    #[tokio::test]
    async fn pre_bound_task_waits_for_its_ship() {
        let world = world_with_markets();
        world.add_ship(hauler("SHIP-OTHER", "X1-A-M3", 60));

        let bmc = Arc::new(InMemoryBmc::new());
        let queue = Arc::new(TaskQueue::new());
        let manager = manager_with_queue(&world, &bmc, Arc::clone(&queue));
        let ctx = Ctx::Anonymous;

        let mut task = sf_domain::ManufacturingTask::standalone_liquidate(
            PlayerId("player-1".to_string()),
            TradeGoodSymbol::new("COPPER"),
            WaypointSymbol("X1-A-F1".to_string()),
            ShipSymbol("SHIP-BOUND".to_string()),
            Utc::now(),
        );
        task.mark_ready(Utc::now()).unwrap();
        bmc.task_bmc().insert_task(&ctx, &task).await.unwrap();
        queue.enqueue_priority(task.clone());

        let starter = MockWorkerStarter::new();
        let parent = ContainerId::generate(ContainerType::ManufacturingCoordinator, None);

        // bound ship is not idle (not even present) -> task stays queued
        let started = manager.assign_tasks(&ctx, &parent, 4, &starter).await.unwrap();
        assert_eq!(started, 0);
        assert_eq!(queue.get_ready_tasks().len(), 1);

        // once the bound ship shows up idle, it gets the task
        world.add_ship(hauler("SHIP-BOUND", "X1-A-M2", 60));
        let mut starter = MockWorkerStarter::new();
        starter.expect_start_worker().times(1).returning(|_, _| Ok(()));
        let started = manager.assign_tasks(&ctx, &parent, 4, &starter).await.unwrap();
        assert_eq!(started, 1);

        let stored = bmc.task_bmc().get_task(&ctx, &task.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_ship, Some(ShipSymbol("SHIP-BOUND".to_string())));
    }

    #[tokio::test]
    async fn worker_start_failure_rolls_back_reservation() {
        let world = world_with_markets();
        world.add_ship(hauler("SHIP-1", "X1-A-M3", 60));

        let bmc = Arc::new(InMemoryBmc::new());
        let queue = Arc::new(TaskQueue::new());
        let manager = manager_with_queue(&world, &bmc, Arc::clone(&queue));
        let ctx = Ctx::Anonymous;

        let task = ready_acquire_task("COPPER", "X1-A-M2");
        bmc.task_bmc().insert_task(&ctx, &task).await.unwrap();
        queue.enqueue(task.clone());

        let mut starter = MockWorkerStarter::new();
        starter
            .expect_start_worker()
            .times(1)
            .returning(|_, _| Err(anyhow!("spawn failed")));

        let parent = ContainerId::generate(ContainerType::ManufacturingCoordinator, None);
        let started = manager.assign_tasks(&ctx, &parent, 4, &starter).await.unwrap();
        assert_eq!(started, 0);

        // ship is free again and the task is still Ready and queued
        assert!(bmc
            .ship_assignment_bmc()
            .get_active_for_ship(&ctx, &PlayerId("player-1".to_string()), &ShipSymbol("SHIP-1".to_string()))
            .await
            .unwrap()
            .is_none());
        let stored = bmc.task_bmc().get_task(&ctx, &task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Ready);
        assert_eq!(queue.get_ready_tasks().len(), 1);
    }

    #[tokio::test]
    async fn small_probes_are_not_haulers() {
        let world = world_with_markets();
        let mut probe = hauler("PROBE-1", "X1-A-M3", 10);
        probe.is_hauler = false;
        world.add_ship(probe);

        let bmc = Arc::new(InMemoryBmc::new());
        let queue = Arc::new(TaskQueue::new());
        let manager = manager_with_queue(&world, &bmc, Arc::clone(&queue));
        let ctx = Ctx::Anonymous;

        let task = ready_acquire_task("COPPER", "X1-A-M2");
        bmc.task_bmc().insert_task(&ctx, &task).await.unwrap();
        queue.enqueue(task);

        let starter = MockWorkerStarter::new();
        let parent = ContainerId::generate(ContainerType::ManufacturingCoordinator, None);
        let started = manager.assign_tasks(&ctx, &parent, 4, &starter).await.unwrap();
        assert_eq!(started, 0);
    }
}
