//! End-to-end flows against the in-memory repositories and the sim world:
//! managers are driven the way the coordinator loop drives them, workers
//! run for real.

use crate::config::CoordinatorConfig;
use crate::factory_state_manager::FactoryStateManager;
use crate::orphaned_cargo::OrphanedCargoHandler;
use crate::pipeline_lifecycle::PipelineLifecycleManager;
use crate::ports::SystemClock;
use crate::recovery::StateRecoveryManager;
use crate::state::CoordinatorState;
use crate::supply_monitor::SupplyMonitor;
use crate::task_assignment::TaskAssignmentManager;
use crate::task_queue::TaskQueue;
use crate::test_support::markets::{export_good, import_good, market};
use crate::test_support::sim::{hauler, SimWorld};
use crate::worker_lifecycle::{WorkerLifecycleManager, WorkerStarter};
use sf_domain::{
    ContainerId, ContainerType, PipelineStatus, PlayerId, SupplyLevel, SystemSymbol, TaskCompletion, TaskId, TaskStatus, TaskType, TradeGoodSymbol,
    WaypointSymbol,
};
use sf_store::bmc::Bmc;
use sf_store::Ctx;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    world: SimWorld,
    bmc: Arc<sf_store::bmc::InMemoryBmc>,
    queue: Arc<TaskQueue>,
    config: CoordinatorConfig,
    parent: ContainerId,
    state: CoordinatorState,
    pipeline_manager: PipelineLifecycleManager,
    assignment_manager: TaskAssignmentManager,
    worker_manager: Arc<WorkerLifecycleManager>,
    factory_manager: FactoryStateManager,
    orphan_handler: OrphanedCargoHandler,
    recovery_manager: StateRecoveryManager,
    supply_monitor: SupplyMonitor,
    completion_rx: mpsc::Receiver<TaskCompletion>,
    task_ready_rx: mpsc::Receiver<TaskId>,
    ctx: Ctx,
}

fn electronics_world() -> SimWorld {
    let world = SimWorld::new();
    let (m2, m2_market) = market("X1-A-M2", vec![export_good("COPPER", 30, SupplyLevel::High, None, 60)]);
    let (f1, f1_market) = market(
        "X1-A-F1",
        vec![
            export_good("ELECTRONICS", 1_500, SupplyLevel::Scarce, None, 40),
            import_good("COPPER", 45, 100),
        ],
    );
    let (m1, m1_market) = market("X1-A-M1", vec![import_good("ELECTRONICS", 1_800, 40)]);
    world.add_market(m2, m2_market);
    world.add_market(f1, f1_market);
    world.add_market(m1, m1_market);
    world.place_waypoint(WaypointSymbol("X1-A-M2".to_string()), 0, 0);
    world.place_waypoint(WaypointSymbol("X1-A-F1".to_string()), 20, 0);
    world.place_waypoint(WaypointSymbol("X1-A-M1".to_string()), 40, 0);
    world.place_waypoint(WaypointSymbol("X1-A-M3".to_string()), 10, 0);
    world
}

fn harness(world: SimWorld) -> Harness {
    let bmc = Arc::new(sf_store::bmc::InMemoryBmc::new());
    let queue = Arc::new(TaskQueue::new());
    let clock: Arc<dyn crate::ports::Clock> = Arc::new(SystemClock);
    let player = PlayerId("player-1".to_string());
    let config = CoordinatorConfig::new(SystemSymbol("X1-A".to_string()), player.clone());
    let (completion_tx, completion_rx) = mpsc::channel(100);
    let (task_ready_tx, task_ready_rx) = mpsc::channel(10);

    let pipeline_manager = PipelineLifecycleManager::new(
        Arc::clone(&bmc) as Arc<dyn Bmc>,
        Arc::clone(&queue),
        Arc::new(world.clone()),
        Arc::clone(&clock),
    );
    let assignment_manager = TaskAssignmentManager::new(
        Arc::clone(&bmc) as Arc<dyn Bmc>,
        Arc::clone(&queue),
        Arc::new(world.clone()),
        Arc::new(world.clone()),
        Arc::clone(&clock),
        player.clone(),
        40,
    );
    let worker_manager = Arc::new(WorkerLifecycleManager::new(
        Arc::clone(&bmc) as Arc<dyn Bmc>,
        Arc::new(world.clone()),
        Arc::new(world.clone()),
        Arc::new(world.clone()),
        Arc::clone(&clock),
        completion_tx,
        CancellationToken::new(),
        player.clone(),
    ));
    let factory_manager = FactoryStateManager::new(Arc::clone(&bmc) as Arc<dyn Bmc>, Arc::clone(&queue), Arc::clone(&clock));
    let orphan_handler = OrphanedCargoHandler::new(
        Arc::clone(&bmc) as Arc<dyn Bmc>,
        Arc::new(world.clone()),
        Arc::new(world.clone()),
        Arc::clone(&queue),
        Arc::clone(&clock),
        player.clone(),
    );
    let recovery_manager = StateRecoveryManager::new(
        Arc::clone(&bmc) as Arc<dyn Bmc>,
        Arc::clone(&queue),
        Arc::clone(&clock),
        player.clone(),
    );
    let supply_monitor = SupplyMonitor::new(
        Arc::clone(&bmc) as Arc<dyn Bmc>,
        Arc::new(world.clone()),
        Arc::clone(&queue),
        Arc::clone(&clock),
        player,
        task_ready_tx,
    );

    Harness {
        world,
        bmc,
        queue,
        config,
        parent: ContainerId::generate(ContainerType::ManufacturingCoordinator, None),
        state: CoordinatorState::new(),
        pipeline_manager,
        assignment_manager,
        worker_manager,
        factory_manager,
        orphan_handler,
        recovery_manager,
        supply_monitor,
        completion_rx,
        task_ready_rx,
        ctx: Ctx::Anonymous,
    }
}

impl Harness {
    async fn assignment_pass(&self) -> usize {
        self.assignment_manager
            .assign_tasks(
                &self.ctx,
                &self.parent,
                self.config.max_concurrent_tasks,
                self.worker_manager.as_ref() as &dyn WorkerStarter,
            )
            .await
            .unwrap()
    }

    async fn next_completion(&mut self) -> TaskCompletion {
        tokio::time::timeout(Duration::from_secs(10), self.completion_rx.recv())
            .await
            .expect("timed out waiting for a worker completion")
            .expect("completion channel closed")
    }

    /// What the coordinator loop does on a workerCompletion event.
    async fn handle_completion(&mut self, completion: TaskCompletion) {
        let was_active = self.worker_manager.handle_worker_completion(&self.ctx, &completion).await.unwrap();
        assert!(was_active);

        if completion.success {
            let task = self.bmc.task_bmc().get_task(&self.ctx, &completion.task_id).await.unwrap().unwrap();
            self.factory_manager.update_factory_state_on_delivery(&self.ctx, &task).await.unwrap();
            if let Some(pipeline_id) = &completion.pipeline_id {
                self.factory_manager
                    .update_dependent_tasks(&self.ctx, &completion.task_id, pipeline_id)
                    .await
                    .unwrap();
                self.pipeline_manager.record_progress(&self.ctx, &mut self.state, pipeline_id).await.unwrap();
                self.pipeline_manager
                    .check_pipeline_completion(&self.ctx, &mut self.state, pipeline_id)
                    .await
                    .unwrap();
            }
        } else {
            let ended_in = self
                .worker_manager
                .handle_task_failure(&self.ctx, &completion, self.config.max_retries)
                .await
                .unwrap();
            if ended_in == TaskStatus::Pending {
                self.factory_manager.reevaluate_task(&self.ctx, &completion.task_id).await.unwrap();
            }
            if let Some(pipeline_id) = &completion.pipeline_id {
                self.pipeline_manager
                    .check_pipeline_completion(&self.ctx, &mut self.state, pipeline_id)
                    .await
                    .unwrap();
            }
        }
    }
}

#[test_log::test(tokio::test)]
async fn single_input_pipeline_runs_to_completion() {
    let world = electronics_world();
    world.add_ship(hauler("SHIP-1", "X1-A-M3", 120));
    let mut h = harness(world);

    // opportunity scan creates the pipeline and seeds the queue
    let created = h
        .pipeline_manager
        .scan_and_create_pipelines(&h.ctx, &mut h.state, &h.config)
        .await
        .unwrap();
    assert_eq!(created, 1);
    let pipeline_id = h.state.active_pipelines.keys().next().unwrap().clone();

    // idle-ship pass starts the AcquireDeliver worker
    assert_eq!(h.assignment_pass().await, 1);
    let completion = h.next_completion().await;
    assert!(completion.success);
    h.handle_completion(completion).await;

    // all 100 units delivered; the collect task is staged, not ready
    let factory = h
        .bmc
        .factory_state_bmc()
        .get_factory_state(
            &h.ctx,
            &pipeline_id,
            &WaypointSymbol("X1-A-F1".to_string()),
            &TradeGoodSymbol::new("ELECTRONICS"),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(factory.all_inputs_delivered());
    assert!(h.queue.get_ready_tasks().is_empty());
    assert_eq!(h.queue.collection_size(), 1);

    // factory production catches up; the monitor observes HIGH supply
    h.world.set_supply(
        &WaypointSymbol("X1-A-F1".to_string()),
        &TradeGoodSymbol::new("ELECTRONICS"),
        SupplyLevel::High,
    );
    assert_eq!(h.supply_monitor.poll_once(&h.ctx).await.unwrap(), 1);
    assert!(h.task_ready_rx.try_recv().is_ok());

    // taskReady signal triggers the next assignment pass
    assert_eq!(h.assignment_pass().await, 1);
    let completion = h.next_completion().await;
    assert!(completion.success);
    h.handle_completion(completion).await;

    // pipeline completed with the task totals
    let pipeline = h.bmc.pipeline_bmc().get_pipeline(&h.ctx, &pipeline_id).await.unwrap().unwrap();
    assert_eq!(pipeline.status, PipelineStatus::Completed);
    assert!(h.state.active_pipelines.is_empty());
    assert!(pipeline.net_profit() > 0);

    // ledger saw purchases, the factory delivery, the collection and the sale
    let transactions = h
        .bmc
        .ledger_bmc()
        .load_transactions(&h.ctx, &PlayerId("player-1".to_string()), 100)
        .await
        .unwrap();
    assert!(transactions.iter().any(|t| t.amount < 0));
    assert!(transactions.iter().any(|t| t.amount > 0));

    // no leases left behind
    assert!(h
        .bmc
        .ship_assignment_bmc()
        .load_active(&h.ctx, &PlayerId("player-1".to_string()))
        .await
        .unwrap()
        .is_empty());

    // the ship ends where it sold
    assert_eq!(h.world.ship(&sf_domain::ShipSymbol("SHIP-1".to_string())).location, WaypointSymbol("X1-A-M1".to_string()));
}

#[test_log::test(tokio::test)]
async fn supply_crash_leaves_partial_delivery_and_no_collect_readiness() {
    let world = electronics_world();
    world.add_ship(hauler("SHIP-1", "X1-A-M3", 60));
    let mut h = harness(world);

    h.pipeline_manager
        .scan_and_create_pipelines(&h.ctx, &mut h.state, &h.config)
        .await
        .unwrap();
    let pipeline_id = h.state.active_pipelines.keys().next().unwrap().clone();

    // cargo cap 60 < target 100: worker exits with partial delivery
    assert_eq!(h.assignment_pass().await, 1);
    let completion = h.next_completion().await;
    assert!(completion.success);
    h.handle_completion(completion).await;

    let factory = h
        .bmc
        .factory_state_bmc()
        .get_factory_state(
            &h.ctx,
            &pipeline_id,
            &WaypointSymbol("X1-A-F1".to_string()),
            &TradeGoodSymbol::new("ELECTRONICS"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(factory.delivered_inputs.get(&TradeGoodSymbol::new("COPPER")), Some(&60));
    assert!(!factory.all_inputs_delivered());
    assert!(!factory.ready_for_collection);

    // supply never reached HIGH, so nothing is ready to collect
    assert_eq!(h.supply_monitor.poll_once(&h.ctx).await.unwrap(), 0);
    assert!(h.queue.get_ready_tasks().is_empty());
}

#[test_log::test(tokio::test)]
async fn crash_recovery_liquidates_orphaned_cargo() {
    let world = electronics_world();
    let mut ship = hauler("SHIP-1", "X1-A-M2", 60);
    ship.cargo = ship.cargo.with_item_added(TradeGoodSymbol::new("COPPER"), 40).unwrap();
    world.add_ship(ship);
    let mut h = harness(world);

    // a previous process died while SHIP-1 was executing with cargo
    h.pipeline_manager
        .scan_and_create_pipelines(&h.ctx, &mut h.state, &h.config)
        .await
        .unwrap();
    let pipeline_id = h.state.active_pipelines.keys().next().unwrap().clone();
    let tasks = h.bmc.task_bmc().load_tasks_for_pipeline(&h.ctx, &pipeline_id).await.unwrap();
    let mut acquire = tasks.into_iter().find(|t| t.task_type == TaskType::AcquireDeliver).unwrap();
    acquire.assign(sf_domain::ShipSymbol("SHIP-1".to_string())).unwrap();
    acquire.start(chrono::Utc::now()).unwrap();
    h.bmc.task_bmc().update_task(&h.ctx, &acquire).await.unwrap();
    h.queue.clear();

    // boot: recovery resets the task, orphan sweep binds a liquidation
    h.state = h.recovery_manager.recover(&h.ctx).await.unwrap();
    let recovered = h.bmc.task_bmc().get_task(&h.ctx, &acquire.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, TaskStatus::Ready);
    assert_eq!(recovered.assigned_ship, None);

    let created = h
        .orphan_handler
        .rescue_orphaned_cargo(&h.ctx, &SystemSymbol("X1-A".to_string()))
        .await
        .unwrap();
    assert_eq!(created, 1);

    // the liquidation outranks the re-queued acquire task
    let ready = h.queue.get_ready_tasks();
    assert_eq!(ready[0].task_type, TaskType::Liquidate);

    // one ship, so only the liquidation starts this pass
    assert_eq!(h.assignment_pass().await, 1);
    let completion = h.next_completion().await;
    assert!(completion.success);
    let liquidated = h.bmc.task_bmc().get_task(&h.ctx, &completion.task_id).await.unwrap().unwrap();
    assert_eq!(liquidated.task_type, TaskType::Liquidate);
    assert_eq!(liquidated.status, TaskStatus::Completed);
    assert!(liquidated.total_revenue > 0);

    // cargo is gone; the original acquire task is still queued for later
    assert_eq!(
        h.world
            .ship(&sf_domain::ShipSymbol("SHIP-1".to_string()))
            .cargo
            .units_of(&TradeGoodSymbol::new("COPPER")),
        0
    );
    h.handle_completion(completion).await;
    assert!(h.queue.get_ready_tasks().iter().any(|t| t.id == acquire.id));
}

#[test_log::test(tokio::test)]
async fn two_pipelines_share_one_ship_by_proximity() {
    let world = SimWorld::new();
    let (m2, m2_market) = market("X1-A-M2", vec![export_good("COPPER", 30, SupplyLevel::High, None, 60)]);
    let (m4, m4_market) = market("X1-A-M4", vec![export_good("IRON", 35, SupplyLevel::High, None, 60)]);
    let (f1, f1_market) = market(
        "X1-A-F1",
        vec![
            export_good("ELECTRONICS", 1_500, SupplyLevel::Scarce, None, 40),
            import_good("COPPER", 45, 100),
        ],
    );
    let (f2, f2_market) = market(
        "X1-A-F2",
        vec![
            export_good("MACHINERY", 1_400, SupplyLevel::Scarce, None, 40),
            import_good("IRON", 50, 100),
        ],
    );
    let (m1, m1_market) = market(
        "X1-A-M1",
        vec![import_good("ELECTRONICS", 1_800, 40), import_good("MACHINERY", 1_700, 40)],
    );
    world.add_market(m2, m2_market);
    world.add_market(m4, m4_market);
    world.add_market(f1, f1_market);
    world.add_market(f2, f2_market);
    world.add_market(m1, m1_market);
    world.place_waypoint(WaypointSymbol("X1-A-M2".to_string()), 0, 0);
    world.place_waypoint(WaypointSymbol("X1-A-M4".to_string()), 100, 0);
    world.place_waypoint(WaypointSymbol("X1-A-F1".to_string()), 20, 0);
    world.place_waypoint(WaypointSymbol("X1-A-F2".to_string()), 80, 0);
    world.place_waypoint(WaypointSymbol("X1-A-M1".to_string()), 50, 0);
    // the single hauler sits next to the copper market
    world.place_waypoint(WaypointSymbol("X1-A-M3".to_string()), 5, 0);
    world.add_ship(hauler("SHIP-1", "X1-A-M3", 120));

    let mut h = harness(world);
    h.config.max_pipelines = 2;

    let created = h
        .pipeline_manager
        .scan_and_create_pipelines(&h.ctx, &mut h.state, &h.config)
        .await
        .unwrap();
    assert_eq!(created, 2);
    assert_eq!(h.queue.get_ready_tasks().len(), 2);

    // only one ship: exactly one task starts, and it is the nearer one
    assert_eq!(h.assignment_pass().await, 1);
    let completion = h.next_completion().await;
    let started = h.bmc.task_bmc().get_task(&h.ctx, &completion.task_id).await.unwrap().unwrap();
    assert_eq!(started.good, TradeGoodSymbol::new("COPPER"));
    h.handle_completion(completion).await;

    // ship is idle again: the remaining task gets it
    assert_eq!(h.assignment_pass().await, 1);
    let completion = h.next_completion().await;
    let second = h.bmc.task_bmc().get_task(&h.ctx, &completion.task_id).await.unwrap().unwrap();
    assert_eq!(second.good, TradeGoodSymbol::new("IRON"));
    h.handle_completion(completion).await;
}
