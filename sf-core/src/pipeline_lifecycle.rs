use crate::config::CoordinatorConfig;
use crate::demand_finder::DemandFinder;
use crate::pipeline_planner::PipelinePlanner;
use crate::ports::{Clock, MarketData};
use crate::state::CoordinatorState;
use crate::supply_chain::SystemMarkets;
use crate::task_queue::TaskQueue;
use anyhow::Result;
use itertools::Itertools;
use sf_domain::{PipelineId, TaskStatus, TaskType};
use sf_store::bmc::Bmc;
use sf_store::{Ctx, StoreError};
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{event, Level};

const CAS_ATTEMPTS: usize = 3;

/// Creates pipelines out of scanned opportunities and decides when a
/// pipeline is done, stuck, or fatally blocked.
pub struct PipelineLifecycleManager {
    bmc: Arc<dyn Bmc>,
    queue: Arc<TaskQueue>,
    market_data: Arc<dyn MarketData>,
    clock: Arc<dyn Clock>,
    finder: DemandFinder,
    planner: PipelinePlanner,
}

impl PipelineLifecycleManager {
    pub fn new(bmc: Arc<dyn Bmc>, queue: Arc<TaskQueue>, market_data: Arc<dyn MarketData>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bmc,
            queue,
            market_data,
            clock,
            finder: DemandFinder::new(),
            planner: PipelinePlanner::new(),
        }
    }

    /// One opportunity scan: plan and persist pipelines until the active
    /// cap is reached. Per-opportunity failures are logged and skipped.
    pub async fn scan_and_create_pipelines(&self, ctx: &Ctx, state: &mut CoordinatorState, config: &CoordinatorConfig) -> Result<usize> {
        if state.active_pipelines.len() >= config.max_pipelines {
            return Ok(0);
        }

        if config.min_balance > 0 {
            let balance = self.bmc.ledger_bmc().balance(ctx, &config.player_id).await?;
            if balance < config.min_balance {
                event!(Level::INFO, "balance {} below floor {}, skipping pipeline creation", balance, config.min_balance);
                return Ok(0);
            }
        }

        let markets = SystemMarkets::snapshot(self.market_data.as_ref(), &config.system_symbol).await?;
        let candidates = self
            .finder
            .find_opportunities(&markets, config.min_purchase_price, config.max_pipelines * 2);

        // score first; among ties, the good we built longest ago wins
        let candidates = candidates
            .into_iter()
            .sorted_by_key(|opp| {
                let last_created = state.last_pipeline_created.get(&opp.product_good).copied();
                (Reverse(opp.score), last_created)
            })
            .collect_vec();

        let mut created = 0;
        for opportunity in candidates {
            if state.active_pipelines.len() >= config.max_pipelines {
                break;
            }
            if state.has_active_pipeline_for(&opportunity.product_good) {
                continue;
            }

            let now = self.clock.now();
            let mut planned = match self
                .planner
                .create_pipeline(&config.player_id, &opportunity, &markets, config.strategy, now)
            {
                Ok(planned) => planned,
                Err(err) => {
                    event!(Level::WARN, "could not plan pipeline for {}: {err:#}", opportunity.product_good);
                    continue;
                }
            };

            if config.dry_run {
                event!(
                    Level::INFO,
                    "[dry-run] would create pipeline for {} ({} tasks, {} factories, score {})",
                    opportunity.product_good,
                    planned.tasks.len(),
                    planned.factory_states.len(),
                    opportunity.score
                );
                continue;
            }

            planned.pipeline.start_executing()?;
            for task in planned.tasks.iter_mut().filter(|t| t.is_root()) {
                task.mark_ready(now)?;
            }

            self.bmc
                .pipeline_bmc()
                .save_pipeline_with_tasks(ctx, &planned.pipeline, &planned.tasks, &planned.factory_states)
                .await?;

            // only root tasks enter the queue now; CollectSell tasks get
            // staged by FactoryStateManager once their deliveries land
            for task in planned.tasks.iter().filter(|t| t.status == TaskStatus::Ready) {
                self.queue.enqueue(task.clone());
            }

            event!(
                Level::INFO,
                "created pipeline {} for {} ({} tasks, sell at {})",
                planned.pipeline.id,
                planned.pipeline.product_good,
                planned.tasks.len(),
                planned.pipeline.sell_market
            );
            metrics::counter!("manufacturing_pipelines_created_total").increment(1);

            state.last_pipeline_created.insert(planned.pipeline.product_good.clone(), now);
            state.active_pipelines.insert(planned.pipeline.id.clone(), planned.pipeline);
            created += 1;
        }

        Ok(created)
    }

    /// A pipeline with no progress past the threshold and nothing in
    /// flight is recycled: failed, its open tasks cancelled, its factory
    /// states dropped.
    pub async fn detect_and_recycle_stuck_pipelines(&self, ctx: &Ctx, state: &mut CoordinatorState, threshold: chrono::Duration) -> Result<usize> {
        let now = self.clock.now();
        let stuck_candidates = state
            .active_pipelines
            .values()
            .filter(|p| p.last_progress_at + threshold < now)
            .map(|p| p.id.clone())
            .collect_vec();

        let mut recycled = 0;
        for pipeline_id in stuck_candidates {
            let tasks = self.bmc.task_bmc().load_tasks_for_pipeline(ctx, &pipeline_id).await?;
            if tasks.iter().any(|t| t.status.is_active()) {
                continue;
            }

            event!(Level::WARN, "pipeline {} is stuck, recycling", pipeline_id);
            self.fail_pipeline(ctx, state, &pipeline_id, "stuck").await?;
            self.bmc.factory_state_bmc().delete_for_pipeline(ctx, &pipeline_id).await?;
            metrics::counter!("manufacturing_pipelines_stuck_total").increment(1);
            recycled += 1;
        }
        Ok(recycled)
    }

    /// Recomputes completion from task statuses. Idempotent; called on
    /// every worker completion and from the safety tick.
    pub async fn check_pipeline_completion(&self, ctx: &Ctx, state: &mut CoordinatorState, pipeline_id: &PipelineId) -> Result<bool> {
        if !state.active_pipelines.contains_key(pipeline_id) {
            return Ok(false);
        }

        let tasks = self.bmc.task_bmc().load_tasks_for_pipeline(ctx, pipeline_id).await?;
        if tasks.is_empty() {
            return Ok(false);
        }

        if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            let total_cost: i64 = tasks.iter().map(|t| t.total_cost).sum();
            let total_revenue: i64 = tasks.iter().map(|t| t.total_revenue).sum();

            self.update_pipeline_with_retry(ctx, pipeline_id, |pipeline| {
                pipeline.complete(total_cost, total_revenue, self.clock.now())?;
                Ok(())
            })
            .await?;

            let profit = total_revenue - total_cost;
            event!(Level::INFO, "pipeline {} completed, profit {}", pipeline_id, profit);
            metrics::counter!("manufacturing_pipelines_completed_total").increment(1);

            state.active_pipelines.remove(pipeline_id);
            return Ok(true);
        }

        let any_failed = tasks.iter().any(|t| t.status == TaskStatus::Failed);
        let any_progressing = tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Ready | TaskStatus::Assigned | TaskStatus::Executing));
        if any_failed && !any_progressing {
            event!(Level::WARN, "pipeline {} is fatally blocked by failed tasks", pipeline_id);
            self.fail_pipeline(ctx, state, pipeline_id, "task failure").await?;
            metrics::counter!("manufacturing_pipelines_failed_total").increment(1);
            return Ok(true);
        }

        Ok(false)
    }

    /// Boot-time and safety-tick sweep over every active pipeline.
    pub async fn check_all_pipelines_for_completion(&self, ctx: &Ctx, state: &mut CoordinatorState) -> Result<()> {
        for pipeline_id in state.active_pipelines.keys().cloned().collect_vec() {
            self.check_pipeline_completion(ctx, state, &pipeline_id).await?;
        }
        Ok(())
    }

    /// Demotes Ready-but-unassigned CollectSell tasks whose factory
    /// drifted out of collectable supply.
    pub async fn rescue_ready_collect_sell_tasks(&self, ctx: &Ctx, player_id: &sf_domain::PlayerId) -> Result<usize> {
        let ready_collects = self
            .bmc
            .task_bmc()
            .load_tasks_by_status(ctx, player_id, &[TaskStatus::Ready])
            .await?
            .into_iter()
            .filter(|t| t.task_type == TaskType::CollectSell && t.assigned_ship.is_none())
            .collect_vec();

        let mut demoted = 0;
        for mut task in ready_collects {
            let (Some(pipeline_id), Some(factory_symbol)) = (&task.pipeline_id, &task.factory_symbol) else {
                continue;
            };
            let still_ready = self
                .bmc
                .factory_state_bmc()
                .get_factory_state(ctx, pipeline_id, factory_symbol, &task.good)
                .await?
                .map(|s| s.ready_for_collection)
                .unwrap_or(false);
            if still_ready {
                continue;
            }

            task.demote_to_pending()?;
            match self.bmc.task_bmc().update_task(ctx, &task).await {
                Ok(_) => {
                    self.queue.demote_collect_task(&task.id);
                    event!(Level::INFO, "demoted collect task {} (factory supply drifted)", task.id);
                    demoted += 1;
                }
                Err(err) if is_version_conflict(&err) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(demoted)
    }

    /// Stamps progress on the pipeline after a task completed.
    pub async fn record_progress(&self, ctx: &Ctx, state: &mut CoordinatorState, pipeline_id: &PipelineId) -> Result<()> {
        if !state.active_pipelines.contains_key(pipeline_id) {
            return Ok(());
        }
        let now = self.clock.now();
        let updated = self
            .update_pipeline_with_retry(ctx, pipeline_id, |pipeline| {
                pipeline.record_progress(now);
                Ok(())
            })
            .await?;
        state.active_pipelines.insert(pipeline_id.clone(), updated);
        Ok(())
    }

    async fn fail_pipeline(&self, ctx: &Ctx, state: &mut CoordinatorState, pipeline_id: &PipelineId, reason: &str) -> Result<()> {
        self.update_pipeline_with_retry(ctx, pipeline_id, |pipeline| {
            pipeline.fail(reason, self.clock.now())?;
            Ok(())
        })
        .await?;

        // cancel whatever has not finished
        for mut task in self.bmc.task_bmc().load_tasks_for_pipeline(ctx, pipeline_id).await? {
            if task.status.is_terminal() {
                continue;
            }
            self.queue.remove(&task.id);
            if task.cancel(self.clock.now()).is_ok() {
                if let Err(err) = self.bmc.task_bmc().update_task(ctx, &task).await {
                    event!(Level::WARN, "could not cancel task {}: {err:#}", task.id);
                }
            }
        }

        state.active_pipelines.remove(pipeline_id);
        Ok(())
    }

    async fn update_pipeline_with_retry(
        &self,
        ctx: &Ctx,
        pipeline_id: &PipelineId,
        apply: impl Fn(&mut sf_domain::ManufacturingPipeline) -> Result<()>,
    ) -> Result<sf_domain::ManufacturingPipeline> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut pipeline) = self.bmc.pipeline_bmc().get_pipeline(ctx, pipeline_id).await? else {
                anyhow::bail!("pipeline {} not found", pipeline_id);
            };
            apply(&mut pipeline)?;
            match self.bmc.pipeline_bmc().update_pipeline(ctx, &pipeline).await {
                Ok(updated) => return Ok(updated),
                Err(err) if is_version_conflict(&err) => continue,
                Err(err) => return Err(err),
            }
        }
        anyhow::bail!("pipeline {} kept moving during update", pipeline_id)
    }
}

fn is_version_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::VersionConflict { .. }))
}
