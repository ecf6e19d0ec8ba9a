use crate::ports::Clock;
use crate::task_queue::TaskQueue;
use anyhow::Result;
use itertools::Itertools;
use sf_domain::{FactoryState, ManufacturingTask, PipelineId, TaskId, TaskStatus, TaskType};
use sf_store::bmc::Bmc;
use sf_store::{Ctx, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

const CAS_ATTEMPTS: usize = 3;

/// Bookkeeping between completed deliveries and task readiness: records
/// delivered inputs on the factory state and promotes dependents whose
/// prerequisites are all met.
pub struct FactoryStateManager {
    bmc: Arc<dyn Bmc>,
    queue: Arc<TaskQueue>,
    clock: Arc<dyn Clock>,
}

impl FactoryStateManager {
    pub fn new(bmc: Arc<dyn Bmc>, queue: Arc<TaskQueue>, clock: Arc<dyn Clock>) -> Self {
        Self { bmc, queue, clock }
    }

    /// Adds a completed AcquireDeliver's actual quantity to the factory's
    /// delivered inputs. Other task types are ignored.
    pub async fn update_factory_state_on_delivery(&self, ctx: &Ctx, task: &ManufacturingTask) -> Result<()> {
        if task.task_type != TaskType::AcquireDeliver || task.actual_quantity == 0 {
            return Ok(());
        }
        let (Some(pipeline_id), Some(factory_symbol)) = (&task.pipeline_id, &task.factory_symbol) else {
            return Ok(());
        };

        for _ in 0..CAS_ATTEMPTS {
            let states = self.bmc.factory_state_bmc().load_for_pipeline(ctx, pipeline_id).await?;
            let Some(mut state) = states.into_iter().find(|s| &s.factory_symbol == factory_symbol) else {
                event!(Level::WARN, "no factory state for {} in pipeline {}", factory_symbol, pipeline_id);
                return Ok(());
            };

            state.record_delivery(&task.good, task.actual_quantity);
            match self.bmc.factory_state_bmc().update_factory_state(ctx, &state).await {
                Ok(updated) => {
                    if updated.all_inputs_delivered() {
                        event!(Level::INFO, "factory {} has all inputs for {}", factory_symbol, updated.output_good);
                    }
                    return Ok(());
                }
                Err(err) if err.downcast_ref::<StoreError>().map(|e| matches!(e, StoreError::VersionConflict { .. })).unwrap_or(false) => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(anyhow::anyhow!(
            "factory state for {} kept moving while recording a delivery",
            factory_symbol
        ))
    }

    /// Promotes Pending tasks that depended on the completed task. Returns
    /// the newly Ready tasks (already enqueued).
    pub async fn update_dependent_tasks(&self, ctx: &Ctx, completed_task_id: &TaskId, pipeline_id: &PipelineId) -> Result<Vec<ManufacturingTask>> {
        let tasks = self.bmc.task_bmc().load_tasks_for_pipeline(ctx, pipeline_id).await?;
        let by_id: HashMap<TaskId, TaskStatus> = tasks.iter().map(|t| (t.id.clone(), t.status)).collect();

        let mut promoted = vec![];
        for task in tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending && t.depends_on.contains(completed_task_id))
            .collect_vec()
        {
            if let Some(ready) = self.try_promote(ctx, task, &by_id).await? {
                promoted.push(ready);
            }
        }
        Ok(promoted)
    }

    /// Re-evaluates a single Pending task (used after a retryable failure
    /// put it back into the pool).
    pub async fn reevaluate_task(&self, ctx: &Ctx, task_id: &TaskId) -> Result<Option<ManufacturingTask>> {
        let Some(task) = self.bmc.task_bmc().get_task(ctx, task_id).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::Pending {
            return Ok(None);
        }
        let by_id = match &task.pipeline_id {
            Some(pipeline_id) => {
                let tasks = self.bmc.task_bmc().load_tasks_for_pipeline(ctx, pipeline_id).await?;
                tasks.iter().map(|t| (t.id.clone(), t.status)).collect()
            }
            None => HashMap::new(),
        };
        self.try_promote(ctx, task, &by_id).await
    }

    /// Promotes a Pending task whose dependencies are all Completed. A
    /// CollectSell with an unready factory is staged in the queue instead
    /// so the supply monitor can flip it later.
    async fn try_promote(&self, ctx: &Ctx, mut task: ManufacturingTask, statuses: &HashMap<TaskId, TaskStatus>) -> Result<Option<ManufacturingTask>> {
        let deps_completed = task
            .depends_on
            .iter()
            .all(|dep| statuses.get(dep).map(|s| *s == TaskStatus::Completed).unwrap_or(false));
        if !deps_completed {
            return Ok(None);
        }

        if task.task_type == TaskType::CollectSell {
            let ready = self.factory_ready_for(ctx, &task).await?;
            if !ready {
                event!(
                    Level::DEBUG,
                    "collect task {} waits for factory supply at {:?}",
                    task.id,
                    task.factory_symbol
                );
                self.queue.stage_collect_task(task);
                return Ok(None);
            }
        }

        task.mark_ready(self.clock.now())?;
        let task = self.bmc.task_bmc().update_task(ctx, &task).await?;
        self.queue.enqueue(task.clone());
        Ok(Some(task))
    }

    async fn factory_ready_for(&self, ctx: &Ctx, task: &ManufacturingTask) -> Result<bool> {
        let (Some(pipeline_id), Some(factory_symbol)) = (&task.pipeline_id, &task.factory_symbol) else {
            return Ok(false);
        };
        let state = self
            .bmc
            .factory_state_bmc()
            .get_factory_state(ctx, pipeline_id, factory_symbol, &task.good)
            .await?;
        Ok(state.map(|s| s.ready_for_collection).unwrap_or(false))
    }
}
