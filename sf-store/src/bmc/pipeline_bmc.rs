use crate::bmc::factory_state_bmc::FactoryStateBmcTrait;
use crate::bmc::task_bmc::TaskBmcTrait;
use crate::error::StoreError;
use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use itertools::Itertools;
use mockall::automock;
use sf_domain::{FactoryState, ManufacturingPipeline, ManufacturingTask, PipelineId, PipelineStatus, PlayerId};
use sqlx::types::Json;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

#[automock]
#[async_trait]
pub trait PipelineBmcTrait: Send + Sync + Debug {
    /// Persists a freshly planned pipeline together with its tasks and
    /// factory states in one transaction.
    async fn save_pipeline_with_tasks(
        &self,
        ctx: &Ctx,
        pipeline: &ManufacturingPipeline,
        tasks: &[ManufacturingTask],
        factory_states: &[FactoryState],
    ) -> Result<()>;
    async fn get_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Option<ManufacturingPipeline>>;
    /// Compare-and-set on `version`; the stored row wins on conflict.
    async fn update_pipeline(&self, ctx: &Ctx, pipeline: &ManufacturingPipeline) -> Result<ManufacturingPipeline>;
    async fn load_pipelines_by_status(&self, ctx: &Ctx, player_id: &PlayerId, statuses: &[PipelineStatus]) -> Result<Vec<ManufacturingPipeline>>;
}

#[derive(Debug)]
pub struct DbPipelineBmc {
    pub mm: DbModelManager,
}

#[derive(sqlx::FromRow)]
struct DbPipelineRow {
    payload: Json<ManufacturingPipeline>,
}

#[async_trait]
impl PipelineBmcTrait for DbPipelineBmc {
    async fn save_pipeline_with_tasks(
        &self,
        _ctx: &Ctx,
        pipeline: &ManufacturingPipeline,
        tasks: &[ManufacturingTask],
        factory_states: &[FactoryState],
    ) -> Result<()> {
        let mut tx = self.mm.pool().begin().await?;

        sqlx::query(
            r#"
insert into pipelines (id, player_id, status, version, payload)
values ($1, $2, $3, $4, $5)
on conflict (id) do update set status = excluded.status, payload = excluded.payload, version = excluded.version
"#,
        )
        .bind(&pipeline.id.0)
        .bind(&pipeline.player_id.0)
        .bind(pipeline.status.to_string())
        .bind(pipeline.version)
        .bind(Json(pipeline.clone()))
        .execute(&mut *tx)
        .await?;

        for task in tasks {
            sqlx::query(
                r#"
insert into tasks (id, pipeline_id, player_id, status, version, payload)
values ($1, $2, $3, $4, $5, $6)
on conflict (id) do update set status = excluded.status, payload = excluded.payload, version = excluded.version
"#,
            )
            .bind(&task.id.0)
            .bind(task.pipeline_id.as_ref().map(|id| id.0.clone()))
            .bind(&task.player_id.0)
            .bind(task.status.to_string())
            .bind(task.version)
            .bind(Json(task.clone()))
            .execute(&mut *tx)
            .await?;
        }

        for state in factory_states {
            sqlx::query(
                r#"
insert into factory_states (pipeline_id, factory_symbol, output_good, version, payload)
values ($1, $2, $3, $4, $5)
on conflict (pipeline_id, factory_symbol, output_good)
do update set payload = excluded.payload, version = excluded.version
"#,
            )
            .bind(&state.pipeline_id.0)
            .bind(&state.factory_symbol.0)
            .bind(&state.output_good.0)
            .bind(state.version)
            .bind(Json(state.clone()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_pipeline(&self, _ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Option<ManufacturingPipeline>> {
        let row: Option<DbPipelineRow> = sqlx::query_as(
            r#"
select payload from pipelines where id = $1
"#,
        )
        .bind(&pipeline_id.0)
        .fetch_optional(self.mm.pool())
        .await?;

        Ok(row.map(|r| r.payload.0))
    }

    async fn update_pipeline(&self, _ctx: &Ctx, pipeline: &ManufacturingPipeline) -> Result<ManufacturingPipeline> {
        let mut updated = pipeline.clone();
        updated.version += 1;

        let result = sqlx::query(
            r#"
update pipelines
   set status = $1, payload = $2, version = $3
 where id = $4 and version = $5
"#,
        )
        .bind(updated.status.to_string())
        .bind(Json(updated.clone()))
        .bind(updated.version)
        .bind(&pipeline.id.0)
        .bind(pipeline.version)
        .execute(self.mm.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                entity: "pipeline",
                id: pipeline.id.0.clone(),
                expected: pipeline.version,
            }
            .into());
        }

        Ok(updated)
    }

    async fn load_pipelines_by_status(&self, _ctx: &Ctx, player_id: &PlayerId, statuses: &[PipelineStatus]) -> Result<Vec<ManufacturingPipeline>> {
        let status_strings = statuses.iter().map(|s| s.to_string()).collect_vec();
        let rows: Vec<DbPipelineRow> = sqlx::query_as(
            r#"
select payload from pipelines
 where player_id = $1 and status = any($2)
 order by created_at
"#,
        )
        .bind(&player_id.0)
        .bind(&status_strings)
        .fetch_all(self.mm.pool())
        .await?;

        Ok(rows.into_iter().map(|r| r.payload.0).collect_vec())
    }
}

#[derive(Debug)]
pub struct InMemoryPipelineBmc {
    pipelines: Arc<RwLock<HashMap<PipelineId, ManufacturingPipeline>>>,
    pub task_bmc: Arc<super::task_bmc::InMemoryTaskBmc>,
    pub factory_state_bmc: Arc<super::factory_state_bmc::InMemoryFactoryStateBmc>,
}

impl InMemoryPipelineBmc {
    pub fn new(task_bmc: Arc<super::task_bmc::InMemoryTaskBmc>, factory_state_bmc: Arc<super::factory_state_bmc::InMemoryFactoryStateBmc>) -> Self {
        Self {
            pipelines: Arc::new(RwLock::new(HashMap::new())),
            task_bmc,
            factory_state_bmc,
        }
    }
}

#[async_trait]
impl PipelineBmcTrait for InMemoryPipelineBmc {
    async fn save_pipeline_with_tasks(
        &self,
        ctx: &Ctx,
        pipeline: &ManufacturingPipeline,
        tasks: &[ManufacturingTask],
        factory_states: &[FactoryState],
    ) -> Result<()> {
        {
            let mut guard = self.pipelines.write().await;
            guard.insert(pipeline.id.clone(), pipeline.clone());
        }
        for task in tasks {
            self.task_bmc.insert_task(ctx, task).await?;
        }
        for state in factory_states {
            self.factory_state_bmc.upsert_factory_state(ctx, state).await?;
        }
        Ok(())
    }

    async fn get_pipeline(&self, _ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Option<ManufacturingPipeline>> {
        Ok(self.pipelines.read().await.get(pipeline_id).cloned())
    }

    async fn update_pipeline(&self, _ctx: &Ctx, pipeline: &ManufacturingPipeline) -> Result<ManufacturingPipeline> {
        let mut guard = self.pipelines.write().await;
        match guard.get(&pipeline.id) {
            Some(stored) if stored.version == pipeline.version => {
                let mut updated = pipeline.clone();
                updated.version += 1;
                guard.insert(pipeline.id.clone(), updated.clone());
                Ok(updated)
            }
            Some(_) => Err(StoreError::VersionConflict {
                entity: "pipeline",
                id: pipeline.id.0.clone(),
                expected: pipeline.version,
            }
            .into()),
            None => Err(StoreError::NotFound {
                entity: "pipeline",
                id: pipeline.id.0.clone(),
            }
            .into()),
        }
    }

    async fn load_pipelines_by_status(&self, _ctx: &Ctx, player_id: &PlayerId, statuses: &[PipelineStatus]) -> Result<Vec<ManufacturingPipeline>> {
        Ok(self
            .pipelines
            .read()
            .await
            .values()
            .filter(|p| &p.player_id == player_id && statuses.contains(&p.status))
            .cloned()
            .sorted_by_key(|p| p.created_at)
            .collect_vec())
    }
}
