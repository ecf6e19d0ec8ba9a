use crate::error::StoreError;
use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use itertools::Itertools;
use mockall::automock;
use sf_domain::{ManufacturingTask, PipelineId, PlayerId, TaskId, TaskStatus};
use sqlx::types::Json;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

#[automock]
#[async_trait]
pub trait TaskBmcTrait: Send + Sync + Debug {
    async fn insert_task(&self, ctx: &Ctx, task: &ManufacturingTask) -> Result<()>;
    async fn get_task(&self, ctx: &Ctx, task_id: &TaskId) -> Result<Option<ManufacturingTask>>;
    /// Compare-and-set on `version`. A conflict means another writer
    /// progressed; the caller re-reads and retries.
    async fn update_task(&self, ctx: &Ctx, task: &ManufacturingTask) -> Result<ManufacturingTask>;
    async fn load_tasks_for_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Vec<ManufacturingTask>>;
    async fn load_tasks_by_status(&self, ctx: &Ctx, player_id: &PlayerId, statuses: &[TaskStatus]) -> Result<Vec<ManufacturingTask>>;
    async fn count_tasks_by_status(&self, ctx: &Ctx, player_id: &PlayerId, statuses: &[TaskStatus]) -> Result<usize> {
        Ok(self.load_tasks_by_status(ctx, player_id, statuses).await?.len())
    }
}

#[derive(Debug)]
pub struct DbTaskBmc {
    pub mm: DbModelManager,
}

#[derive(sqlx::FromRow)]
struct DbTaskRow {
    payload: Json<ManufacturingTask>,
}

#[async_trait]
impl TaskBmcTrait for DbTaskBmc {
    async fn insert_task(&self, _ctx: &Ctx, task: &ManufacturingTask) -> Result<()> {
        sqlx::query(
            r#"
insert into tasks (id, pipeline_id, player_id, status, version, payload)
values ($1, $2, $3, $4, $5, $6)
"#,
        )
        .bind(&task.id.0)
        .bind(task.pipeline_id.as_ref().map(|id| id.0.clone()))
        .bind(&task.player_id.0)
        .bind(task.status.to_string())
        .bind(task.version)
        .bind(Json(task.clone()))
        .execute(self.mm.pool())
        .await?;

        Ok(())
    }

    async fn get_task(&self, _ctx: &Ctx, task_id: &TaskId) -> Result<Option<ManufacturingTask>> {
        let row: Option<DbTaskRow> = sqlx::query_as(
            r#"
select payload from tasks where id = $1
"#,
        )
        .bind(&task_id.0)
        .fetch_optional(self.mm.pool())
        .await?;

        Ok(row.map(|r| r.payload.0))
    }

    async fn update_task(&self, _ctx: &Ctx, task: &ManufacturingTask) -> Result<ManufacturingTask> {
        let mut updated = task.clone();
        updated.version += 1;

        let result = sqlx::query(
            r#"
update tasks
   set status = $1, payload = $2, version = $3
 where id = $4 and version = $5
"#,
        )
        .bind(updated.status.to_string())
        .bind(Json(updated.clone()))
        .bind(updated.version)
        .bind(&task.id.0)
        .bind(task.version)
        .execute(self.mm.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                entity: "task",
                id: task.id.0.clone(),
                expected: task.version,
            }
            .into());
        }

        Ok(updated)
    }

    async fn load_tasks_for_pipeline(&self, _ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Vec<ManufacturingTask>> {
        let rows: Vec<DbTaskRow> = sqlx::query_as(
            r#"
select payload from tasks where pipeline_id = $1 order by created_at
"#,
        )
        .bind(&pipeline_id.0)
        .fetch_all(self.mm.pool())
        .await?;

        Ok(rows.into_iter().map(|r| r.payload.0).collect_vec())
    }

    async fn load_tasks_by_status(&self, _ctx: &Ctx, player_id: &PlayerId, statuses: &[TaskStatus]) -> Result<Vec<ManufacturingTask>> {
        let status_strings = statuses.iter().map(|s| s.to_string()).collect_vec();
        let rows: Vec<DbTaskRow> = sqlx::query_as(
            r#"
select payload from tasks
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

#[derive(Debug, Default)]
pub struct InMemoryTaskBmc {
    tasks: Arc<RwLock<HashMap<TaskId, ManufacturingTask>>>,
}

impl InMemoryTaskBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskBmcTrait for InMemoryTaskBmc {
    async fn insert_task(&self, _ctx: &Ctx, task: &ManufacturingTask) -> Result<()> {
        let mut guard = self.tasks.write().await;
        guard.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, _ctx: &Ctx, task_id: &TaskId) -> Result<Option<ManufacturingTask>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn update_task(&self, _ctx: &Ctx, task: &ManufacturingTask) -> Result<ManufacturingTask> {
        let mut guard = self.tasks.write().await;
        match guard.get(&task.id) {
            Some(stored) if stored.version == task.version => {
                let mut updated = task.clone();
                updated.version += 1;
                guard.insert(task.id.clone(), updated.clone());
                Ok(updated)
            }
            Some(_) => Err(StoreError::VersionConflict {
                entity: "task",
                id: task.id.0.clone(),
                expected: task.version,
            }
            .into()),
            None => Err(StoreError::NotFound {
                entity: "task",
                id: task.id.0.clone(),
            }
            .into()),
        }
    }

    async fn load_tasks_for_pipeline(&self, _ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Vec<ManufacturingTask>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.pipeline_id.as_ref() == Some(pipeline_id))
            .cloned()
            .sorted_by_key(|t| t.created_at)
            .collect_vec())
    }

    async fn load_tasks_by_status(&self, _ctx: &Ctx, player_id: &PlayerId, statuses: &[TaskStatus]) -> Result<Vec<ManufacturingTask>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| &t.player_id == player_id && statuses.contains(&t.status))
            .cloned()
            .sorted_by_key(|t| t.created_at)
            .collect_vec())
    }
}
