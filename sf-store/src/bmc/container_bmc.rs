use crate::error::StoreError;
use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use mockall::automock;
use sf_domain::{ContainerId, ContainerStatus, PlayerId, WorkerContainer};
use sqlx::types::Json;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

#[automock]
#[async_trait]
pub trait ContainerBmcTrait: Send + Sync + Debug {
    async fn insert_container(&self, ctx: &Ctx, container: &WorkerContainer) -> Result<()>;
    async fn get_container(&self, ctx: &Ctx, container_id: &ContainerId) -> Result<Option<WorkerContainer>>;
    async fn set_container_status(
        &self,
        ctx: &Ctx,
        container_id: &ContainerId,
        status: ContainerStatus,
        exit_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn delete_container(&self, ctx: &Ctx, container_id: &ContainerId) -> Result<()>;
    async fn list_containers(&self, ctx: &Ctx, player_id: Option<PlayerId>, status: Option<ContainerStatus>) -> Result<Vec<WorkerContainer>>;
    async fn load_children(&self, ctx: &Ctx, parent_container_id: &ContainerId) -> Result<Vec<WorkerContainer>>;
}

#[derive(Debug)]
pub struct DbContainerBmc {
    pub mm: DbModelManager,
}

#[derive(sqlx::FromRow)]
struct DbContainerRow {
    payload: Json<WorkerContainer>,
}

#[async_trait]
impl ContainerBmcTrait for DbContainerBmc {
    async fn insert_container(&self, _ctx: &Ctx, container: &WorkerContainer) -> Result<()> {
        sqlx::query(
            r#"
insert into containers (container_id, player_id, parent_container_id, status, payload)
values ($1, $2, $3, $4, $5)
on conflict (container_id) do update set status = excluded.status, payload = excluded.payload
"#,
        )
        .bind(&container.container_id.0)
        .bind(&container.player_id.0)
        .bind(container.parent_container_id.as_ref().map(|id| id.0.clone()))
        .bind(container.status.to_string())
        .bind(Json(container.clone()))
        .execute(self.mm.pool())
        .await?;

        Ok(())
    }

    async fn get_container(&self, _ctx: &Ctx, container_id: &ContainerId) -> Result<Option<WorkerContainer>> {
        let row: Option<DbContainerRow> = sqlx::query_as(
            r#"
select payload from containers where container_id = $1
"#,
        )
        .bind(&container_id.0)
        .fetch_optional(self.mm.pool())
        .await?;

        Ok(row.map(|r| r.payload.0))
    }

    async fn set_container_status(
        &self,
        ctx: &Ctx,
        container_id: &ContainerId,
        status: ContainerStatus,
        exit_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut container = self
            .get_container(ctx, container_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "container",
                id: container_id.0.clone(),
            })?;

        container.status = status;
        container.exit_reason = exit_reason;
        container.updated_at = now;

        sqlx::query(
            r#"
update containers set status = $1, payload = $2 where container_id = $3
"#,
        )
        .bind(container.status.to_string())
        .bind(Json(container))
        .bind(&container_id.0)
        .execute(self.mm.pool())
        .await?;

        Ok(())
    }

    async fn delete_container(&self, _ctx: &Ctx, container_id: &ContainerId) -> Result<()> {
        sqlx::query(
            r#"
delete from containers where container_id = $1
"#,
        )
        .bind(&container_id.0)
        .execute(self.mm.pool())
        .await?;

        Ok(())
    }

    async fn list_containers(&self, _ctx: &Ctx, player_id: Option<PlayerId>, status: Option<ContainerStatus>) -> Result<Vec<WorkerContainer>> {
        let rows: Vec<DbContainerRow> = sqlx::query_as(
            r#"
select payload from containers
 where ($1::text is null or player_id = $1)
   and ($2::text is null or status = $2)
 order by created_at
"#,
        )
        .bind(player_id.map(|p| p.0))
        .bind(status.map(|s| s.to_string()))
        .fetch_all(self.mm.pool())
        .await?;

        Ok(rows.into_iter().map(|r| r.payload.0).collect_vec())
    }

    async fn load_children(&self, _ctx: &Ctx, parent_container_id: &ContainerId) -> Result<Vec<WorkerContainer>> {
        let rows: Vec<DbContainerRow> = sqlx::query_as(
            r#"
select payload from containers where parent_container_id = $1
"#,
        )
        .bind(&parent_container_id.0)
        .fetch_all(self.mm.pool())
        .await?;

        Ok(rows.into_iter().map(|r| r.payload.0).collect_vec())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryContainerBmc {
    containers: Arc<RwLock<HashMap<ContainerId, WorkerContainer>>>,
}

impl InMemoryContainerBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerBmcTrait for InMemoryContainerBmc {
    async fn insert_container(&self, _ctx: &Ctx, container: &WorkerContainer) -> Result<()> {
        let mut guard = self.containers.write().await;
        guard.insert(container.container_id.clone(), container.clone());
        Ok(())
    }

    async fn get_container(&self, _ctx: &Ctx, container_id: &ContainerId) -> Result<Option<WorkerContainer>> {
        Ok(self.containers.read().await.get(container_id).cloned())
    }

    async fn set_container_status(
        &self,
        _ctx: &Ctx,
        container_id: &ContainerId,
        status: ContainerStatus,
        exit_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut guard = self.containers.write().await;
        let container = guard.get_mut(container_id).ok_or_else(|| StoreError::NotFound {
            entity: "container",
            id: container_id.0.clone(),
        })?;
        container.status = status;
        container.exit_reason = exit_reason;
        container.updated_at = now;
        Ok(())
    }

    async fn delete_container(&self, _ctx: &Ctx, container_id: &ContainerId) -> Result<()> {
        let mut guard = self.containers.write().await;
        guard.remove(container_id);
        Ok(())
    }

    async fn list_containers(&self, _ctx: &Ctx, player_id: Option<PlayerId>, status: Option<ContainerStatus>) -> Result<Vec<WorkerContainer>> {
        Ok(self
            .containers
            .read()
            .await
            .values()
            .filter(|c| player_id.as_ref().map(|p| &c.player_id == p).unwrap_or(true))
            .filter(|c| status.map(|s| c.status == s).unwrap_or(true))
            .cloned()
            .sorted_by_key(|c| c.created_at)
            .collect_vec())
    }

    async fn load_children(&self, _ctx: &Ctx, parent_container_id: &ContainerId) -> Result<Vec<WorkerContainer>> {
        Ok(self
            .containers
            .read()
            .await
            .values()
            .filter(|c| c.parent_container_id.as_ref() == Some(parent_container_id))
            .cloned()
            .collect_vec())
    }
}
