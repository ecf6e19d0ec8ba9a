use crate::error::StoreError;
use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use itertools::Itertools;
use mockall::automock;
use sf_domain::{FactoryState, PipelineId, TradeGoodSymbol, WaypointSymbol};
use sqlx::types::Json;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

#[automock]
#[async_trait]
pub trait FactoryStateBmcTrait: Send + Sync + Debug {
    async fn upsert_factory_state(&self, ctx: &Ctx, state: &FactoryState) -> Result<()>;
    /// Compare-and-set on `version`; FactoryStateManager and SupplyMonitor
    /// both write through this.
    async fn update_factory_state(&self, ctx: &Ctx, state: &FactoryState) -> Result<FactoryState>;
    async fn get_factory_state(
        &self,
        ctx: &Ctx,
        pipeline_id: &PipelineId,
        factory_symbol: &WaypointSymbol,
        output_good: &TradeGoodSymbol,
    ) -> Result<Option<FactoryState>>;
    async fn load_for_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Vec<FactoryState>>;
    async fn load_for_pipelines(&self, ctx: &Ctx, pipeline_ids: &[PipelineId]) -> Result<Vec<FactoryState>>;
    async fn delete_for_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<()>;
}

#[derive(Debug)]
pub struct DbFactoryStateBmc {
    pub mm: DbModelManager,
}

#[derive(sqlx::FromRow)]
struct DbFactoryStateRow {
    payload: Json<FactoryState>,
}

#[async_trait]
impl FactoryStateBmcTrait for DbFactoryStateBmc {
    async fn upsert_factory_state(&self, _ctx: &Ctx, state: &FactoryState) -> Result<()> {
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
        .execute(self.mm.pool())
        .await?;

        Ok(())
    }

    async fn update_factory_state(&self, _ctx: &Ctx, state: &FactoryState) -> Result<FactoryState> {
        let mut updated = state.clone();
        updated.version += 1;

        let result = sqlx::query(
            r#"
update factory_states
   set payload = $1, version = $2
 where pipeline_id = $3 and factory_symbol = $4 and output_good = $5 and version = $6
"#,
        )
        .bind(Json(updated.clone()))
        .bind(updated.version)
        .bind(&state.pipeline_id.0)
        .bind(&state.factory_symbol.0)
        .bind(&state.output_good.0)
        .bind(state.version)
        .execute(self.mm.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                entity: "factory_state",
                id: format!("{}/{}/{}", state.pipeline_id, state.factory_symbol, state.output_good),
                expected: state.version,
            }
            .into());
        }

        Ok(updated)
    }

    async fn get_factory_state(
        &self,
        _ctx: &Ctx,
        pipeline_id: &PipelineId,
        factory_symbol: &WaypointSymbol,
        output_good: &TradeGoodSymbol,
    ) -> Result<Option<FactoryState>> {
        let row: Option<DbFactoryStateRow> = sqlx::query_as(
            r#"
select payload from factory_states
 where pipeline_id = $1 and factory_symbol = $2 and output_good = $3
"#,
        )
        .bind(&pipeline_id.0)
        .bind(&factory_symbol.0)
        .bind(&output_good.0)
        .fetch_optional(self.mm.pool())
        .await?;

        Ok(row.map(|r| r.payload.0))
    }

    async fn load_for_pipeline(&self, _ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Vec<FactoryState>> {
        let rows: Vec<DbFactoryStateRow> = sqlx::query_as(
            r#"
select payload from factory_states where pipeline_id = $1
"#,
        )
        .bind(&pipeline_id.0)
        .fetch_all(self.mm.pool())
        .await?;

        Ok(rows.into_iter().map(|r| r.payload.0).collect_vec())
    }

    async fn load_for_pipelines(&self, _ctx: &Ctx, pipeline_ids: &[PipelineId]) -> Result<Vec<FactoryState>> {
        let ids = pipeline_ids.iter().map(|id| id.0.clone()).collect_vec();
        let rows: Vec<DbFactoryStateRow> = sqlx::query_as(
            r#"
select payload from factory_states where pipeline_id = any($1)
"#,
        )
        .bind(&ids)
        .fetch_all(self.mm.pool())
        .await?;

        Ok(rows.into_iter().map(|r| r.payload.0).collect_vec())
    }

    async fn delete_for_pipeline(&self, _ctx: &Ctx, pipeline_id: &PipelineId) -> Result<()> {
        sqlx::query(
            r#"
delete from factory_states where pipeline_id = $1
"#,
        )
        .bind(&pipeline_id.0)
        .execute(self.mm.pool())
        .await?;

        Ok(())
    }
}

type FactoryKey = (PipelineId, WaypointSymbol, TradeGoodSymbol);

#[derive(Debug, Default)]
pub struct InMemoryFactoryStateBmc {
    states: Arc<RwLock<HashMap<FactoryKey, FactoryState>>>,
}

impl InMemoryFactoryStateBmc {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(state: &FactoryState) -> FactoryKey {
        (state.pipeline_id.clone(), state.factory_symbol.clone(), state.output_good.clone())
    }
}

#[async_trait]
impl FactoryStateBmcTrait for InMemoryFactoryStateBmc {
    async fn upsert_factory_state(&self, _ctx: &Ctx, state: &FactoryState) -> Result<()> {
        let mut guard = self.states.write().await;
        guard.insert(Self::key(state), state.clone());
        Ok(())
    }

    async fn update_factory_state(&self, _ctx: &Ctx, state: &FactoryState) -> Result<FactoryState> {
        let mut guard = self.states.write().await;
        let key = Self::key(state);
        match guard.get(&key) {
            Some(stored) if stored.version == state.version => {
                let mut updated = state.clone();
                updated.version += 1;
                guard.insert(key, updated.clone());
                Ok(updated)
            }
            Some(_) => Err(StoreError::VersionConflict {
                entity: "factory_state",
                id: format!("{}/{}/{}", state.pipeline_id, state.factory_symbol, state.output_good),
                expected: state.version,
            }
            .into()),
            None => Err(StoreError::NotFound {
                entity: "factory_state",
                id: format!("{}/{}/{}", state.pipeline_id, state.factory_symbol, state.output_good),
            }
            .into()),
        }
    }

    async fn get_factory_state(
        &self,
        _ctx: &Ctx,
        pipeline_id: &PipelineId,
        factory_symbol: &WaypointSymbol,
        output_good: &TradeGoodSymbol,
    ) -> Result<Option<FactoryState>> {
        Ok(self
            .states
            .read()
            .await
            .get(&(pipeline_id.clone(), factory_symbol.clone(), output_good.clone()))
            .cloned())
    }

    async fn load_for_pipeline(&self, _ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Vec<FactoryState>> {
        Ok(self
            .states
            .read()
            .await
            .values()
            .filter(|s| &s.pipeline_id == pipeline_id)
            .cloned()
            .collect_vec())
    }

    async fn load_for_pipelines(&self, _ctx: &Ctx, pipeline_ids: &[PipelineId]) -> Result<Vec<FactoryState>> {
        Ok(self
            .states
            .read()
            .await
            .values()
            .filter(|s| pipeline_ids.contains(&s.pipeline_id))
            .cloned()
            .collect_vec())
    }

    async fn delete_for_pipeline(&self, _ctx: &Ctx, pipeline_id: &PipelineId) -> Result<()> {
        let mut guard = self.states.write().await;
        guard.retain(|_, s| &s.pipeline_id != pipeline_id);
        Ok(())
    }
}
