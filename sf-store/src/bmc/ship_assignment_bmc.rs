use crate::error::StoreError;
use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use mockall::automock;
use sf_domain::{ContainerId, PlayerId, ReleaseReason, ShipAssignment, ShipSymbol};
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[automock]
#[async_trait]
pub trait ShipAssignmentBmcTrait: Send + Sync + Debug {
    /// The uniqueness-enforcing operation: fails with
    /// `StoreError::ActiveAssignmentExists` when the ship already has an
    /// active (unreleased) assignment for the player.
    async fn assign(&self, ctx: &Ctx, assignment: &ShipAssignment) -> Result<()>;
    async fn get_active_for_ship(&self, ctx: &Ctx, player_id: &PlayerId, ship_symbol: &ShipSymbol) -> Result<Option<ShipAssignment>>;
    async fn get_active_for_container(&self, ctx: &Ctx, container_id: &ContainerId) -> Result<Option<ShipAssignment>>;
    async fn load_active(&self, ctx: &Ctx, player_id: &PlayerId) -> Result<Vec<ShipAssignment>>;
    async fn release(&self, ctx: &Ctx, player_id: &PlayerId, ship_symbol: &ShipSymbol, reason: ReleaseReason, now: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug)]
pub struct DbShipAssignmentBmc {
    pub mm: DbModelManager,
}

#[derive(sqlx::FromRow)]
struct DbShipAssignmentRow {
    ship_symbol: String,
    player_id: String,
    container_id: String,
    assigned_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
    release_reason: Option<String>,
}

impl DbShipAssignmentRow {
    fn into_domain(self) -> ShipAssignment {
        ShipAssignment {
            ship_symbol: ShipSymbol(self.ship_symbol),
            player_id: PlayerId(self.player_id),
            container_id: ContainerId(self.container_id),
            assigned_at: self.assigned_at,
            released_at: self.released_at,
            release_reason: self
                .release_reason
                .and_then(|r| ReleaseReason::from_str(&r).ok()),
        }
    }
}

#[async_trait]
impl ShipAssignmentBmcTrait for DbShipAssignmentBmc {
    async fn assign(&self, _ctx: &Ctx, assignment: &ShipAssignment) -> Result<()> {
        // the partial unique index on (ship_symbol, player_id) where
        // released_at is null turns a race into a constraint violation
        let result = sqlx::query(
            r#"
insert into ship_assignments (ship_symbol, player_id, container_id, assigned_at)
values ($1, $2, $3, $4)
"#,
        )
        .bind(&assignment.ship_symbol.0)
        .bind(&assignment.player_id.0)
        .bind(&assignment.container_id.0)
        .bind(assignment.assigned_at)
        .execute(self.mm.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tracing::debug!("lost assignment race for ship {}", assignment.ship_symbol);
                Err(StoreError::ActiveAssignmentExists {
                    ship: assignment.ship_symbol.clone(),
                    player: assignment.player_id.clone(),
                }
                .into())
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn get_active_for_ship(&self, _ctx: &Ctx, player_id: &PlayerId, ship_symbol: &ShipSymbol) -> Result<Option<ShipAssignment>> {
        let row: Option<DbShipAssignmentRow> = sqlx::query_as(
            r#"
select ship_symbol, player_id, container_id, assigned_at, released_at, release_reason
  from ship_assignments
 where player_id = $1 and ship_symbol = $2 and released_at is null
"#,
        )
        .bind(&player_id.0)
        .bind(&ship_symbol.0)
        .fetch_optional(self.mm.pool())
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    async fn get_active_for_container(&self, _ctx: &Ctx, container_id: &ContainerId) -> Result<Option<ShipAssignment>> {
        let row: Option<DbShipAssignmentRow> = sqlx::query_as(
            r#"
select ship_symbol, player_id, container_id, assigned_at, released_at, release_reason
  from ship_assignments
 where container_id = $1 and released_at is null
"#,
        )
        .bind(&container_id.0)
        .fetch_optional(self.mm.pool())
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    async fn load_active(&self, _ctx: &Ctx, player_id: &PlayerId) -> Result<Vec<ShipAssignment>> {
        let rows: Vec<DbShipAssignmentRow> = sqlx::query_as(
            r#"
select ship_symbol, player_id, container_id, assigned_at, released_at, release_reason
  from ship_assignments
 where player_id = $1 and released_at is null
"#,
        )
        .bind(&player_id.0)
        .fetch_all(self.mm.pool())
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect_vec())
    }

    async fn release(&self, _ctx: &Ctx, player_id: &PlayerId, ship_symbol: &ShipSymbol, reason: ReleaseReason, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
update ship_assignments
   set released_at = $1, release_reason = $2
 where player_id = $3 and ship_symbol = $4 and released_at is null
"#,
        )
        .bind(now)
        .bind(reason.to_string())
        .bind(&player_id.0)
        .bind(&ship_symbol.0)
        .execute(self.mm.pool())
        .await?;

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryShipAssignmentBmc {
    // full history; the active view filters on released_at
    assignments: Arc<RwLock<Vec<ShipAssignment>>>,
}

impl InMemoryShipAssignmentBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShipAssignmentBmcTrait for InMemoryShipAssignmentBmc {
    async fn assign(&self, _ctx: &Ctx, assignment: &ShipAssignment) -> Result<()> {
        let mut guard = self.assignments.write().await;
        let already_active = guard
            .iter()
            .any(|a| a.is_active() && a.ship_symbol == assignment.ship_symbol && a.player_id == assignment.player_id);
        if already_active {
            return Err(StoreError::ActiveAssignmentExists {
                ship: assignment.ship_symbol.clone(),
                player: assignment.player_id.clone(),
            }
            .into());
        }
        guard.push(assignment.clone());
        Ok(())
    }

    async fn get_active_for_ship(&self, _ctx: &Ctx, player_id: &PlayerId, ship_symbol: &ShipSymbol) -> Result<Option<ShipAssignment>> {
        Ok(self
            .assignments
            .read()
            .await
            .iter()
            .find(|a| a.is_active() && &a.ship_symbol == ship_symbol && &a.player_id == player_id)
            .cloned())
    }

    async fn get_active_for_container(&self, _ctx: &Ctx, container_id: &ContainerId) -> Result<Option<ShipAssignment>> {
        Ok(self
            .assignments
            .read()
            .await
            .iter()
            .find(|a| a.is_active() && &a.container_id == container_id)
            .cloned())
    }

    async fn load_active(&self, _ctx: &Ctx, player_id: &PlayerId) -> Result<Vec<ShipAssignment>> {
        Ok(self
            .assignments
            .read()
            .await
            .iter()
            .filter(|a| a.is_active() && &a.player_id == player_id)
            .cloned()
            .collect_vec())
    }

    async fn release(&self, _ctx: &Ctx, player_id: &PlayerId, ship_symbol: &ShipSymbol, reason: ReleaseReason, now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.assignments.write().await;
        for assignment in guard.iter_mut() {
            if assignment.is_active() && &assignment.ship_symbol == ship_symbol && &assignment.player_id == player_id {
                assignment.release(reason, now);
            }
        }
        Ok(())
    }
}
