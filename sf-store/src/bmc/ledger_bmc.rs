use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use itertools::Itertools;
use mockall::automock;
use sf_domain::{LedgerTransaction, PlayerId};
use sqlx::types::Json;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::Mutex;

#[automock]
#[async_trait]
pub trait LedgerBmcTrait: Send + Sync + Debug {
    async fn record_transaction(&self, ctx: &Ctx, transaction: &LedgerTransaction) -> Result<()>;
    /// Sum of signed amounts; negative amounts are money out.
    async fn balance(&self, ctx: &Ctx, player_id: &PlayerId) -> Result<i64>;
    async fn load_transactions(&self, ctx: &Ctx, player_id: &PlayerId, limit: usize) -> Result<Vec<LedgerTransaction>>;
}

#[derive(Debug)]
pub struct DbLedgerBmc {
    pub mm: DbModelManager,
}

#[derive(sqlx::FromRow)]
struct DbTransactionRow {
    payload: Json<LedgerTransaction>,
}

#[derive(sqlx::FromRow)]
struct DbBalanceRow {
    balance: Option<i64>,
}

#[async_trait]
impl LedgerBmcTrait for DbLedgerBmc {
    async fn record_transaction(&self, _ctx: &Ctx, transaction: &LedgerTransaction) -> Result<()> {
        sqlx::query(
            r#"
insert into transactions (player_id, amount, created_at, payload)
values ($1, $2, $3, $4)
"#,
        )
        .bind(&transaction.player_id.0)
        .bind(transaction.amount)
        .bind(transaction.created_at)
        .bind(Json(transaction.clone()))
        .execute(self.mm.pool())
        .await?;

        Ok(())
    }

    async fn balance(&self, _ctx: &Ctx, player_id: &PlayerId) -> Result<i64> {
        let row: DbBalanceRow = sqlx::query_as(
            r#"
select sum(amount)::bigint as balance from transactions where player_id = $1
"#,
        )
        .bind(&player_id.0)
        .fetch_one(self.mm.pool())
        .await?;

        Ok(row.balance.unwrap_or(0))
    }

    async fn load_transactions(&self, _ctx: &Ctx, player_id: &PlayerId, limit: usize) -> Result<Vec<LedgerTransaction>> {
        let rows: Vec<DbTransactionRow> = sqlx::query_as(
            r#"
select payload from transactions
 where player_id = $1
 order by created_at desc
 limit $2
"#,
        )
        .bind(&player_id.0)
        .bind(limit as i64)
        .fetch_all(self.mm.pool())
        .await?;

        Ok(rows.into_iter().map(|r| r.payload.0).collect_vec())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedgerBmc {
    transactions: Arc<Mutex<Vec<LedgerTransaction>>>,
}

impl InMemoryLedgerBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerBmcTrait for InMemoryLedgerBmc {
    async fn record_transaction(&self, _ctx: &Ctx, transaction: &LedgerTransaction) -> Result<()> {
        let mut guard = self.transactions.lock().await;
        guard.push(transaction.clone());
        Ok(())
    }

    async fn balance(&self, _ctx: &Ctx, player_id: &PlayerId) -> Result<i64> {
        let guard = self.transactions.lock().await;
        Ok(guard
            .iter()
            .filter(|t| &t.player_id == player_id)
            .map(|t| t.amount)
            .sum())
    }

    async fn load_transactions(&self, _ctx: &Ctx, player_id: &PlayerId, limit: usize) -> Result<Vec<LedgerTransaction>> {
        let guard = self.transactions.lock().await;
        Ok(guard
            .iter()
            .filter(|t| &t.player_id == player_id)
            .rev()
            .take(limit)
            .cloned()
            .collect_vec())
    }
}
