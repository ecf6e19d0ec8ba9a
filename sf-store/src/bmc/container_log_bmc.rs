use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use mockall::automock;
use sf_domain::{ContainerId, ContainerLogEntry, LogLevel};
use std::collections::HashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

#[automock]
#[async_trait]
pub trait ContainerLogBmcTrait: Send + Sync + Debug {
    async fn append(&self, ctx: &Ctx, container_id: &ContainerId, level: LogLevel, message: String, now: DateTime<Utc>) -> Result<()>;
    async fn load_logs(&self, ctx: &Ctx, container_id: &ContainerId, limit: usize, min_level: Option<LogLevel>) -> Result<Vec<ContainerLogEntry>>;
}

#[derive(Debug)]
pub struct DbContainerLogBmc {
    pub mm: DbModelManager,
}

#[derive(sqlx::FromRow)]
struct DbContainerLogRow {
    container_id: String,
    sequence: i64,
    level: String,
    message: String,
    created_at: DateTime<Utc>,
}

impl DbContainerLogRow {
    fn into_domain(self) -> ContainerLogEntry {
        ContainerLogEntry {
            container_id: ContainerId(self.container_id),
            sequence: self.sequence,
            level: LogLevel::from_str(&self.level).unwrap_or(LogLevel::Info),
            message: self.message,
            created_at: self.created_at,
        }
    }
}

#[async_trait]
impl ContainerLogBmcTrait for DbContainerLogBmc {
    async fn append(&self, _ctx: &Ctx, container_id: &ContainerId, level: LogLevel, message: String, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
insert into container_logs (container_id, sequence, level, message, created_at)
values (
    $1,
    coalesce((select max(sequence) from container_logs where container_id = $1), 0) + 1,
    $2, $3, $4
)
"#,
        )
        .bind(&container_id.0)
        .bind(level.to_string())
        .bind(message)
        .bind(now)
        .execute(self.mm.pool())
        .await?;

        Ok(())
    }

    async fn load_logs(&self, _ctx: &Ctx, container_id: &ContainerId, limit: usize, min_level: Option<LogLevel>) -> Result<Vec<ContainerLogEntry>> {
        let rows: Vec<DbContainerLogRow> = sqlx::query_as(
            r#"
select container_id, sequence, level, message, created_at
  from container_logs
 where container_id = $1
 order by sequence desc
 limit $2
"#,
        )
        .bind(&container_id.0)
        .bind(limit as i64)
        .fetch_all(self.mm.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| r.into_domain())
            .filter(|entry| min_level.map(|min| entry.level >= min).unwrap_or(true))
            .sorted_by_key(|entry| entry.sequence)
            .collect_vec())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryContainerLogBmc {
    logs: Arc<Mutex<HashMap<ContainerId, Vec<ContainerLogEntry>>>>,
}

impl InMemoryContainerLogBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerLogBmcTrait for InMemoryContainerLogBmc {
    async fn append(&self, _ctx: &Ctx, container_id: &ContainerId, level: LogLevel, message: String, now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.logs.lock().await;
        let entries = guard.entry(container_id.clone()).or_default();
        let sequence = entries.last().map(|e| e.sequence + 1).unwrap_or(1);
        entries.push(ContainerLogEntry {
            container_id: container_id.clone(),
            sequence,
            level,
            message,
            created_at: now,
        });
        Ok(())
    }

    async fn load_logs(&self, _ctx: &Ctx, container_id: &ContainerId, limit: usize, min_level: Option<LogLevel>) -> Result<Vec<ContainerLogEntry>> {
        let guard = self.logs.lock().await;
        let entries = guard.get(container_id).cloned().unwrap_or_default();
        let filtered = entries
            .into_iter()
            .filter(|entry| min_level.map(|min| entry.level >= min).unwrap_or(true))
            .collect_vec();
        // newest `limit` entries, oldest first
        let skip = filtered.len().saturating_sub(limit);
        Ok(filtered.into_iter().skip(skip).collect_vec())
    }
}
