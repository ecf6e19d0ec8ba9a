use crate::model::{PlayerId, ShipSymbol};
use crate::pipeline::PipelineId;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use strum::{Display, EnumString};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ContainerId(pub String);

impl ContainerId {
    /// Opaque but readable: `<role>-<ship>-<suffix>`.
    pub fn generate(container_type: ContainerType, ship: Option<&ShipSymbol>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        match ship {
            Some(ship) => ContainerId(format!("{}-{}-{}", container_type, ship.0.to_lowercase(), suffix)),
            None => ContainerId(format!("{}-{}", container_type, suffix)),
        }
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContainerType {
    ManufacturingCoordinator,
    ManufacturingTaskWorker,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ContainerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Completed | ContainerStatus::Failed | ContainerStatus::Cancelled
        )
    }
}

/// Free-form reference data attached to a container row; the task worker
/// variant carries the task it runs.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ContainerMetadata {
    pub task_id: Option<TaskId>,
    pub pipeline_id: Option<PipelineId>,
    pub ship_symbol: Option<ShipSymbol>,
    pub system_symbol: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkerContainer {
    pub container_id: ContainerId,
    pub player_id: PlayerId,
    pub parent_container_id: Option<ContainerId>,
    pub container_type: ContainerType,
    pub status: ContainerStatus,
    pub metadata: ContainerMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exit_reason: Option<String>,
    pub restart_count: u32,
}

impl WorkerContainer {
    pub fn new(
        container_id: ContainerId,
        player_id: PlayerId,
        parent_container_id: Option<ContainerId>,
        container_type: ContainerType,
        metadata: ContainerMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            container_id,
            player_id,
            parent_container_id,
            container_type,
            status: ContainerStatus::Created,
            metadata,
            created_at: now,
            updated_at: now,
            exit_reason: None,
            restart_count: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContainerLogEntry {
    pub container_id: ContainerId,
    pub sequence: i64,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_encodes_role_and_ship() {
        let id = ContainerId::generate(
            ContainerType::ManufacturingTaskWorker,
            Some(&ShipSymbol("SHIP-1".to_string())),
        );
        assert!(id.0.starts_with("manufacturing_task_worker-ship-1-"));

        let other = ContainerId::generate(
            ContainerType::ManufacturingTaskWorker,
            Some(&ShipSymbol("SHIP-1".to_string())),
        );
        assert_ne!(id, other);
    }
}
