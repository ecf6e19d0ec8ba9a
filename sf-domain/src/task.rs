use crate::error::TransitionError;
use crate::model::{PlayerId, ShipSymbol, SupplyLevel, TradeGoodSymbol, WaypointSymbol};
use crate::pipeline::PipelineId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        TaskId(format!("task-{}", Uuid::new_v4()))
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    AcquireDeliver,
    CollectSell,
    Liquidate,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Executing)
    }
}

pub const DEFAULT_TASK_PRIORITY: i32 = 10;
pub const LIQUIDATE_TASK_PRIORITY: i32 = 50;

/// The smallest atomic unit of ship work. Always bound to exactly one ship
/// while it executes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ManufacturingTask {
    pub id: TaskId,
    /// Standalone rescue tasks (orphaned-cargo liquidation) have no
    /// owning pipeline.
    pub pipeline_id: Option<PipelineId>,
    pub player_id: PlayerId,
    pub task_type: TaskType,
    pub good: TradeGoodSymbol,
    /// Target units; 0 means open-ended (buy as much as fits).
    pub quantity: u32,
    pub actual_quantity: u32,
    pub source_market: Option<WaypointSymbol>,
    pub factory_symbol: Option<WaypointSymbol>,
    pub target_market: Option<WaypointSymbol>,
    pub depends_on: HashSet<TaskId>,
    pub priority: i32,
    pub status: TaskStatus,
    pub assigned_ship: Option<ShipSymbol>,
    pub total_cost: i64,
    pub total_revenue: i64,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ManufacturingTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: PipelineId,
        player_id: PlayerId,
        task_type: TaskType,
        good: TradeGoodSymbol,
        quantity: u32,
        source_market: Option<WaypointSymbol>,
        factory_symbol: Option<WaypointSymbol>,
        target_market: Option<WaypointSymbol>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            pipeline_id: Some(pipeline_id),
            player_id,
            task_type,
            good,
            quantity,
            actual_quantity: 0,
            source_market,
            factory_symbol,
            target_market,
            depends_on: HashSet::new(),
            priority: DEFAULT_TASK_PRIORITY,
            status: TaskStatus::Pending,
            assigned_ship: None,
            total_cost: 0,
            total_revenue: 0,
            error_message: None,
            retry_count: 0,
            version: 0,
            created_at: now,
            ready_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// A rescue task with no owning pipeline, pre-bound to the ship that
    /// holds the cargo.
    pub fn standalone_liquidate(
        player_id: PlayerId,
        good: TradeGoodSymbol,
        target_market: WaypointSymbol,
        ship: ShipSymbol,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            pipeline_id: None,
            player_id,
            task_type: TaskType::Liquidate,
            good,
            quantity: 0,
            actual_quantity: 0,
            source_market: None,
            factory_symbol: None,
            target_market: Some(target_market),
            depends_on: HashSet::new(),
            priority: LIQUIDATE_TASK_PRIORITY,
            status: TaskStatus::Pending,
            assigned_ship: Some(ship),
            total_cost: 0,
            total_revenue: 0,
            error_message: None,
            retry_count: 0,
            version: 0,
            created_at: now,
            ready_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn net_profit(&self) -> i64 {
        self.total_revenue - self.total_cost
    }

    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }

    fn transition_error(&self, to: TaskStatus) -> TransitionError {
        TransitionError::InvalidTaskTransition {
            task_id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    pub fn mark_ready(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Ready;
                self.ready_at = Some(now);
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Ready)),
        }
    }

    /// Inverse of `mark_ready`; used when a factory drifts out of
    /// collectable supply before a ship was found.
    pub fn demote_to_pending(&mut self) -> Result<(), TransitionError> {
        match self.status {
            TaskStatus::Ready => {
                self.status = TaskStatus::Pending;
                self.ready_at = None;
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Pending)),
        }
    }

    pub fn assign(&mut self, ship: ShipSymbol) -> Result<(), TransitionError> {
        match self.status {
            TaskStatus::Ready => {
                self.status = TaskStatus::Assigned;
                self.assigned_ship = Some(ship);
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Assigned)),
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            TaskStatus::Assigned => {
                self.status = TaskStatus::Executing;
                self.started_at = Some(now);
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Executing)),
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            TaskStatus::Executing => {
                self.status = TaskStatus::Completed;
                self.completed_at = Some(now);
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Completed)),
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.transition_error(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.error_message = Some(reason.into());
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.transition_error(TaskStatus::Cancelled));
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Shutdown path: the worker observed cancellation mid-execution and
    /// hands the task back as it found it. Recovery turns it into
    /// `Pending` on the next boot.
    pub fn revert_to_assigned(&mut self) -> Result<(), TransitionError> {
        match self.status {
            TaskStatus::Executing => {
                self.status = TaskStatus::Assigned;
                self.started_at = None;
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Assigned)),
        }
    }

    /// Puts an `Assigned`/`Executing` task back into the pool after its
    /// worker died or returned a retryable error.
    pub fn reset_to_pending(&mut self) -> Result<(), TransitionError> {
        match self.status {
            TaskStatus::Assigned | TaskStatus::Executing => {
                self.status = TaskStatus::Pending;
                self.assigned_ship = None;
                self.ready_at = None;
                self.started_at = None;
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Pending)),
        }
    }
}

/// How many units a single purchase round may take from a market without
/// draining it, as a fraction of the market's trade volume.
pub fn supply_aware_limit(supply: Option<SupplyLevel>, trade_volume: i32) -> u32 {
    let multiplier = match supply {
        Some(SupplyLevel::Abundant) => 0.80,
        Some(SupplyLevel::High) => 0.60,
        Some(SupplyLevel::Moderate) | None => 0.40,
        Some(SupplyLevel::Limited) => 0.20,
        Some(SupplyLevel::Scarce) => 0.10,
    };
    (trade_volume.max(0) as f64 * multiplier).floor() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task() -> ManufacturingTask {
        ManufacturingTask::new(
            PipelineId::generate(),
            PlayerId("player-1".to_string()),
            TaskType::AcquireDeliver,
            TradeGoodSymbol::new("COPPER"),
            100,
            Some(WaypointSymbol("X1-A-M2".to_string())),
            Some(WaypointSymbol("X1-A-F1".to_string())),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn happy_path_transitions() {
        let now = Utc::now();
        let mut task = test_task();

        task.mark_ready(now).unwrap();
        assert_eq!(task.status, TaskStatus::Ready);

        task.assign(ShipSymbol("SHIP-1".to_string())).unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);

        task.start(now).unwrap();
        task.complete(now).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn complete_requires_executing() {
        let now = Utc::now();
        let mut task = test_task();
        let err = task.complete(now).unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTaskTransition { .. }));
    }

    #[test]
    fn terminal_statuses_are_absorbing() {
        let now = Utc::now();
        let mut task = test_task();
        task.mark_ready(now).unwrap();
        task.assign(ShipSymbol("SHIP-1".to_string())).unwrap();
        task.start(now).unwrap();
        task.complete(now).unwrap();

        assert!(task.cancel(now).is_err());
        assert!(task.fail("boom", now).is_err());
    }

    #[test]
    fn cancel_reachable_from_any_non_terminal_state() {
        let now = Utc::now();

        let mut pending = test_task();
        assert!(pending.cancel(now).is_ok());

        let mut executing = test_task();
        executing.mark_ready(now).unwrap();
        executing.assign(ShipSymbol("SHIP-1".to_string())).unwrap();
        executing.start(now).unwrap();
        assert!(executing.cancel(now).is_ok());
    }

    #[test]
    fn reset_clears_assignment() {
        let now = Utc::now();
        let mut task = test_task();
        task.mark_ready(now).unwrap();
        task.assign(ShipSymbol("SHIP-1".to_string())).unwrap();

        task.reset_to_pending().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_ship, None);
    }

    #[test]
    fn supply_aware_limit_boundaries() {
        assert_eq!(supply_aware_limit(Some(SupplyLevel::Scarce), 100), 10);
        assert_eq!(supply_aware_limit(Some(SupplyLevel::Limited), 100), 20);
        assert_eq!(supply_aware_limit(Some(SupplyLevel::Moderate), 100), 40);
        assert_eq!(supply_aware_limit(Some(SupplyLevel::High), 100), 60);
        assert_eq!(supply_aware_limit(Some(SupplyLevel::Abundant), 100), 80);
        assert_eq!(supply_aware_limit(None, 100), 40);
        assert_eq!(supply_aware_limit(Some(SupplyLevel::High), 0), 0);
    }
}
