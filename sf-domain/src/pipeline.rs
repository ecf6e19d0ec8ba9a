use crate::error::TransitionError;
use crate::model::{PlayerId, SystemSymbol, TradeGoodSymbol, WaypointSymbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PipelineId(pub String);

impl PipelineId {
    pub fn generate() -> Self {
        PipelineId(format!("pipeline-{}", Uuid::new_v4()))
    }
}

impl Display for PipelineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

/// A durable plan to realize one manufacturing opportunity. Owns its tasks
/// and factory states.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ManufacturingPipeline {
    pub id: PipelineId,
    pub player_id: PlayerId,
    pub system_symbol: SystemSymbol,
    pub product_good: TradeGoodSymbol,
    pub sell_market: WaypointSymbol,
    pub status: PipelineStatus,
    pub total_cost: i64,
    pub total_revenue: i64,
    pub failure_reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ManufacturingPipeline {
    pub fn new(
        player_id: PlayerId,
        system_symbol: SystemSymbol,
        product_good: TradeGoodSymbol,
        sell_market: WaypointSymbol,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PipelineId::generate(),
            player_id,
            system_symbol,
            product_good,
            sell_market,
            status: PipelineStatus::Planning,
            total_cost: 0,
            total_revenue: 0,
            failure_reason: None,
            version: 0,
            created_at: now,
            last_progress_at: now,
            completed_at: None,
        }
    }

    pub fn net_profit(&self) -> i64 {
        self.total_revenue - self.total_cost
    }

    pub fn record_progress(&mut self, now: DateTime<Utc>) {
        self.last_progress_at = now;
    }

    fn transition_error(&self, to: PipelineStatus) -> TransitionError {
        TransitionError::InvalidPipelineTransition {
            pipeline_id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    pub fn start_executing(&mut self) -> Result<(), TransitionError> {
        match self.status {
            PipelineStatus::Planning => {
                self.status = PipelineStatus::Executing;
                Ok(())
            }
            _ => Err(self.transition_error(PipelineStatus::Executing)),
        }
    }

    pub fn complete(&mut self, total_cost: i64, total_revenue: i64, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            PipelineStatus::Planning | PipelineStatus::Executing => {
                self.status = PipelineStatus::Completed;
                self.total_cost = total_cost;
                self.total_revenue = total_revenue;
                self.completed_at = Some(now);
                self.last_progress_at = now;
                Ok(())
            }
            _ => Err(self.transition_error(PipelineStatus::Completed)),
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.transition_error(PipelineStatus::Failed));
        }
        self.status = PipelineStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.transition_error(PipelineStatus::Cancelled));
        }
        self.status = PipelineStatus::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }
}
