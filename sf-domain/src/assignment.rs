use crate::container::ContainerId;
use crate::model::{PlayerId, ShipSymbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReleaseReason {
    WorkerCompleted,
    WorkerFailed,
    WorkerStartFailed,
    CoordinatorShutdown,
    RecoveryReset,
}

/// A durable exclusive lease of one ship to one worker container. The
/// repository's uniqueness constraint on `(ship, player)` with no release
/// timestamp is the only guard on ship ownership.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ShipAssignment {
    pub ship_symbol: ShipSymbol,
    pub player_id: PlayerId,
    pub container_id: ContainerId,
    pub assigned_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub release_reason: Option<ReleaseReason>,
}

impl ShipAssignment {
    pub fn new(ship_symbol: ShipSymbol, player_id: PlayerId, container_id: ContainerId, now: DateTime<Utc>) -> Self {
        Self {
            ship_symbol,
            player_id,
            container_id,
            assigned_at: now,
            released_at: None,
            release_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }

    pub fn release(&mut self, reason: ReleaseReason, now: DateTime<Utc>) {
        if self.is_active() {
            self.released_at = Some(now);
            self.release_reason = Some(reason);
        }
    }
}
