use sf_domain::{PlayerId, ShipSymbol};
use thiserror::Error;

/// Typed store failures that callers branch on; everything else travels as
/// plain `anyhow` context. Callers downcast with
/// `err.downcast_ref::<StoreError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("ship {ship} already has an active assignment for player {player}")]
    ActiveAssignmentExists { ship: ShipSymbol, player: PlayerId },
    #[error("version conflict updating {entity} {id} (expected version {expected})")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: i64,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}
