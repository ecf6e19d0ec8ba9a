use crate::model::PlayerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    CargoPurchase,
    CargoSale,
    FactoryDelivery,
    Refuel,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationType {
    Manufacturing,
    Liquidation,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelatedEntity {
    pub entity_type: String,
    pub entity_id: String,
}

/// One signed ledger line. Negative amounts are money out.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub player_id: PlayerId,
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    pub description: String,
    pub related_entity: Option<RelatedEntity>,
    pub operation_type: OperationType,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}
