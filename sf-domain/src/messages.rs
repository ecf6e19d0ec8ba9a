use crate::model::ShipSymbol;
use crate::pipeline::PipelineId;
use crate::task::TaskId;
use serde::{Deserialize, Serialize};

/// Worker-to-coordinator completion signal. Workers never mutate
/// coordinator state directly; the coordinator applies every transition
/// itself after receiving one of these.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub pipeline_id: Option<PipelineId>,
    pub ship_symbol: ShipSymbol,
    pub success: bool,
    pub retryable: bool,
    pub error: Option<String>,
}

impl TaskCompletion {
    pub fn success(task_id: TaskId, pipeline_id: Option<PipelineId>, ship_symbol: ShipSymbol) -> Self {
        Self {
            task_id,
            pipeline_id,
            ship_symbol,
            success: true,
            retryable: false,
            error: None,
        }
    }

    pub fn failure(task_id: TaskId, pipeline_id: Option<PipelineId>, ship_symbol: ShipSymbol, retryable: bool, error: impl Into<String>) -> Self {
        Self {
            task_id,
            pipeline_id,
            ship_symbol,
            success: false,
            retryable,
            error: Some(error.into()),
        }
    }
}
