use crate::pipeline::{PipelineId, PipelineStatus};
use crate::task::{TaskId, TaskStatus};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task {task_id} cannot transition {from} -> {to}")]
    InvalidTaskTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("pipeline {pipeline_id} cannot transition {from} -> {to}")]
    InvalidPipelineTransition {
        pipeline_id: PipelineId,
        from: PipelineStatus,
        to: PipelineStatus,
    },
}
