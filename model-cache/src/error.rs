use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelCacheError>;

#[derive(Debug, Error)]
pub enum ModelCacheError {
    /// Unknown task name: a programmer error, not a runtime condition.
    #[error("Unknown task: {0}")]
    InvalidTask(String),

    /// The shared backbone could not be constructed. Fatal for every task.
    #[error("Backbone unavailable: {0}")]
    BackboneUnavailable(String),

    /// No checkpoint on disk for this task. Expected while a task is not
    /// yet deployed; callers skip the task rather than abort.
    #[error("Model weights not found for task '{task}' at {path}")]
    WeightsNotFound { task: String, path: PathBuf },

    /// Checkpoint exists but could not be loaded (corrupt file, shape or
    /// dtype mismatch). Unexpected; logged at higher severity upstream.
    #[error("Failed to load model for task '{task}': {reason}")]
    ModelLoad { task: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
