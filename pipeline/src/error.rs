use retina_model_cache::ModelCacheError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input image could not be decoded. Fatal for the whole profile:
    /// the serving path never substitutes a blank image for unreadable
    /// input.
    #[error("Failed to decode image {path}: {reason}")]
    ImageDecode { path: PathBuf, reason: String },

    /// Propagated cache failure. Only the backbone variant is fatal at
    /// the profile level; per-task variants turn into skips.
    #[error(transparent)]
    Cache(#[from] ModelCacheError),

    /// The forward pass rejected the input for one task.
    #[error("Inference failed for task '{task}': {reason}")]
    Inference { task: String, reason: String },

    /// Heatmap generation failed for one task.
    #[error("Explainability failed: {0}")]
    Explainability(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
