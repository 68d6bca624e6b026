use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ViTError>;

#[derive(Debug, Error)]
pub enum ViTError {
    #[error("Invalid ViT configuration: {0}")]
    Config(String),

    #[error("Failed to read weights file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed safetensors data: {0}")]
    Format(String),

    #[error("Missing tensor '{0}' in weights file")]
    MissingTensor(String),

    #[error("Tensor '{name}' has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("Tensor '{name}' has dtype {got}, expected F32")]
    UnsupportedDtype { name: String, got: String },

    #[error("Input tensor has shape {got:?}, expected {expected:?}")]
    InputShape {
        got: Vec<usize>,
        expected: Vec<usize>,
    },
}
