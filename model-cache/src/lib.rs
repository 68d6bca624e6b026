//! Task registry, classifier heads, and the lazy model cache.
//!
//! This crate sits between the backbone (`retina-vit`) and the inference
//! pipeline: it knows which clinical tasks exist, how their heads are
//! stored on disk, and keeps loaded models resident so a full profile run
//! pays checkpoint I/O at most once per task.

pub mod cache;
pub mod error;
pub mod head;
pub mod tasks;

pub use cache::{LoadedModel, ModelCache};
pub use error::{ModelCacheError, Result};
pub use head::{ClassifierHead, HIDDEN_DIM};
pub use tasks::{task_names, task_spec, TaskKind, TaskSpec, TASKS};
