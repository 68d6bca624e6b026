//! Multi-task retinal inference pipeline.
//!
//! Ties the lower layers together: deterministic preprocessing, the
//! shared-backbone forward pass, per-task output decoding, Grad-CAM++
//! heatmap artifacts, and the full-profile orchestrator with per-task
//! failure isolation.
//!
//! Everything here is synchronous and CPU-bound. Callers serving
//! concurrent requests should run profiles on a worker pool rather than
//! a request-handling thread.

pub mod error;
pub mod gradcam;
pub mod infer;
pub mod preprocess;
pub mod profile;
pub mod types;

pub use error::{PipelineError, Result};
pub use infer::{decode, predict};
pub use preprocess::{preprocess, PreprocessedImage};
pub use profile::{run_full_profile, run_profile_with_deadline};
pub use types::{Prediction, ProfileReport, SkipReason, SkippedTask, TaskReport};
