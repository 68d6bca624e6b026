//! Result types returned by the orchestrator.

use serde::Serialize;
use std::path::PathBuf;

/// Decoded output of one task head.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Prediction {
    /// Raw scalar from a regression head.
    Regression { value: f32 },
    /// Arg-max class with its softmax probability.
    Classification { class: usize, probability: f32 },
}

/// A fully completed task: prediction plus its on-disk heatmap. Tasks
/// are all-or-nothing, a report never carries one without the other.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub prediction: Prediction,
    pub attention_map: PathBuf,
}

/// Why a task was omitted from a profile run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// No checkpoint deployed for this task.
    WeightsNotFound,
    /// Checkpoint present but unloadable.
    ModelLoad { detail: String },
    /// Forward pass rejected the input.
    Inference { detail: String },
    /// Heatmap generation failed.
    Explainability { detail: String },
    /// The caller's deadline expired before this task started.
    DeadlineExceeded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedTask {
    pub task: String,
    pub reason: SkipReason,
}

/// Outcome of a full profile run. `completed` follows task registry
/// order; skipped tasks are reported explicitly rather than silently
/// dropped, so callers can distinguish "negative finding" from "not
/// evaluated".
#[derive(Debug, Clone, Serialize, Default)]
pub struct ProfileReport {
    pub completed: Vec<TaskReport>,
    pub skipped: Vec<SkippedTask>,
}

impl ProfileReport {
    pub fn get(&self, task: &str) -> Option<&TaskReport> {
        self.completed.iter().find(|report| report.task == task)
    }

    pub fn is_skipped(&self, task: &str) -> bool {
        self.skipped.iter().any(|skip| skip.task == task)
    }
}
