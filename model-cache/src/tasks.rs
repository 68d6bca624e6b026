//! The clinical task registry.
//!
//! Pure, immutable data: an ordered table of the ten biomarker tasks the
//! engine serves. Iteration order is definition order, and downstream
//! result rendering relies on it, so new tasks are appended, never
//! inserted.

use crate::error::{ModelCacheError, Result};
use serde::{Deserialize, Serialize};

/// Output semantics of a task head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Continuous scalar output (e.g. age in years).
    Regression,
    /// Two-class softmax output.
    Binary,
    /// N-class softmax output.
    Multiclass,
}

impl TaskKind {
    pub fn is_classification(self) -> bool {
        matches!(self, TaskKind::Binary | TaskKind::Multiclass)
    }
}

/// Immutable definition of one clinical task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskSpec {
    /// Task identity; also keys the checkpoint file name.
    pub name: &'static str,
    pub kind: TaskKind,
    /// Width of the head's final linear layer.
    pub output_dim: usize,
    /// Label column in the source dataset the head was trained against.
    pub source_column: &'static str,
}

/// The ten-task registry, in serving order.
pub const TASKS: [TaskSpec; 10] = [
    TaskSpec { name: "Age", kind: TaskKind::Regression, output_dim: 1, source_column: "age" },
    TaskSpec { name: "Gender", kind: TaskKind::Binary, output_dim: 2, source_column: "sex" },
    TaskSpec { name: "Diabetes", kind: TaskKind::Binary, output_dim: 2, source_column: "diabetes" },
    TaskSpec { name: "ICDR", kind: TaskKind::Multiclass, output_dim: 5, source_column: "final_icdr" },
    TaskSpec { name: "Edema", kind: TaskKind::Binary, output_dim: 2, source_column: "final_edema" },
    TaskSpec { name: "Hypertension", kind: TaskKind::Binary, output_dim: 2, source_column: "systemic_hypertension" },
    TaskSpec { name: "Cardiovascular_Risk", kind: TaskKind::Binary, output_dim: 2, source_column: "vascular_disease" },
    TaskSpec { name: "AMI", kind: TaskKind::Binary, output_dim: 2, source_column: "acute_myocardial_infarction" },
    TaskSpec { name: "Neuropathy", kind: TaskKind::Binary, output_dim: 2, source_column: "neuropathy" },
    TaskSpec { name: "Nephropathy", kind: TaskKind::Binary, output_dim: 2, source_column: "nephropathy" },
];

/// Look up a task by name.
pub fn task_spec(name: &str) -> Result<&'static TaskSpec> {
    TASKS
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| ModelCacheError::InvalidTask(name.to_string()))
}

/// All task names, registry order.
pub fn task_names() -> impl Iterator<Item = &'static str> {
    TASKS.iter().map(|spec| spec.name)
}
