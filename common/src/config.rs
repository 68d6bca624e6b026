//! Engine configuration.
//!
//! The engine is a library: callers construct an [`EngineConfig`] and hand
//! it in, there is no global configuration state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Compute device the caller would like inference to run on.
///
/// This build executes on CPU; an accelerator preference is honored by
/// falling back with a log line rather than failing, so the same config
/// works across deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Pick the best available device.
    #[default]
    Auto,
    /// Force CPU execution.
    Cpu,
    /// Prefer an accelerator, fall back to CPU when none is available.
    Accelerator,
}

/// Device actually selected for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
}

impl DevicePreference {
    /// Resolve the preference against what this build supports.
    pub fn resolve(self) -> Device {
        match self {
            DevicePreference::Cpu | DevicePreference::Auto => Device::Cpu,
            DevicePreference::Accelerator => {
                log::warn!("accelerator requested but this build is CPU-only, falling back to CPU");
                Device::Cpu
            }
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Configuration for the inference engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the backbone weights/config and one head
    /// checkpoint per task.
    pub checkpoint_dir: PathBuf,
    /// Directory heatmap artifacts are written to (created on demand).
    pub output_dir: PathBuf,
    /// Requested compute device.
    #[serde(default)]
    pub device: DevicePreference,
}

impl EngineConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            output_dir: output_dir.into(),
            device: DevicePreference::Auto,
        }
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }
}
