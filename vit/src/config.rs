//! ViT architecture configuration.
//!
//! The geometry values here (patch grid, token count) are derived and
//! validated rather than hard-coded: the saliency reshape in the pipeline
//! crate consumes [`ViTConfig::grid_side`] and cross-checks it against the
//! observed token count with [`grid_side_for_tokens`].

use crate::error::{Result, ViTError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_layer_norm_eps() -> f32 {
    1e-12
}

/// Architecture hyperparameters for the ViT backbone.
///
/// Stored as JSON next to the backbone weights so a checkpoint directory
/// is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViTConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

impl ViTConfig {
    /// ViT-Base/16 at 224x224, the architecture the task heads were
    /// trained against.
    pub fn vit_base() -> Self {
        Self {
            image_size: 224,
            patch_size: 16,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            intermediate_size: 3072,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0
            || self.patch_size == 0
            || self.hidden_size == 0
            || self.num_layers == 0
            || self.num_heads == 0
            || self.intermediate_size == 0
        {
            return Err(ViTError::Config(
                "all dimensions must be non-zero".to_string(),
            ));
        }
        if self.image_size % self.patch_size != 0 {
            return Err(ViTError::Config(format!(
                "image_size {} is not divisible by patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(ViTError::Config(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        Ok(())
    }

    /// Patches per image side.
    pub fn grid_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Spatial patch tokens per image.
    pub fn num_patches(&self) -> usize {
        self.grid_side() * self.grid_side()
    }

    /// Sequence length: patch tokens plus the CLS summary token.
    pub fn seq_len(&self) -> usize {
        self.num_patches() + 1
    }

    /// Per-head attention dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Flattened patch length fed to the patch embedding (3 channels).
    pub fn patch_dim(&self) -> usize {
        3 * self.patch_size * self.patch_size
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| ViTError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ViTConfig = serde_json::from_slice(&bytes)
            .map_err(|e| ViTError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| ViTError::Config(e.to_string()))?;
        fs::write(path, json).map_err(|source| ViTError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Recover the square grid side from a spatial token count.
///
/// Fails when the count is not a perfect square, which would mean the
/// token sequence cannot be folded back into a 2-D feature map.
pub fn grid_side_for_tokens(num_tokens: usize) -> Result<usize> {
    let side = (num_tokens as f64).sqrt().round() as usize;
    if side * side != num_tokens {
        return Err(ViTError::Config(format!(
            "{num_tokens} spatial tokens do not form a square grid"
        )));
    }
    Ok(side)
}
