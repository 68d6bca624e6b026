//! Task-specific classifier heads.
//!
//! A head maps pooled backbone features through one hidden projection to
//! the task's output width: `[features] -> hidden 256 -> output_dim`.
//! Heads are tiny compared to the backbone, which is why one backbone can
//! be shared across all ten tasks while heads load per task.

use crate::error::{ModelCacheError, Result};
use crate::tasks::TaskSpec;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use retina_vit::weights::{read_array1, read_array2, tensor_entry1, tensor_entry2};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::fs;
use std::path::Path;

/// Hidden projection width, fixed by the training recipe.
pub const HIDDEN_DIM: usize = 256;

/// Trained parameters of one task head. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    w_hidden: Array2<f32>,
    b_hidden: Array1<f32>,
    w_out: Array2<f32>,
    b_out: Array1<f32>,
}

impl ClassifierHead {
    /// Load a head checkpoint and shape-check it against the task spec.
    ///
    /// A missing file is the expected "task not yet deployed" signal and
    /// maps to [`ModelCacheError::WeightsNotFound`]; everything else
    /// wrong with the file is a [`ModelCacheError::ModelLoad`].
    pub fn load(task: &TaskSpec, feature_dim: usize, path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ModelCacheError::WeightsNotFound {
                task: task.name.to_string(),
                path: path.to_path_buf(),
            });
        }
        let bytes = fs::read(path)?;
        let load_err = |e: retina_vit::ViTError| ModelCacheError::ModelLoad {
            task: task.name.to_string(),
            reason: e.to_string(),
        };
        let st = SafeTensors::deserialize(&bytes).map_err(|e| ModelCacheError::ModelLoad {
            task: task.name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            w_hidden: read_array2(&st, "hidden.weight", feature_dim, HIDDEN_DIM)
                .map_err(load_err)?,
            b_hidden: read_array1(&st, "hidden.bias", HIDDEN_DIM).map_err(load_err)?,
            w_out: read_array2(&st, "classifier.weight", HIDDEN_DIM, task.output_dim)
                .map_err(load_err)?,
            b_out: read_array1(&st, "classifier.bias", task.output_dim).map_err(load_err)?,
        })
    }

    /// Serialize to a safetensors checkpoint (overwrites).
    pub fn save(&self, task: &TaskSpec, path: &Path) -> Result<()> {
        let mut raw: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        tensor_entry2(&mut raw, "hidden.weight", &self.w_hidden);
        tensor_entry1(&mut raw, "hidden.bias", &self.b_hidden);
        tensor_entry2(&mut raw, "classifier.weight", &self.w_out);
        tensor_entry1(&mut raw, "classifier.bias", &self.b_out);

        let mut views: Vec<(String, TensorView<'_>)> = Vec::with_capacity(raw.len());
        for (name, shape, data) in &raw {
            let view = TensorView::new(Dtype::F32, shape.clone(), data).map_err(|e| {
                ModelCacheError::ModelLoad {
                    task: task.name.to_string(),
                    reason: e.to_string(),
                }
            })?;
            views.push((name.clone(), view));
        }
        safetensors::serialize_to_file(views, &None, path).map_err(|e| {
            ModelCacheError::ModelLoad {
                task: task.name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Deterministic seeded initialization, used by the offline
    /// checkpoint tooling and tests.
    pub fn random(task: &TaskSpec, feature_dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uniform2 = |rows: usize, cols: usize, rng: &mut StdRng| {
            Array2::from_shape_fn((rows, cols), |_| (rng.random::<f32>() - 0.5) * 0.2)
        };
        let w_hidden = uniform2(feature_dim, HIDDEN_DIM, &mut rng);
        let w_out = uniform2(HIDDEN_DIM, task.output_dim, &mut rng);
        Self {
            w_hidden,
            b_hidden: Array1::from_shape_fn(HIDDEN_DIM, |_| (rng.random::<f32>() - 0.5) * 0.2),
            w_out,
            b_out: Array1::from_shape_fn(task.output_dim, |_| (rng.random::<f32>() - 0.5) * 0.2),
        }
    }

    /// Logits for pooled backbone features.
    pub fn forward(&self, features: &Array1<f32>) -> Array1<f32> {
        let hidden = features.dot(&self.w_hidden) + &self.b_hidden;
        hidden.dot(&self.w_out) + &self.b_out
    }

    /// Gradient of `logits[target]` with respect to the input features.
    ///
    /// The head is affine, so this is a pure weight product; it chains
    /// the saliency backward from the chosen class into the backbone.
    pub fn feature_grad(&self, target: usize) -> Array1<f32> {
        let d_hidden = self.w_out.column(target).to_owned();
        self.w_hidden.dot(&d_hidden)
    }

    pub fn output_dim(&self) -> usize {
        self.w_out.ncols()
    }

    pub fn feature_dim(&self) -> usize {
        self.w_hidden.nrows()
    }
}
