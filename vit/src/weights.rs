//! Backbone weight storage in safetensors format.
//!
//! Layout convention: every linear weight is stored `[in_features,
//! out_features]` and applied as `y = x W + b`. Tensors are little-endian
//! F32. The architecture config lives in a JSON file next to the weights,
//! so shapes here are always validated against an explicit [`ViTConfig`].

use crate::config::ViTConfig;
use crate::error::{Result, ViTError};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::fs;
use std::path::Path;

/// Parameters of one transformer encoder block.
#[derive(Debug, Clone)]
pub struct EncoderLayerWeights {
    pub ln_before_gamma: Array1<f32>,
    pub ln_before_beta: Array1<f32>,
    pub wq: Array2<f32>,
    pub bq: Array1<f32>,
    pub wk: Array2<f32>,
    pub bk: Array1<f32>,
    pub wv: Array2<f32>,
    pub bv: Array1<f32>,
    pub wo: Array2<f32>,
    pub bo: Array1<f32>,
    pub ln_after_gamma: Array1<f32>,
    pub ln_after_beta: Array1<f32>,
    pub w_fc1: Array2<f32>,
    pub b_fc1: Array1<f32>,
    pub w_fc2: Array2<f32>,
    pub b_fc2: Array1<f32>,
}

/// Full parameter set of the ViT backbone, pooler included.
#[derive(Debug, Clone)]
pub struct ViTWeights {
    pub config: ViTConfig,
    pub cls_token: Array1<f32>,
    pub pos_embed: Array2<f32>,
    pub w_patch: Array2<f32>,
    pub b_patch: Array1<f32>,
    pub layers: Vec<EncoderLayerWeights>,
    pub ln_final_gamma: Array1<f32>,
    pub ln_final_beta: Array1<f32>,
    pub w_pool: Array2<f32>,
    pub b_pool: Array1<f32>,
}

fn f32_data(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    if view.dtype() != Dtype::F32 {
        return Err(ViTError::UnsupportedDtype {
            name: name.to_string(),
            got: format!("{:?}", view.dtype()),
        });
    }
    Ok(view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub fn read_array2(st: &SafeTensors<'_>, name: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
    let view = st
        .tensor(name)
        .map_err(|_| ViTError::MissingTensor(name.to_string()))?;
    if view.shape() != [rows, cols] {
        return Err(ViTError::ShapeMismatch {
            name: name.to_string(),
            got: view.shape().to_vec(),
            expected: vec![rows, cols],
        });
    }
    let data = f32_data(name, &view)?;
    Array2::from_shape_vec((rows, cols), data).map_err(|e| ViTError::Format(e.to_string()))
}

pub fn read_array1(st: &SafeTensors<'_>, name: &str, len: usize) -> Result<Array1<f32>> {
    let view = st
        .tensor(name)
        .map_err(|_| ViTError::MissingTensor(name.to_string()))?;
    if view.shape() != [len] {
        return Err(ViTError::ShapeMismatch {
            name: name.to_string(),
            got: view.shape().to_vec(),
            expected: vec![len],
        });
    }
    let data = f32_data(name, &view)?;
    Ok(Array1::from_vec(data))
}

fn uniform2(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| (rng.random::<f32>() - 0.5) * 0.04)
}

fn uniform1(rng: &mut StdRng, len: usize) -> Array1<f32> {
    Array1::from_shape_fn(len, |_| (rng.random::<f32>() - 0.5) * 0.04)
}

impl ViTWeights {
    /// Load and shape-check backbone weights for the given architecture.
    pub fn load(config: ViTConfig, path: &Path) -> Result<Self> {
        config.validate()?;
        let bytes = fs::read(path).map_err(|source| ViTError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let st = SafeTensors::deserialize(&bytes).map_err(|e| ViTError::Format(e.to_string()))?;

        let h = config.hidden_size;
        let i = config.intermediate_size;
        let t = config.seq_len();
        let p = config.patch_dim();

        let mut layers = Vec::with_capacity(config.num_layers);
        for l in 0..config.num_layers {
            let prefix = format!("encoder.{l}");
            layers.push(EncoderLayerWeights {
                ln_before_gamma: read_array1(&st, &format!("{prefix}.ln_before.weight"), h)?,
                ln_before_beta: read_array1(&st, &format!("{prefix}.ln_before.bias"), h)?,
                wq: read_array2(&st, &format!("{prefix}.attention.query.weight"), h, h)?,
                bq: read_array1(&st, &format!("{prefix}.attention.query.bias"), h)?,
                wk: read_array2(&st, &format!("{prefix}.attention.key.weight"), h, h)?,
                bk: read_array1(&st, &format!("{prefix}.attention.key.bias"), h)?,
                wv: read_array2(&st, &format!("{prefix}.attention.value.weight"), h, h)?,
                bv: read_array1(&st, &format!("{prefix}.attention.value.bias"), h)?,
                wo: read_array2(&st, &format!("{prefix}.attention.output.weight"), h, h)?,
                bo: read_array1(&st, &format!("{prefix}.attention.output.bias"), h)?,
                ln_after_gamma: read_array1(&st, &format!("{prefix}.ln_after.weight"), h)?,
                ln_after_beta: read_array1(&st, &format!("{prefix}.ln_after.bias"), h)?,
                w_fc1: read_array2(&st, &format!("{prefix}.mlp.fc1.weight"), h, i)?,
                b_fc1: read_array1(&st, &format!("{prefix}.mlp.fc1.bias"), i)?,
                w_fc2: read_array2(&st, &format!("{prefix}.mlp.fc2.weight"), i, h)?,
                b_fc2: read_array1(&st, &format!("{prefix}.mlp.fc2.bias"), h)?,
            });
        }

        Ok(Self {
            cls_token: read_array1(&st, "cls_token", h)?,
            pos_embed: read_array2(&st, "position_embeddings", t, h)?,
            w_patch: read_array2(&st, "patch_embed.weight", p, h)?,
            b_patch: read_array1(&st, "patch_embed.bias", h)?,
            layers,
            ln_final_gamma: read_array1(&st, "layernorm.weight", h)?,
            ln_final_beta: read_array1(&st, "layernorm.bias", h)?,
            w_pool: read_array2(&st, "pooler.weight", h, h)?,
            b_pool: read_array1(&st, "pooler.bias", h)?,
            config,
        })
    }

    /// Serialize to a safetensors file (overwrites).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut raw: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        tensor_entry1(&mut raw, "cls_token", &self.cls_token);
        tensor_entry2(&mut raw, "position_embeddings", &self.pos_embed);
        tensor_entry2(&mut raw, "patch_embed.weight", &self.w_patch);
        tensor_entry1(&mut raw, "patch_embed.bias", &self.b_patch);
        for (l, layer) in self.layers.iter().enumerate() {
            let prefix = format!("encoder.{l}");
            tensor_entry1(&mut raw, &format!("{prefix}.ln_before.weight"), &layer.ln_before_gamma);
            tensor_entry1(&mut raw, &format!("{prefix}.ln_before.bias"), &layer.ln_before_beta);
            tensor_entry2(&mut raw, &format!("{prefix}.attention.query.weight"), &layer.wq);
            tensor_entry1(&mut raw, &format!("{prefix}.attention.query.bias"), &layer.bq);
            tensor_entry2(&mut raw, &format!("{prefix}.attention.key.weight"), &layer.wk);
            tensor_entry1(&mut raw, &format!("{prefix}.attention.key.bias"), &layer.bk);
            tensor_entry2(&mut raw, &format!("{prefix}.attention.value.weight"), &layer.wv);
            tensor_entry1(&mut raw, &format!("{prefix}.attention.value.bias"), &layer.bv);
            tensor_entry2(&mut raw, &format!("{prefix}.attention.output.weight"), &layer.wo);
            tensor_entry1(&mut raw, &format!("{prefix}.attention.output.bias"), &layer.bo);
            tensor_entry1(&mut raw, &format!("{prefix}.ln_after.weight"), &layer.ln_after_gamma);
            tensor_entry1(&mut raw, &format!("{prefix}.ln_after.bias"), &layer.ln_after_beta);
            tensor_entry2(&mut raw, &format!("{prefix}.mlp.fc1.weight"), &layer.w_fc1);
            tensor_entry1(&mut raw, &format!("{prefix}.mlp.fc1.bias"), &layer.b_fc1);
            tensor_entry2(&mut raw, &format!("{prefix}.mlp.fc2.weight"), &layer.w_fc2);
            tensor_entry1(&mut raw, &format!("{prefix}.mlp.fc2.bias"), &layer.b_fc2);
        }
        tensor_entry1(&mut raw, "layernorm.weight", &self.ln_final_gamma);
        tensor_entry1(&mut raw, "layernorm.bias", &self.ln_final_beta);
        tensor_entry2(&mut raw, "pooler.weight", &self.w_pool);
        tensor_entry1(&mut raw, "pooler.bias", &self.b_pool);

        let mut views: Vec<(String, TensorView<'_>)> = Vec::with_capacity(raw.len());
        for (name, shape, data) in &raw {
            let view = TensorView::new(Dtype::F32, shape.clone(), data)
                .map_err(|e| ViTError::Format(e.to_string()))?;
            views.push((name.clone(), view));
        }
        safetensors::serialize_to_file(views, &None, path)
            .map_err(|e| ViTError::Format(e.to_string()))
    }

    /// Deterministic seeded initialization.
    ///
    /// Used by the offline checkpoint tooling and by tests to fabricate
    /// small but structurally complete backbones.
    pub fn random(config: ViTConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let h = config.hidden_size;
        let i = config.intermediate_size;
        let t = config.seq_len();
        let p = config.patch_dim();

        let layers = (0..config.num_layers)
            .map(|_| EncoderLayerWeights {
                ln_before_gamma: Array1::ones(h),
                ln_before_beta: Array1::zeros(h),
                wq: uniform2(&mut rng, h, h),
                bq: uniform1(&mut rng, h),
                wk: uniform2(&mut rng, h, h),
                bk: uniform1(&mut rng, h),
                wv: uniform2(&mut rng, h, h),
                bv: uniform1(&mut rng, h),
                wo: uniform2(&mut rng, h, h),
                bo: uniform1(&mut rng, h),
                ln_after_gamma: Array1::ones(h),
                ln_after_beta: Array1::zeros(h),
                w_fc1: uniform2(&mut rng, h, i),
                b_fc1: uniform1(&mut rng, i),
                w_fc2: uniform2(&mut rng, i, h),
                b_fc2: uniform1(&mut rng, h),
            })
            .collect();

        Ok(Self {
            cls_token: uniform1(&mut rng, h),
            pos_embed: uniform2(&mut rng, t, h),
            w_patch: uniform2(&mut rng, p, h),
            b_patch: uniform1(&mut rng, h),
            layers,
            ln_final_gamma: Array1::ones(h),
            ln_final_beta: Array1::zeros(h),
            w_pool: uniform2(&mut rng, h, h),
            b_pool: uniform1(&mut rng, h),
            config,
        })
    }
}

pub fn tensor_entry1(raw: &mut Vec<(String, Vec<usize>, Vec<u8>)>, name: &str, a: &Array1<f32>) {
    let values: Vec<f32> = a.iter().copied().collect();
    raw.push((
        name.to_string(),
        a.shape().to_vec(),
        bytemuck::cast_slice(&values).to_vec(),
    ));
}

pub fn tensor_entry2(raw: &mut Vec<(String, Vec<usize>, Vec<u8>)>, name: &str, a: &Array2<f32>) {
    let values: Vec<f32> = a.iter().copied().collect();
    raw.push((
        name.to_string(),
        a.shape().to_vec(),
        bytemuck::cast_slice(&values).to_vec(),
    ));
}
