//! Grad-CAM++ heatmaps over the backbone's final encoder block.
//!
//! The backbone emits a token sequence, not a feature map, so the first
//! step is to drop the CLS summary token and fold the remaining patch
//! tokens back into their square spatial grid. The grid side is derived
//! from the observed token count and validated, never hard-coded.
//!
//! The "++" weighting scores each channel by curvature-aware gradient
//! statistics instead of a plain gradient average, which localizes fine
//! retinal structures (microaneurysms, vessel segments) more sharply.

use crate::error::{PipelineError, Result};
use common::constants::{attention_map_name, IMG_SIZE};
use ndarray::{s, Array2, Array3};
use retina_model_cache::LoadedModel;
use retina_vit::{grid_side_for_tokens, SaliencyTrace};
use std::fs;
use std::path::{Path, PathBuf};

const EPS: f32 = 1e-7;

/// Generate, overlay, and persist the heatmap for one task.
///
/// `rgb` is the resized `[224, 224, 3]` frame in `[0,1]` from
/// preprocessing. Returns the artifact path; reruns on the same image
/// and task overwrite it.
pub fn generate_attention_map(
    model: &LoadedModel,
    trace: &SaliencyTrace,
    target: usize,
    rgb: &Array3<f32>,
    stem: &str,
    output_dir: &Path,
) -> Result<PathBuf> {
    let d_pooled = model.head.feature_grad(target);
    let grads = model.backbone.saliency_grad(trace, &d_pooled);
    let activation = trace.activation();

    // Row 0 is the CLS token; only patch tokens carry spatial meaning.
    let spatial_act = activation.slice(s![1.., ..]);
    let spatial_grad = grads.slice(s![1.., ..]);
    let num_tokens = spatial_act.nrows();
    let side =
        grid_side_for_tokens(num_tokens).map_err(|e| PipelineError::Explainability(e.to_string()))?;

    let mut cam = weighted_cam(&spatial_act, &spatial_grad, side);
    normalize_in_place(&mut cam);

    let heat = upsample_bilinear(&cam, IMG_SIZE as usize);
    let overlay = blend_jet(&heat, rgb);

    fs::create_dir_all(output_dir)
        .map_err(|e| PipelineError::Explainability(format!("{}: {e}", output_dir.display())))?;
    let path = output_dir.join(attention_map_name(stem, model.task.name));
    overlay
        .save(&path)
        .map_err(|e| PipelineError::Explainability(format!("{}: {e}", path.display())))?;
    log::debug!("Wrote heatmap {}", path.display());
    Ok(path)
}

/// Grad-CAM++ channel weighting over spatial tokens, folded into the
/// raw (un-normalized) saliency grid.
///
/// Per token and channel, `alpha = g^2 / (2 g^2 + (sum_t A_t) g^3)`:
/// the activation sum ranges over the channel's tokens alone, while the
/// gradient terms stay per-token. Channel weight is `sum(alpha * relu(g))`
/// and the grid is the ReLU of the weight-summed activations.
fn weighted_cam(
    act: &ndarray::ArrayView2<'_, f32>,
    grad: &ndarray::ArrayView2<'_, f32>,
    side: usize,
) -> Array2<f32> {
    let (num_tokens, channels) = act.dim();
    let mut cam = Array2::<f32>::zeros((side, side));
    for c in 0..channels {
        let mut act_sum = 0.0f32;
        for t in 0..num_tokens {
            act_sum += act[[t, c]];
        }
        let mut weight = 0.0f32;
        for t in 0..num_tokens {
            let g = grad[[t, c]];
            if g > 0.0 {
                let g2 = g * g;
                let alpha = g2 / (2.0 * g2 + act_sum * g * g2 + EPS);
                weight += alpha * g;
            }
        }
        for t in 0..num_tokens {
            cam[[t / side, t % side]] += weight * act[[t, c]];
        }
    }
    cam.mapv_inplace(|v| v.max(0.0));
    cam
}

/// Min-max normalize to [0,1]; a flat map collapses to all zeros.
fn normalize_in_place(map: &mut Array2<f32>) {
    let min = map.iter().copied().fold(f32::INFINITY, f32::min);
    let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max - min <= EPS {
        map.fill(0.0);
    } else {
        map.mapv_inplace(|v| (v - min) / (max - min));
    }
}

fn upsample_bilinear(map: &Array2<f32>, size: usize) -> Array2<f32> {
    let (rows, cols) = map.dim();
    let scale_y = rows as f32 / size as f32;
    let scale_x = cols as f32 / size as f32;
    Array2::from_shape_fn((size, size), |(y, x)| {
        let sy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, rows as f32 - 1.0);
        let sx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, cols as f32 - 1.0);
        let y0 = sy.floor() as usize;
        let x0 = sx.floor() as usize;
        let y1 = (y0 + 1).min(rows - 1);
        let x1 = (x0 + 1).min(cols - 1);
        let fy = sy - y0 as f32;
        let fx = sx - x0 as f32;
        let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
        let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Jet color for a saliency value in [0,1].
fn jet(v: f32) -> [f32; 3] {
    let r = (1.5 - (4.0 * v - 3.0).abs()).clamp(0.0, 1.0);
    let g = (1.5 - (4.0 * v - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (4.0 * v - 1.0).abs()).clamp(0.0, 1.0);
    [r, g, b]
}

/// Blend the jet-mapped heatmap 50/50 over the original frame.
fn blend_jet(heat: &Array2<f32>, rgb: &Array3<f32>) -> image::RgbImage {
    let size = heat.nrows() as u32;
    image::RgbImage::from_fn(size, size, |x, y| {
        let color = jet(heat[[y as usize, x as usize]]);
        let mut pixel = [0u8; 3];
        for c in 0..3 {
            let blended = 0.5 * color[c] + 0.5 * rgb[[y as usize, x as usize, c]];
            pixel[c] = (blended.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
        image::Rgb(pixel)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array4};
    use retina_model_cache::{task_spec, ClassifierHead, LoadedModel};
    use retina_vit::{Backbone, ViTConfig, ViTWeights};
    use std::sync::Arc;

    #[test]
    fn test_weighted_cam_uses_plain_activation_sum() {
        // One channel, four tokens. Only the g=1 token contributes:
        // alpha = 1 / (2 + (1+2+3+4) * 1) = 1/12, so the raw grid is
        // the activations scaled by 1/12.
        let act = array![[1.0f32], [2.0], [3.0], [4.0]];
        let grad = array![[1.0f32], [-1.0], [0.0], [0.0]];
        let cam = weighted_cam(&act.view(), &grad.view(), 2);

        let weight = 1.0 / 12.0;
        let expected = array![[1.0 * weight, 2.0 * weight], [3.0 * weight, 4.0 * weight]];
        for (got, want) in cam.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_weighted_cam_sums_positive_gradient_tokens() {
        let act = array![[2.0f32], [2.0], [2.0], [2.0]];
        let grad = array![[1.0f32], [0.5], [0.0], [-3.0]];
        let cam = weighted_cam(&act.view(), &grad.view(), 2);

        // act_sum = 8; alpha(1) = 1/10, alpha(0.5) = 0.25/(0.5 + 1) = 1/6.
        let weight = 1.0 / 10.0 + 0.5 / 6.0;
        for &v in cam.iter() {
            assert!((v - 2.0 * weight).abs() < 1e-5, "got {v}");
        }
    }

    fn tiny_model(task: &str) -> (LoadedModel, retina_vit::SaliencyTrace) {
        let config = ViTConfig {
            image_size: 32,
            patch_size: 16,
            hidden_size: 8,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 16,
            layer_norm_eps: 1e-12,
        };
        let weights = ViTWeights::random(config, 17).expect("weights");
        let backbone = Arc::new(Backbone::new(weights).expect("backbone"));
        let spec = task_spec(task).expect("task");
        let head = ClassifierHead::random(spec, 8, 23);

        let pixels = Array4::from_shape_fn((1, 3, 32, 32), |(_, c, y, x)| {
            ((c + y + x) % 5) as f32 / 5.0
        });
        let (_, trace) = backbone.forward_traced(&pixels).expect("forward");
        let model = LoadedModel {
            task: spec,
            backbone,
            head,
        };
        (model, trace)
    }

    #[test]
    fn test_generate_attention_map_writes_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("cams");
        let (model, trace) = tiny_model("Gender");
        let rgb = Array3::zeros((224, 224, 3));

        let path = generate_attention_map(&model, &trace, 0, &rgb, "img7", &output)
            .expect("heatmap");
        assert_eq!(path, output.join("img7_Gender_cam.png"));
        assert!(path.is_file());
    }

    #[test]
    fn test_blocked_output_dir_is_explainability_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").expect("write");
        let (model, trace) = tiny_model("Age");
        let rgb = Array3::zeros((224, 224, 3));

        let err = generate_attention_map(&model, &trace, 0, &rgb, "img7", &blocker.join("cams"))
            .expect_err("must fail");
        assert!(matches!(err, PipelineError::Explainability(_)), "got {err:?}");
    }

    #[test]
    fn test_normalize_maps_to_unit_range() {
        let mut map = array![[1.0, 3.0], [5.0, 2.0]];
        normalize_in_place(&mut map);
        assert_eq!(map[[0, 0]], 0.0);
        assert_eq!(map[[1, 0]], 1.0);
        for &v in map.iter() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_normalize_flat_map_is_zero() {
        let mut map = Array2::from_elem((3, 3), 0.7);
        normalize_in_place(&mut map);
        assert!(map.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_upsample_preserves_constant_maps() {
        let map = Array2::from_elem((4, 4), 0.25);
        let up = upsample_bilinear(&map, 224);
        assert_eq!(up.dim(), (224, 224));
        assert!(up.iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_upsample_is_monotone_across_gradient() {
        let map = Array2::from_shape_fn((4, 4), |(_, x)| x as f32 / 3.0);
        let up = upsample_bilinear(&map, 32);
        for y in 0..32 {
            for x in 1..32 {
                assert!(up[[y, x]] >= up[[y, x - 1]] - 1e-6);
            }
        }
    }

    #[test]
    fn test_jet_runs_blue_to_red() {
        let low = jet(0.0);
        assert!(low[2] > low[1] && low[2] > low[0]);
        let high = jet(1.0);
        assert!(high[0] > high[1] && high[0] > high[2]);
        let mid = jet(0.5);
        assert!(mid[1] > 0.9);
    }
}
