//! ViT backbone forward pass and the analytic backward pass that feeds
//! the saliency generator.
//!
//! The backbone is frozen and evaluation-only: `forward` takes `&self`
//! and keeps no task state, so any number of task heads can share one
//! instance concurrently.
//!
//! Saliency explains the output of the final encoder block's
//! pre-attention LayerNorm. `forward_traced` records that activation and
//! the intermediates of everything downstream of it; `saliency_grad`
//! walks the same path backwards analytically (head gradients are chained
//! in by the caller via the pooled-feature gradient).

use crate::config::ViTConfig;
use crate::error::{Result, ViTError};
use crate::math::{
    gelu, gelu_grad, layernorm, layernorm_backward, linear, softmax_rows, softmax_rows_backward,
};
use crate::weights::{EncoderLayerWeights, ViTWeights};
use ndarray::{s, Array1, Array2, Array4};

/// Shared frozen feature extractor.
#[derive(Debug)]
pub struct Backbone {
    weights: ViTWeights,
}

/// Attention intermediates kept for the backward pass.
struct AttentionTrace {
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    probs: Vec<Array2<f32>>,
}

/// Intermediates of the saliency tail, captured by [`Backbone::forward_traced`].
///
/// Everything needed to differentiate pooled features with respect to the
/// explained activation, without re-running the forward pass.
pub struct SaliencyTrace {
    /// Explained activation: ln_before output of the final block, `[seq, hidden]`.
    activation: Array2<f32>,
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    /// Per-head attention probabilities, each `[seq, seq]`.
    probs: Vec<Array2<f32>>,
    /// After the attention residual.
    x_mid: Array2<f32>,
    /// Pre-GELU fc1 output, `[seq, intermediate]`.
    h1: Array2<f32>,
    /// Final block output (input of the closing LayerNorm).
    x_out: Array2<f32>,
    /// Pooled CLS features after tanh, `[hidden]`.
    pooled: Array1<f32>,
}

impl SaliencyTrace {
    /// The explained activation `[seq, hidden]`, CLS token in row 0.
    pub fn activation(&self) -> &Array2<f32> {
        &self.activation
    }

    pub fn pooled(&self) -> &Array1<f32> {
        &self.pooled
    }
}

impl Backbone {
    pub fn new(weights: ViTWeights) -> Result<Self> {
        weights.config.validate()?;
        Ok(Self { weights })
    }

    pub fn config(&self) -> &ViTConfig {
        &self.weights.config
    }

    /// Split the image into patches, embed, prepend CLS, add positions.
    fn embed(&self, pixels: &Array4<f32>) -> Result<Array2<f32>> {
        let c = &self.weights.config;
        let s_img = c.image_size;
        let expected = vec![1, 3, s_img, s_img];
        if pixels.shape() != expected.as_slice() {
            return Err(ViTError::InputShape {
                got: pixels.shape().to_vec(),
                expected,
            });
        }

        let p = c.patch_size;
        let g = c.grid_side();
        let mut patches = Array2::zeros((c.num_patches(), c.patch_dim()));
        for gy in 0..g {
            for gx in 0..g {
                let row = gy * g + gx;
                let mut col = 0;
                for ch in 0..3 {
                    for py in 0..p {
                        for px in 0..p {
                            patches[[row, col]] = pixels[[0, ch, gy * p + py, gx * p + px]];
                            col += 1;
                        }
                    }
                }
            }
        }

        let embedded = linear(&patches, &self.weights.w_patch, &self.weights.b_patch);
        let mut tokens = Array2::zeros((c.seq_len(), c.hidden_size));
        tokens.row_mut(0).assign(&self.weights.cls_token);
        tokens.slice_mut(s![1.., ..]).assign(&embedded);
        tokens += &self.weights.pos_embed;
        Ok(tokens)
    }

    /// Multi-head self-attention over pre-normalized tokens.
    ///
    /// Returns the block's attention output plus the projections and
    /// per-head probabilities (retained for the saliency backward, moved
    /// out of already-computed buffers at no extra cost).
    fn attention(&self, a: &Array2<f32>, layer: &EncoderLayerWeights) -> (Array2<f32>, AttentionTrace) {
        let c = &self.weights.config;
        let d = c.head_dim();
        let scale = 1.0 / (d as f32).sqrt();
        let t = a.nrows();

        let q = linear(a, &layer.wq, &layer.bq);
        let k = linear(a, &layer.wk, &layer.bk);
        let v = linear(a, &layer.wv, &layer.bv);

        let mut ctx = Array2::zeros((t, c.hidden_size));
        let mut probs = Vec::with_capacity(c.num_heads);
        for h in 0..c.num_heads {
            let qh = q.slice(s![.., h * d..(h + 1) * d]);
            let kh = k.slice(s![.., h * d..(h + 1) * d]);
            let vh = v.slice(s![.., h * d..(h + 1) * d]);
            let scores = qh.dot(&kh.t()) * scale;
            let p = softmax_rows(&scores);
            ctx.slice_mut(s![.., h * d..(h + 1) * d]).assign(&p.dot(&vh));
            probs.push(p);
        }

        let out = linear(&ctx, &layer.wo, &layer.bo);
        (out, AttentionTrace { q, k, v, probs })
    }

    fn block(&self, x: &Array2<f32>, layer: &EncoderLayerWeights) -> Array2<f32> {
        let c = &self.weights.config;
        let a = layernorm(x, &layer.ln_before_gamma, &layer.ln_before_beta, c.layer_norm_eps);
        let (attn_out, _) = self.attention(&a, layer);
        let x_mid = x + &attn_out;
        let a2 = layernorm(&x_mid, &layer.ln_after_gamma, &layer.ln_after_beta, c.layer_norm_eps);
        let h1 = linear(&a2, &layer.w_fc1, &layer.b_fc1);
        let mlp_out = linear(&gelu(&h1), &layer.w_fc2, &layer.b_fc2);
        x_mid + mlp_out
    }

    /// Forward from the explained activation through pooled features.
    ///
    /// `a` is the final block's ln_before output, `x_in` that block's raw
    /// input (needed for the attention residual). Returns pooled features
    /// and the trace for the backward pass.
    fn tail_traced(&self, a: Array2<f32>, x_in: &Array2<f32>) -> (Array1<f32>, SaliencyTrace) {
        let c = &self.weights.config;
        let layer = &self.weights.layers[c.num_layers - 1];

        let (attn_out, attn_trace) = self.attention(&a, layer);
        let AttentionTrace { q, k, v, probs } = attn_trace;
        let x_mid = x_in + &attn_out;
        let a2 = layernorm(&x_mid, &layer.ln_after_gamma, &layer.ln_after_beta, c.layer_norm_eps);
        let h1 = linear(&a2, &layer.w_fc1, &layer.b_fc1);
        let mlp_out = linear(&gelu(&h1), &layer.w_fc2, &layer.b_fc2);
        let x_out = &x_mid + &mlp_out;

        let y = layernorm(
            &x_out,
            &self.weights.ln_final_gamma,
            &self.weights.ln_final_beta,
            c.layer_norm_eps,
        );
        let u = y.row(0).dot(&self.weights.w_pool) + &self.weights.b_pool;
        let pooled = u.mapv(f32::tanh);

        let trace = SaliencyTrace {
            activation: a,
            q,
            k,
            v,
            probs,
            x_mid,
            h1,
            x_out,
            pooled: pooled.clone(),
        };
        (pooled, trace)
    }

    /// Evaluation-mode forward pass: pooled CLS features `[hidden]`.
    pub fn forward(&self, pixels: &Array4<f32>) -> Result<Array1<f32>> {
        let (pooled, _) = self.forward_traced(pixels)?;
        Ok(pooled)
    }

    /// Forward pass that also captures the saliency trace.
    pub fn forward_traced(&self, pixels: &Array4<f32>) -> Result<(Array1<f32>, SaliencyTrace)> {
        let c = &self.weights.config;
        let mut x = self.embed(pixels)?;
        for layer in &self.weights.layers[..c.num_layers - 1] {
            x = self.block(&x, layer);
        }
        let last = &self.weights.layers[c.num_layers - 1];
        let a = layernorm(&x, &last.ln_before_gamma, &last.ln_before_beta, c.layer_norm_eps);
        let (pooled, trace) = self.tail_traced(a, &x);
        Ok((pooled, trace))
    }

    /// Gradient of `d_pooled . pooled` with respect to the explained
    /// activation, `[seq, hidden]`.
    ///
    /// The attention residual bypasses the explained activation, so the
    /// gradient flows through the attention path only; the MLP residual
    /// pair is handled inside.
    pub fn saliency_grad(&self, trace: &SaliencyTrace, d_pooled: &Array1<f32>) -> Array2<f32> {
        let c = &self.weights.config;
        let layer = &self.weights.layers[c.num_layers - 1];
        let d = c.head_dim();
        let scale = 1.0 / (d as f32).sqrt();
        let t = trace.activation.nrows();

        // pooler: pooled = tanh(y0 W_pool + b_pool)
        let du = d_pooled * &trace.pooled.mapv(|p| 1.0 - p * p);
        let dy0 = self.weights.w_pool.dot(&du);
        let mut dy = Array2::zeros((t, c.hidden_size));
        dy.row_mut(0).assign(&dy0);

        // closing layernorm
        let dx_out = layernorm_backward(&dy, &trace.x_out, &self.weights.ln_final_gamma, c.layer_norm_eps);

        // MLP branch: x_out = x_mid + fc2(gelu(fc1(ln_after(x_mid))))
        let d_act = dx_out.dot(&layer.w_fc2.t());
        let d_h1 = d_act * gelu_grad(&trace.h1);
        let d_a2 = d_h1.dot(&layer.w_fc1.t());
        let dx_mid = &dx_out
            + &layernorm_backward(&d_a2, &trace.x_mid, &layer.ln_after_gamma, c.layer_norm_eps);

        // Attention branch: only path reaching the explained activation.
        let d_ctx = dx_mid.dot(&layer.wo.t());
        let mut dq = Array2::zeros((t, c.hidden_size));
        let mut dk = Array2::zeros((t, c.hidden_size));
        let mut dv = Array2::zeros((t, c.hidden_size));
        for h in 0..c.num_heads {
            let qh = trace.q.slice(s![.., h * d..(h + 1) * d]);
            let kh = trace.k.slice(s![.., h * d..(h + 1) * d]);
            let vh = trace.v.slice(s![.., h * d..(h + 1) * d]);
            let p = &trace.probs[h];

            let d_ctx_h = d_ctx.slice(s![.., h * d..(h + 1) * d]);
            let dp = d_ctx_h.dot(&vh.t());
            let d_vh = p.t().dot(&d_ctx_h);
            let ds = softmax_rows_backward(p, &dp);
            let d_qh = ds.dot(&kh) * scale;
            let d_kh = ds.t().dot(&qh) * scale;

            dq.slice_mut(s![.., h * d..(h + 1) * d]).assign(&d_qh);
            dk.slice_mut(s![.., h * d..(h + 1) * d]).assign(&d_kh);
            dv.slice_mut(s![.., h * d..(h + 1) * d]).assign(&d_vh);
        }

        dq.dot(&layer.wq.t()) + dk.dot(&layer.wk.t()) + dv.dot(&layer.wv.t())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ViTConfig {
        ViTConfig {
            image_size: 32,
            patch_size: 16,
            hidden_size: 8,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 16,
            layer_norm_eps: 1e-12,
        }
    }

    fn tiny_backbone(seed: u64) -> Backbone {
        let weights = ViTWeights::random(tiny_config(), seed).expect("init");
        Backbone::new(weights).expect("backbone")
    }

    fn test_pixels(config: &ViTConfig) -> Array4<f32> {
        let s = config.image_size;
        Array4::from_shape_fn((1, 3, s, s), |(_, c, y, x)| {
            ((c + 1) * (y + 2) * (x + 3)) as f32 % 7.0 / 7.0
        })
    }

    #[test]
    fn test_forward_shapes_and_determinism() {
        let backbone = tiny_backbone(11);
        let pixels = test_pixels(backbone.config());

        let a = backbone.forward(&pixels).expect("forward");
        let b = backbone.forward(&pixels).expect("forward");
        assert_eq!(a.len(), backbone.config().hidden_size);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_rejects_wrong_input_shape() {
        let backbone = tiny_backbone(11);
        let bad = Array4::zeros((1, 3, 16, 16));
        let err = backbone.forward(&bad).expect_err("must fail");
        assert!(matches!(err, ViTError::InputShape { .. }), "got {err:?}");
    }

    #[test]
    fn test_trace_activation_shape() {
        let backbone = tiny_backbone(11);
        let pixels = test_pixels(backbone.config());
        let (pooled, trace) = backbone.forward_traced(&pixels).expect("forward");
        assert_eq!(
            trace.activation().shape(),
            [backbone.config().seq_len(), backbone.config().hidden_size]
        );
        assert_eq!(trace.pooled(), &pooled);
    }

    #[test]
    fn test_traced_and_untraced_forward_agree() {
        let backbone = tiny_backbone(23);
        let pixels = test_pixels(backbone.config());
        let plain = backbone.forward(&pixels).expect("forward");
        let (traced, _) = backbone.forward_traced(&pixels).expect("forward");
        assert_eq!(plain, traced);
    }

    /// The analytic saliency backward must match a central finite
    /// difference of the tail forward, entry by entry.
    #[test]
    fn test_saliency_grad_matches_finite_difference() {
        let backbone = tiny_backbone(5);
        let config = backbone.config().clone();
        let pixels = test_pixels(&config);

        // Re-run the leading blocks to get the last block's raw input.
        let x0 = backbone.embed(&pixels).expect("embed");
        let x_in = backbone.block(&x0, &backbone.weights.layers[0]);
        let last = &backbone.weights.layers[config.num_layers - 1];
        let a = layernorm(&x_in, &last.ln_before_gamma, &last.ln_before_beta, config.layer_norm_eps);

        let d_pooled =
            Array1::from_shape_fn(config.hidden_size, |i| if i % 2 == 0 { 0.7 } else { -0.4 });
        let (_, trace) = backbone.tail_traced(a.clone(), &x_in);
        let analytic = backbone.saliency_grad(&trace, &d_pooled);

        let step = 1e-3f32;
        let score = |activation: Array2<f32>| -> f32 {
            let (pooled, _) = backbone.tail_traced(activation, &x_in);
            pooled.dot(&d_pooled)
        };
        for r in 0..config.seq_len() {
            for col in 0..config.hidden_size {
                let mut plus = a.clone();
                plus[[r, col]] += step;
                let mut minus = a.clone();
                minus[[r, col]] -= step;
                let numeric = (score(plus) - score(minus)) / (2.0 * step);
                let got = analytic[[r, col]];
                assert!(
                    (got - numeric).abs() <= 2e-2 * (1.0 + numeric.abs()),
                    "dA[{r},{col}]: analytic {got}, numeric {numeric}"
                );
            }
        }
    }
}
