//! CPU math primitives for the transformer forward pass and the analytic
//! backward used by the saliency generator.
//!
//! Row convention: a `[tokens, features]` matrix, with every op applied
//! per row. Backward functions take the upstream gradient and return the
//! gradient with respect to the op's input.

use ndarray::{Array1, Array2, Axis};

const GELU_COEF: f32 = 0.797_884_6; // sqrt(2/pi)
const GELU_CUBIC: f32 = 0.044_715;

/// Row-wise layer normalization with affine parameters.
pub fn layernorm(x: &Array2<f32>, gamma: &Array1<f32>, beta: &Array1<f32>, eps: f32) -> Array2<f32> {
    let mut out = Array2::zeros(x.raw_dim());
    for (row, mut out_row) in x.outer_iter().zip(out.outer_iter_mut()) {
        let n = row.len() as f32;
        let mean = row.sum() / n;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + eps).sqrt();
        for (i, v) in row.iter().enumerate() {
            out_row[i] = (v - mean) * inv_std * gamma[i] + beta[i];
        }
    }
    out
}

/// Backward of [`layernorm`] with respect to its input.
pub fn layernorm_backward(
    dy: &Array2<f32>,
    x: &Array2<f32>,
    gamma: &Array1<f32>,
    eps: f32,
) -> Array2<f32> {
    let mut dx = Array2::zeros(x.raw_dim());
    for ((x_row, dy_row), mut dx_row) in x
        .outer_iter()
        .zip(dy.outer_iter())
        .zip(dx.outer_iter_mut())
    {
        let n = x_row.len() as f32;
        let mean = x_row.sum() / n;
        let var = x_row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + eps).sqrt();

        let mut mean_dxhat = 0.0f32;
        let mut mean_dxhat_xhat = 0.0f32;
        let mut xhat = vec![0.0f32; x_row.len()];
        let mut dxhat = vec![0.0f32; x_row.len()];
        for i in 0..x_row.len() {
            xhat[i] = (x_row[i] - mean) * inv_std;
            dxhat[i] = dy_row[i] * gamma[i];
            mean_dxhat += dxhat[i];
            mean_dxhat_xhat += dxhat[i] * xhat[i];
        }
        mean_dxhat /= n;
        mean_dxhat_xhat /= n;
        for i in 0..x_row.len() {
            dx_row[i] = (dxhat[i] - mean_dxhat - xhat[i] * mean_dxhat_xhat) * inv_std;
        }
    }
    dx
}

/// Numerically stable row-wise softmax.
pub fn softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.outer_iter_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Backward of [`softmax_rows`]: `ds = p * (dp - sum(dp * p))` per row.
pub fn softmax_rows_backward(p: &Array2<f32>, dp: &Array2<f32>) -> Array2<f32> {
    let dot = (p * dp).sum_axis(Axis(1));
    let mut ds = dp.clone();
    for (mut row, (&d, p_row)) in ds.outer_iter_mut().zip(dot.iter().zip(p.outer_iter())) {
        for i in 0..row.len() {
            row[i] = p_row[i] * (row[i] - d);
        }
    }
    ds
}

/// Stable softmax over a single logit vector (used for class decoding).
pub fn softmax_1d(x: &Array1<f32>) -> Array1<f32> {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out = x.mapv(|v| (v - max).exp());
    let sum = out.sum();
    out.mapv_inplace(|v| v / sum);
    out
}

fn gelu_scalar(x: f32) -> f32 {
    let inner = GELU_COEF * (x + GELU_CUBIC * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

fn gelu_grad_scalar(x: f32) -> f32 {
    let inner = GELU_COEF * (x + GELU_CUBIC * x * x * x);
    let t = inner.tanh();
    let d_inner = GELU_COEF * (1.0 + 3.0 * GELU_CUBIC * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
}

/// GELU activation (tanh approximation).
pub fn gelu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(gelu_scalar)
}

/// Elementwise derivative of [`gelu`] at `x`.
pub fn gelu_grad(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(gelu_grad_scalar)
}

/// Affine layer `y = x W + b` with `W` stored `[in, out]`.
pub fn linear(x: &Array2<f32>, w: &Array2<f32>, b: &Array1<f32>) -> Array2<f32> {
    let mut y = x.dot(w);
    y += b;
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const EPS: f32 = 1e-12;
    const FD_STEP: f32 = 1e-3;
    const FD_TOL: f32 = 1e-2;

    fn assert_close(got: f32, want: f32, tol: f32, context: &str) {
        assert!(
            (got - want).abs() <= tol * (1.0 + want.abs()),
            "{context}: got {got}, want {want}"
        );
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = array![[1.0f32, 2.0, 3.0], [-5.0, 0.0, 5.0]];
        let p = softmax_rows(&x);
        for row in p.outer_iter() {
            assert_close(row.sum(), 1.0, 1e-5, "row sum");
            assert!(row.iter().all(|&v| v > 0.0 && v < 1.0));
        }
        // Larger logit, larger probability.
        assert!(p[[0, 2]] > p[[0, 1]] && p[[0, 1]] > p[[0, 0]]);
    }

    #[test]
    fn test_softmax_1d_handles_large_logits() {
        let x = array![1000.0f32, 1001.0, 999.0];
        let p = softmax_1d(&x);
        assert_close(p.sum(), 1.0, 1e-5, "sum");
        assert!(p.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_layernorm_normalizes_rows() {
        let x = array![[1.0f32, 2.0, 3.0, 4.0]];
        let gamma = Array1::ones(4);
        let beta = Array1::zeros(4);
        let y = layernorm(&x, &gamma, &beta, EPS);
        let row = y.row(0);
        assert_close(row.sum(), 0.0, 1e-4, "zero mean");
        let var = row.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert_close(var, 1.0, 1e-3, "unit variance");
    }

    #[test]
    fn test_layernorm_backward_matches_finite_difference() {
        let x = array![[0.3f32, -1.2, 0.8, 2.1], [1.0, 0.0, -0.5, 0.25]];
        let gamma = array![0.9f32, 1.1, -0.7, 0.4];
        let beta = array![0.1f32, -0.2, 0.0, 0.3];
        let dy = array![[0.2f32, -0.4, 1.0, 0.5], [-1.0, 0.3, 0.6, -0.2]];

        let dx = layernorm_backward(&dy, &x, &gamma, EPS);

        for r in 0..x.nrows() {
            for c in 0..x.ncols() {
                let mut plus = x.clone();
                plus[[r, c]] += FD_STEP;
                let mut minus = x.clone();
                minus[[r, c]] -= FD_STEP;
                let f = |m: &Array2<f32>| (&layernorm(m, &gamma, &beta, EPS) * &dy).sum();
                let numeric = (f(&plus) - f(&minus)) / (2.0 * FD_STEP);
                assert_close(dx[[r, c]], numeric, FD_TOL, &format!("dx[{r},{c}]"));
            }
        }
    }

    #[test]
    fn test_softmax_backward_matches_finite_difference() {
        let x = array![[0.5f32, -0.3, 1.2], [2.0, 0.1, -1.0]];
        let dp = array![[1.0f32, -0.5, 0.25], [0.4, 0.9, -0.6]];

        let p = softmax_rows(&x);
        let ds = softmax_rows_backward(&p, &dp);

        for r in 0..x.nrows() {
            for c in 0..x.ncols() {
                let mut plus = x.clone();
                plus[[r, c]] += FD_STEP;
                let mut minus = x.clone();
                minus[[r, c]] -= FD_STEP;
                let f = |m: &Array2<f32>| (&softmax_rows(m) * &dp).sum();
                let numeric = (f(&plus) - f(&minus)) / (2.0 * FD_STEP);
                assert_close(ds[[r, c]], numeric, FD_TOL, &format!("ds[{r},{c}]"));
            }
        }
    }

    #[test]
    fn test_gelu_grad_matches_finite_difference() {
        let x = array![[-3.0f32, -1.0, -0.1, 0.0, 0.1, 1.0, 3.0]];
        let g = gelu_grad(&x);
        for (i, &v) in x.row(0).iter().enumerate() {
            let numeric =
                (gelu_scalar(v + FD_STEP) - gelu_scalar(v - FD_STEP)) / (2.0 * FD_STEP);
            assert_close(g[[0, i]], numeric, FD_TOL, &format!("gelu'({v})"));
        }
    }

    #[test]
    fn test_linear_applies_bias_per_row() {
        let x = array![[1.0f32, 0.0], [0.0, 2.0]];
        let w = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let b = array![0.5f32, -0.5, 0.0];
        let y = linear(&x, &w, &b);
        assert_eq!(y, array![[1.5f32, 1.5, 3.0], [8.5, 9.5, 12.0]]);
    }
}
