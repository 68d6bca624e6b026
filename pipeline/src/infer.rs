//! Forward pass and output decoding.

use crate::error::Result;
use crate::types::Prediction;
use ndarray::{Array1, Array4};
use retina_model_cache::{LoadedModel, TaskKind, TaskSpec};
use retina_vit::math::softmax_1d;

/// Decode raw head logits according to the task kind.
///
/// Returns the prediction together with the class index the saliency
/// generator should target; regression heads target their single output.
pub fn decode(task: &TaskSpec, logits: &Array1<f32>) -> (Prediction, usize) {
    match task.kind {
        TaskKind::Regression => (Prediction::Regression { value: logits[0] }, 0),
        TaskKind::Binary | TaskKind::Multiclass => {
            let probs = softmax_1d(logits);
            let mut class = 0;
            for (i, &p) in probs.iter().enumerate() {
                if p > probs[class] {
                    class = i;
                }
            }
            (
                Prediction::Classification {
                    class,
                    probability: probs[class],
                },
                class,
            )
        }
    }
}

/// Single-task inference: backbone forward, head forward, decode.
pub fn predict(model: &LoadedModel, tensor: &Array4<f32>) -> Result<(Prediction, usize)> {
    let pooled = model
        .backbone
        .forward(tensor)
        .map_err(|e| crate::error::PipelineError::Inference {
            task: model.task.name.to_string(),
            reason: e.to_string(),
        })?;
    let logits = model.head.forward(&pooled);
    Ok(decode(model.task, &logits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use retina_model_cache::{task_spec, ClassifierHead, LoadedModel};
    use retina_vit::{Backbone, ViTConfig, ViTWeights};
    use std::sync::Arc;

    fn tiny_model(task: &str) -> LoadedModel {
        let config = ViTConfig {
            image_size: 32,
            patch_size: 16,
            hidden_size: 8,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 16,
            layer_norm_eps: 1e-12,
        };
        let weights = ViTWeights::random(config, 31).expect("weights");
        let spec = task_spec(task).expect("task");
        LoadedModel {
            task: spec,
            backbone: Arc::new(Backbone::new(weights).expect("backbone")),
            head: ClassifierHead::random(spec, 8, 37),
        }
    }

    fn test_tensor() -> Array4<f32> {
        Array4::from_shape_fn((1, 3, 32, 32), |(_, c, y, x)| {
            ((c + 2 * y + 3 * x) % 7) as f32 / 7.0
        })
    }

    #[test]
    fn test_predict_regression_end_to_end() {
        let model = tiny_model("Age");
        let (prediction, target) = predict(&model, &test_tensor()).expect("predict");
        assert_eq!(target, 0);
        match prediction {
            Prediction::Regression { value } => assert!(value.is_finite()),
            other => panic!("unexpected prediction {other:?}"),
        }
    }

    #[test]
    fn test_predict_matches_manual_forward_and_decode() {
        let model = tiny_model("ICDR");
        let tensor = test_tensor();

        let pooled = model.backbone.forward(&tensor).expect("forward");
        let expected = decode(model.task, &model.head.forward(&pooled));
        let got = predict(&model, &tensor).expect("predict");
        assert_eq!(got, expected);
        match got.0 {
            Prediction::Classification { class, probability } => {
                assert!(class < model.task.output_dim);
                assert!((0.0..=1.0).contains(&probability));
            }
            other => panic!("unexpected prediction {other:?}"),
        }
    }

    #[test]
    fn test_predict_rejects_wrong_input_shape() {
        let model = tiny_model("Gender");
        let bad = Array4::zeros((1, 3, 16, 16));
        let err = predict(&model, &bad).expect_err("must fail");
        assert!(matches!(err, PipelineError::Inference { .. }), "got {err:?}");
    }

    #[test]
    fn test_regression_decodes_raw_scalar() {
        let task = task_spec("Age").expect("task");
        let logits = Array1::from_vec(vec![61.3]);
        let (prediction, target) = decode(task, &logits);
        assert_eq!(target, 0);
        assert_eq!(prediction, Prediction::Regression { value: 61.3 });
    }

    #[test]
    fn test_classification_decodes_argmax_softmax() {
        let task = task_spec("ICDR").expect("task");
        let logits = Array1::from_vec(vec![0.1, 0.2, 3.0, 0.4, 0.5]);
        let (prediction, target) = decode(task, &logits);
        assert_eq!(target, 2);
        match prediction {
            Prediction::Classification { class, probability } => {
                assert_eq!(class, 2);
                assert!(probability > 0.5 && probability <= 1.0);
            }
            other => panic!("unexpected prediction {other:?}"),
        }
    }

    #[test]
    fn test_classification_probabilities_bounded() {
        let task = task_spec("Gender").expect("task");
        for logits in [vec![0.0, 0.0], vec![-50.0, 50.0], vec![1e3, -1e3]] {
            let (prediction, target) = decode(task, &Array1::from_vec(logits));
            match prediction {
                Prediction::Classification { class, probability } => {
                    assert_eq!(class, target);
                    assert!(class < task.output_dim);
                    assert!((0.0..=1.0).contains(&probability));
                    assert!(probability.is_finite());
                }
                other => panic!("unexpected prediction {other:?}"),
            }
        }
    }
}
