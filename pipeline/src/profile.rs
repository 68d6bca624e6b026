//! Full-profile orchestration.
//!
//! One image in, every deployed task out. Per-task failures are folded
//! into a tagged skip list instead of aborting the batch; only an
//! undecodable image or an unavailable backbone escapes the call.

use crate::error::{PipelineError, Result};
use crate::gradcam::generate_attention_map;
use crate::infer::decode;
use crate::preprocess::{preprocess, PreprocessedImage};
use crate::types::{ProfileReport, SkipReason, SkippedTask, TaskReport};
use retina_model_cache::{LoadedModel, ModelCache, ModelCacheError, TaskSpec, TASKS};
use std::path::Path;
use std::time::Instant;

/// Run every registered task against one fundus image.
pub fn run_full_profile(cache: &ModelCache, image_path: &Path) -> Result<ProfileReport> {
    run_profile_with_deadline(cache, image_path, None)
}

/// Like [`run_full_profile`], but stops issuing per-task work once the
/// deadline passes, reporting the remaining tasks as skipped. Work
/// already in flight for a task is finished, not cancelled.
pub fn run_profile_with_deadline(
    cache: &ModelCache,
    image_path: &Path,
    deadline: Option<Instant>,
) -> Result<ProfileReport> {
    let pre = preprocess(image_path)?;
    // Resolve the backbone up front so a broken checkpoint directory
    // fails once instead of producing ten identical skips.
    cache.get_backbone().map_err(PipelineError::Cache)?;

    log::info!(
        "Running full profile for '{}' ({} tasks)",
        pre.stem,
        TASKS.len()
    );
    let mut report = ProfileReport::default();
    for spec in &TASKS {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            log::warn!("Deadline exceeded before task '{}', stopping", spec.name);
            report.skipped.push(SkippedTask {
                task: spec.name.to_string(),
                reason: SkipReason::DeadlineExceeded,
            });
            continue;
        }
        match run_task(cache, spec, &pre) {
            Ok(task_report) => report.completed.push(task_report),
            Err(reason) => report.skipped.push(SkippedTask {
                task: spec.name.to_string(),
                reason,
            }),
        }
    }
    log::info!(
        "Profile for '{}' done: {} completed, {} skipped",
        pre.stem,
        report.completed.len(),
        report.skipped.len()
    );
    Ok(report)
}

/// One task end to end. A task is all-or-nothing: if the heatmap fails,
/// the prediction is withheld too, so no partial entries reach callers.
fn run_task(
    cache: &ModelCache,
    spec: &'static TaskSpec,
    pre: &PreprocessedImage,
) -> std::result::Result<TaskReport, SkipReason> {
    let model = cache.load(spec.name).map_err(|err| match err {
        ModelCacheError::WeightsNotFound { .. } => {
            log::info!("Skipping task '{}': no checkpoint deployed", spec.name);
            SkipReason::WeightsNotFound
        }
        other => {
            log::error!("Skipping task '{}': {other}", spec.name);
            SkipReason::ModelLoad {
                detail: other.to_string(),
            }
        }
    })?;

    let (prediction, target, report_path) = infer_and_explain(cache, &model, pre)?;
    log::debug!(
        "Task '{}' predicted {prediction:?} (saliency target {target})",
        spec.name
    );
    Ok(TaskReport {
        task: spec.name.to_string(),
        prediction,
        attention_map: report_path,
    })
}

fn infer_and_explain(
    cache: &ModelCache,
    model: &LoadedModel,
    pre: &PreprocessedImage,
) -> std::result::Result<(crate::types::Prediction, usize, std::path::PathBuf), SkipReason> {
    // One traced forward serves both the prediction and the saliency
    // backward, since the backbone output is task-independent.
    let (pooled, trace) = model.backbone.forward_traced(&pre.tensor).map_err(|e| {
        log::error!("Skipping task '{}': inference failed: {e}", model.task.name);
        SkipReason::Inference {
            detail: e.to_string(),
        }
    })?;
    let logits = model.head.forward(&pooled);
    let (prediction, target) = decode(model.task, &logits);

    let path = generate_attention_map(
        model,
        &trace,
        target,
        &pre.rgb,
        &pre.stem,
        &cache.config().output_dir,
    )
    .map_err(|e| {
        log::error!(
            "Skipping task '{}': heatmap generation failed: {e}",
            model.task.name
        );
        SkipReason::Explainability {
            detail: e.to_string(),
        }
    })?;
    Ok((prediction, target, path))
}
