//! File-name patterns and fixed preprocessing constants.
//!
//! Kept as constants (not config knobs) because the trained checkpoints
//! bake these values in: a checkpoint produced for 224x224 ImageNet-style
//! normalization is only valid when served the same way.

/// Square input resolution every task model was trained at.
pub const IMG_SIZE: u32 = 224;

/// Per-channel normalization mean (ImageNet convention, RGB order).
pub const NORM_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// Per-channel normalization std (ImageNet convention, RGB order).
pub const NORM_STD: [f32; 3] = [0.229, 0.224, 0.225];

// Checkpoint layout inside the configured checkpoint directory.
pub const BACKBONE_WEIGHTS_FILE: &str = "vit_backbone.safetensors";
pub const BACKBONE_CONFIG_FILE: &str = "vit_backbone.json";

/// Per-task head checkpoint: `best_model_{task}.safetensors`.
pub fn head_checkpoint_name(task: &str) -> String {
    format!("best_model_{task}.safetensors")
}

/// Heatmap artifact: `{image-stem}_{task}_cam.png`. Pure function of its
/// inputs; reruns on the same image and task overwrite the same file.
pub fn attention_map_name(image_stem: &str, task: &str) -> String {
    format!("{image_stem}_{task}_cam.png")
}
