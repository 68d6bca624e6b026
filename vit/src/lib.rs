//! ViT-Base backbone for the retina engine, implemented directly on
//! `ndarray`.
//!
//! The crate owns everything model-shaped below the task heads:
//! - architecture configuration with derived, validated patch geometry
//! - safetensors weight I/O and seeded initialization
//! - the frozen evaluation-mode forward pass
//! - a traced forward plus analytic backward for the saliency generator,
//!   which needs gradients of the pooled features with respect to the
//!   final encoder block's pre-attention LayerNorm output.
//!
//! Nothing here knows about clinical tasks; heads and caching live in
//! `retina-model-cache`.

pub mod config;
pub mod error;
pub mod math;
pub mod model;
pub mod weights;

pub use config::{grid_side_for_tokens, ViTConfig};
pub use error::{Result, ViTError};
pub use model::{Backbone, SaliencyTrace};
pub use weights::{EncoderLayerWeights, ViTWeights};
