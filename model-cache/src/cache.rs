//! Lazy, thread-safe model cache.
//!
//! The backbone (the expensive part) is loaded at most once per cache and
//! shared by every task. Task heads load on first request and stay
//! resident afterwards, so repeated profile runs pay the checkpoint I/O
//! exactly once per task.

use crate::error::{ModelCacheError, Result};
use crate::head::ClassifierHead;
use crate::tasks::{task_spec, TaskSpec, TASKS};
use common::config::{Device, EngineConfig};
use common::constants::{head_checkpoint_name, BACKBONE_CONFIG_FILE, BACKBONE_WEIGHTS_FILE};
use retina_vit::{Backbone, ViTConfig, ViTWeights};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// A task ready to serve: its spec, its head, and the shared backbone.
#[derive(Debug)]
pub struct LoadedModel {
    pub task: &'static TaskSpec,
    pub backbone: Arc<Backbone>,
    pub head: ClassifierHead,
}

/// One cache instance per engine. All methods take `&self`; the cache is
/// shared across threads behind an `Arc`.
pub struct ModelCache {
    config: EngineConfig,
    device: Device,
    backbone: Mutex<Option<Arc<Backbone>>>,
    models: RwLock<HashMap<String, Arc<LoadedModel>>>,
    // Serializes slow-path loads so concurrent first requests for the
    // same task do the checkpoint I/O once, not N times.
    load_lock: Mutex<()>,
}

impl ModelCache {
    pub fn new(config: EngineConfig) -> Self {
        let device = config.device.resolve();
        log::info!(
            "Model cache initialized (checkpoints: {}, device: {device})",
            config.checkpoint_dir.display()
        );
        Self {
            config,
            device,
            backbone: Mutex::new(None),
            models: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// The shared backbone, loading it on first call.
    ///
    /// Load failures are not cached, so a fixed checkpoint directory can
    /// succeed on a later call without rebuilding the cache.
    pub fn get_backbone(&self) -> Result<Arc<Backbone>> {
        let mut slot = self
            .backbone
            .lock()
            .map_err(|_| ModelCacheError::BackboneUnavailable("lock poisoned".to_string()))?;
        if let Some(backbone) = slot.as_ref() {
            return Ok(Arc::clone(backbone));
        }

        let config_path = self.config.checkpoint_dir.join(BACKBONE_CONFIG_FILE);
        let weights_path = self.config.checkpoint_dir.join(BACKBONE_WEIGHTS_FILE);
        log::info!("Loading backbone from {}", weights_path.display());

        let vit_config = ViTConfig::from_file(&config_path)
            .map_err(|e| ModelCacheError::BackboneUnavailable(e.to_string()))?;
        let weights = ViTWeights::load(vit_config, &weights_path)
            .map_err(|e| ModelCacheError::BackboneUnavailable(e.to_string()))?;
        let backbone = Arc::new(
            Backbone::new(weights)
                .map_err(|e| ModelCacheError::BackboneUnavailable(e.to_string()))?,
        );
        *slot = Some(Arc::clone(&backbone));
        log::info!(
            "Backbone ready ({} layers, hidden {})",
            backbone.config().num_layers,
            backbone.config().hidden_size
        );
        Ok(backbone)
    }

    /// Fetch the model for a task, loading its head on first use.
    pub fn load(&self, task_name: &str) -> Result<Arc<LoadedModel>> {
        let task = task_spec(task_name)?;

        if let Some(model) = self.lookup(task.name)? {
            return Ok(model);
        }

        let _guard = self
            .load_lock
            .lock()
            .map_err(|_| ModelCacheError::ModelLoad {
                task: task.name.to_string(),
                reason: "load lock poisoned".to_string(),
            })?;
        // Another thread may have finished the load while we waited.
        if let Some(model) = self.lookup(task.name)? {
            return Ok(model);
        }

        let backbone = self.get_backbone()?;
        let head_path = self
            .config
            .checkpoint_dir
            .join(head_checkpoint_name(task.name));
        log::debug!(
            "Loading head for task '{}' from {}",
            task.name,
            head_path.display()
        );
        let head = ClassifierHead::load(task, backbone.config().hidden_size, &head_path)?;

        let model = Arc::new(LoadedModel {
            task,
            backbone,
            head,
        });
        self.models
            .write()
            .map_err(|_| ModelCacheError::ModelLoad {
                task: task.name.to_string(),
                reason: "cache lock poisoned".to_string(),
            })?
            .insert(task.name.to_string(), Arc::clone(&model));
        log::info!("Loaded model for task '{}'", task.name);
        Ok(model)
    }

    /// Eagerly load every task, returning the ones that failed.
    ///
    /// A missing checkpoint is normal while a task is not yet deployed
    /// and is logged at info; anything else gets an error line.
    pub fn preload_all(&self) -> Vec<(&'static str, ModelCacheError)> {
        let mut failures = Vec::new();
        for spec in &TASKS {
            match self.load(spec.name) {
                Ok(_) => {}
                Err(err @ ModelCacheError::WeightsNotFound { .. }) => {
                    log::info!("Skipping preload of '{}': {err}", spec.name);
                    failures.push((spec.name, err));
                }
                Err(err) => {
                    log::error!("Preload of '{}' failed: {err}", spec.name);
                    failures.push((spec.name, err));
                }
            }
        }
        failures
    }

    fn lookup(&self, task_name: &str) -> Result<Option<Arc<LoadedModel>>> {
        let map = self.models.read().map_err(|_| ModelCacheError::ModelLoad {
            task: task_name.to_string(),
            reason: "cache lock poisoned".to_string(),
        })?;
        Ok(map.get(task_name).cloned())
    }
}
