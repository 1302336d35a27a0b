//! Model loading, checkpoints and the shared model cache
//!
//! Checkpoints are single safetensors files holding the BDH parameters
//! (`E`, `Dx`, `Dy`, `readout`, `embed.weight`, optionally `pos_embed.weight`).
//! The model dimensions travel in the safetensors metadata under
//! [`CONFIG_METADATA_KEY`]; files without it fall back to a sibling
//! `config.json`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BdhConfig;
use crate::error::ExplorerError;
use crate::forward_bdh::{BdhModel, BdhParameters};

/// Metadata key holding the JSON-encoded [`BdhConfig`]
pub const CONFIG_METADATA_KEY: &str = "bdh_config";
/// Weights file name inside a hub repository
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// Sibling config file name
pub const CONFIG_FILE: &str = "config.json";

/// Pick the compute device (tries CUDA unless `force_cpu`, falls back to CPU)
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Short device label for reports
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Where the model parameters come from
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// Seeded random initialisation (untrained)
    Random { config: BdhConfig, seed: u64 },
    /// Local safetensors checkpoint
    Checkpoint(PathBuf),
    /// Hugging Face hub repository holding `model.safetensors`
    Hub { repo: String, revision: Option<String> },
}

impl ModelSource {
    /// Build the model on `device`
    pub fn load(&self, device: &Device) -> Result<BdhModel> {
        match self {
            ModelSource::Random { config, seed } => BdhModel::random(config.clone(), *seed, device),
            ModelSource::Checkpoint(path) => load_checkpoint(path, device),
            ModelSource::Hub { repo, revision } => load_from_hub(repo, revision.as_deref(), device),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Random { seed, .. } => write!(f, "random (seed {seed})"),
            ModelSource::Checkpoint(path) => write!(f, "checkpoint {}", path.display()),
            ModelSource::Hub { repo, revision } => match revision {
                Some(rev) => write!(f, "hub {repo}@{rev}"),
                None => write!(f, "hub {repo}"),
            },
        }
    }
}

/// Write a model to a safetensors checkpoint with its config in the metadata
pub fn save_checkpoint(model: &BdhModel, path: &Path) -> Result<()> {
    let config_json = serde_json::to_string(model.config())?;
    let metadata = Some(HashMap::from([(CONFIG_METADATA_KEY.to_string(), config_json)]));

    let tensors = model
        .params()
        .named_tensors()
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_device(&Device::Cpu)?.contiguous()?)))
        .collect::<Result<Vec<_>>>()?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    safetensors::serialize_to_file(tensors, &metadata, path)
        .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
    info!(
        "Saved checkpoint to {} ({} parameters)",
        path.display(),
        model.params().count()
    );
    Ok(())
}

/// Config stored in a checkpoint's safetensors metadata, if any
pub fn metadata_config(path: &Path) -> Result<Option<BdhConfig>> {
    let bytes = std::fs::read(path)
        .map_err(|e| ExplorerError::ParameterLoad(format!("cannot read {}: {e}", path.display())))?;
    let (_, header) = safetensors::SafeTensors::read_metadata(&bytes).map_err(|e| {
        ExplorerError::ParameterLoad(format!("{} is not a safetensors file: {e}", path.display()))
    })?;
    header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(CONFIG_METADATA_KEY))
        .map(|json| BdhConfig::from_json(json))
        .transpose()
}

/// Resolve a checkpoint's config: metadata first, then sibling `config.json`
pub fn checkpoint_config(path: &Path) -> Result<BdhConfig> {
    if let Some(config) = metadata_config(path)? {
        return Ok(config);
    }
    let sibling = path.with_file_name(CONFIG_FILE);
    if sibling.is_file() {
        debug!("No config in metadata, reading {}", sibling.display());
        return read_config_file(&sibling);
    }
    Err(ExplorerError::ParameterLoad(format!(
        "{} has no `{CONFIG_METADATA_KEY}` metadata and no sibling {CONFIG_FILE}",
        path.display()
    ))
    .into())
}

fn read_config_file(path: &Path) -> Result<BdhConfig> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| ExplorerError::ParameterLoad(format!("cannot read {}: {e}", path.display())))?;
    BdhConfig::from_json(&json)
}

fn build_from_file(weights: &Path, config: BdhConfig, device: &Device) -> Result<BdhModel> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device) }
        .map_err(|e| ExplorerError::ParameterLoad(format!("{}: {e}", weights.display())))?;
    let params = BdhParameters::load(&vb, &config)?;
    info!("Loaded {} parameters", params.count());
    BdhModel::new(config, params, device)
}

/// Load a local checkpoint
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<BdhModel> {
    if !path.is_file() {
        return Err(ExplorerError::ParameterLoad(format!("checkpoint not found: {}", path.display())).into());
    }
    info!("Loading checkpoint: {}", path.display());
    let config = checkpoint_config(path)?;
    build_from_file(path, config, device)
}

/// Download and load `model.safetensors` from a hub repository
pub fn load_from_hub(repo_id: &str, revision: Option<&str>, device: &Device) -> Result<BdhModel> {
    info!("Loading BDH from hub: {}", repo_id);
    let api = Api::new()?;
    let repo = match revision {
        Some(rev) => Repo::with_revision(repo_id.to_string(), RepoType::Model, rev.to_string()),
        None => Repo::new(repo_id.to_string(), RepoType::Model),
    };
    let repo = api.repo(repo);

    let weights = repo
        .get(WEIGHTS_FILE)
        .with_context(|| format!("Failed to download {WEIGHTS_FILE}"))?;
    let config = match metadata_config(&weights)? {
        Some(config) => config,
        None => {
            let config_path = repo
                .get(CONFIG_FILE)
                .with_context(|| format!("Failed to download {CONFIG_FILE}"))?;
            read_config_file(&config_path)?
        }
    };
    build_from_file(&weights, config, device)
}

/// Lazily loaded model, shared read-only once loaded
///
/// The first [`get`](ModelCache::get) loads under the lock; later calls clone
/// the `Arc`. A failed load leaves the cache empty so the next call retries.
#[derive(Debug)]
pub struct ModelCache {
    source: ModelSource,
    device: Device,
    model: Mutex<Option<Arc<BdhModel>>>,
}

impl ModelCache {
    pub fn new(source: ModelSource, device: Device) -> Self {
        Self {
            source,
            device,
            model: Mutex::new(None),
        }
    }

    /// The loaded model, loading it on first use
    pub fn get(&self) -> Result<Arc<BdhModel>> {
        let mut slot = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("model cache lock poisoned"))?;
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }
        let model = match self.source.load(&self.device) {
            Ok(model) => Arc::new(model),
            Err(e) => {
                warn!("Model load from {} failed: {e:#}", self.source);
                return Err(e);
            }
        };
        *slot = Some(Arc::clone(&model));
        Ok(model)
    }

    pub fn is_loaded(&self) -> bool {
        self.model.lock().map(|m| m.is_some()).unwrap_or(false)
    }

    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Dimensions and size of a loaded model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub n_heads: usize,
    pub n_neurons: usize,
    pub neurons_per_head: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub use_rope: bool,
    pub use_abs_pos: bool,
    pub parameter_count: usize,
    pub device: &'static str,
}

impl ModelSummary {
    pub fn of(model: &BdhModel) -> Self {
        let config = model.config();
        Self {
            vocab_size: config.vocab_size,
            max_seq_len: config.max_seq_len,
            n_heads: config.n_heads,
            n_neurons: config.n_neurons,
            neurons_per_head: config.neurons_per_head(),
            d_model: config.d_model,
            n_layers: config.n_layers,
            use_rope: config.use_rope,
            use_abs_pos: config.use_abs_pos,
            parameter_count: model.params().count(),
            device: device_label(model.device()),
        }
    }
}
