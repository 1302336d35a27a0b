//! Model and analysis configuration
//!
//! [`BdhConfig`] describes the model dimensions and is stored alongside every
//! checkpoint. [`ExplorerConfig`] holds the knobs of the analysis pipeline
//! (thresholds, solver weights, payload caps).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ExplorerError;

/// BDH model dimensions (matches the checkpoint's parameter dictionary)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BdhConfig {
    /// Vocabulary size
    #[serde(rename = "V", alias = "vocab_size", default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Maximum sequence length
    #[serde(rename = "T", alias = "max_seq_len", default = "default_max_seq_len")]
    pub max_seq_len: usize,
    /// Number of heads
    #[serde(rename = "H", alias = "n_heads", default = "default_n_heads")]
    pub n_heads: usize,
    /// Number of neurons
    #[serde(rename = "N", alias = "n_neurons", default = "default_n_neurons")]
    pub n_neurons: usize,
    /// Latent (embedding) dimension
    #[serde(rename = "D", alias = "d_model", default = "default_d_model")]
    pub d_model: usize,
    /// Number of layers
    #[serde(rename = "L", alias = "n_layers", default = "default_n_layers")]
    pub n_layers: usize,
    /// Only used in training; inference never drops
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default = "default_use_rope")]
    pub use_rope: bool,
    #[serde(default)]
    pub use_abs_pos: bool,
}

fn default_vocab_size() -> usize {
    5
}

fn default_max_seq_len() -> usize {
    100
}

fn default_n_heads() -> usize {
    4
}

fn default_n_neurons() -> usize {
    2048
}

fn default_d_model() -> usize {
    64
}

fn default_n_layers() -> usize {
    12
}

fn default_dropout() -> f64 {
    0.1
}

fn default_use_rope() -> bool {
    true
}

impl Default for BdhConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            max_seq_len: default_max_seq_len(),
            n_heads: default_n_heads(),
            n_neurons: default_n_neurons(),
            d_model: default_d_model(),
            n_layers: default_n_layers(),
            dropout: default_dropout(),
            use_rope: default_use_rope(),
            use_abs_pos: false,
        }
    }
}

impl BdhConfig {
    /// Neurons per head (N / H)
    pub fn neurons_per_head(&self) -> usize {
        self.n_neurons / self.n_heads
    }

    /// Check that the dimensions describe a constructible model
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("V", self.vocab_size),
            ("T", self.max_seq_len),
            ("H", self.n_heads),
            ("N", self.n_neurons),
            ("D", self.d_model),
            ("L", self.n_layers),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(ExplorerError::ParameterLoad(format!(
                    "config dimension {name} must be positive"
                ))
                .into());
            }
        }
        if self.n_neurons % self.n_heads != 0 {
            return Err(ExplorerError::ParameterLoad(format!(
                "N={} is not divisible by H={}",
                self.n_neurons, self.n_heads
            ))
            .into());
        }
        if self.use_rope && self.neurons_per_head() % 2 != 0 {
            return Err(ExplorerError::ParameterLoad(format!(
                "RoPE needs an even head width, got N/H={}",
                self.neurons_per_head()
            ))
            .into());
        }
        Ok(())
    }

    /// Parse from a JSON string and validate
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ExplorerError::ParameterLoad(format!("bad model config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// Analysis pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Default edge magnitude cutoff for topology extraction
    pub topology_threshold: f32,
    /// Percentile of the live degree distribution used as the hub cutoff
    pub hub_percentile: f64,
    /// Weight of the model score in the greedy solver
    pub heuristic_weight: f32,
    /// Greedy solver step bound, as a multiple of the grid area
    pub step_bound_factor: usize,
    /// Attention edges kept per layer in attention-flow summaries
    pub attention_top_k: usize,
    /// Mean `y` activation above which a neuron is tied to a token
    pub concept_threshold: f32,
    /// Payload caps applied before results leave the core
    pub bounds: BoundsConfig,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            topology_threshold: 0.1,
            hub_percentile: 90.0,
            heuristic_weight: 0.1,
            step_bound_factor: 4,
            attention_top_k: 30,
            concept_threshold: 0.5,
            bounds: BoundsConfig::default(),
        }
    }
}

/// Per-axis caps for the bounding layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundsConfig {
    /// Max neurons per activation row
    pub max_neurons: usize,
    /// Max token positions per layer
    pub max_tokens: usize,
    /// Max layers per snapshot
    pub max_layers: usize,
    /// Max edges per topology graph
    pub max_edges: usize,
    /// Max nodes per topology graph
    pub max_nodes: usize,
}

impl Default for BoundsConfig {
    fn default() -> Self {
        Self {
            max_neurons: 256,
            max_tokens: 128,
            max_layers: 64,
            max_edges: 5000,
            max_nodes: 4096,
        }
    }
}

impl ExplorerConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.topology_threshold.is_finite() || self.topology_threshold < 0.0 {
            return Err(ExplorerError::invalid_argument(
                "topology_threshold",
                format!("must be finite and >= 0, got {}", self.topology_threshold),
            )
            .into());
        }
        if !(0.0..=100.0).contains(&self.hub_percentile) {
            return Err(ExplorerError::invalid_argument(
                "hub_percentile",
                format!("must lie in [0, 100], got {}", self.hub_percentile),
            )
            .into());
        }
        if !self.heuristic_weight.is_finite() {
            return Err(ExplorerError::invalid_argument(
                "heuristic_weight",
                "must be finite",
            )
            .into());
        }
        if !self.concept_threshold.is_finite() {
            return Err(ExplorerError::invalid_argument(
                "concept_threshold",
                "must be finite",
            )
            .into());
        }
        if self.step_bound_factor == 0 {
            return Err(ExplorerError::invalid_argument(
                "step_bound_factor",
                "must be at least 1",
            )
            .into());
        }
        let caps = [
            ("bounds.max_neurons", self.bounds.max_neurons),
            ("bounds.max_tokens", self.bounds.max_tokens),
            ("bounds.max_layers", self.bounds.max_layers),
            ("bounds.max_edges", self.bounds.max_edges),
            ("bounds.max_nodes", self.bounds.max_nodes),
        ];
        for (name, cap) in caps {
            if cap == 0 {
                return Err(ExplorerError::invalid_argument(name, "cap must be at least 1").into());
            }
        }
        Ok(())
    }
}
