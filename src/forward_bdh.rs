//! BDH (Baby Dragon Hatchling) forward pass with per-layer activation capture
//!
//! Custom implementation that runs layer-by-layer so each layer's sparse
//! neuron activations and attention scores can be recorded.
//!
//! Per layer, with `v` the residual stream `[B, 1, T, D]`:
//! - `x = relu(v Dx)`: sparse context activations `[B, H, T, N/H]`
//! - `a = tril(rope(x) rope(x)ᵀ, -1) v`: linear attention, no softmax
//! - `y = relu(ln(a) Dy) * x`: gated neuron activations
//! - `v = ln(v + ln(y E))`
//!
//! Key differences from transformer backends:
//! - Attention queries and keys are the same neuron-space tensor
//! - Parameter-free LayerNorm, no MLP
//! - All layers share one set of parameters

use anyhow::{Context, Result};
use candle_core::{Device, IndexOp, Module, Tensor, D};
use candle_nn::{Embedding, VarBuilder};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

use crate::config::BdhConfig;
use crate::error::ExplorerError;
use crate::masks::MaskCache;
use crate::tracker::{ActivationTracker, LayerActivations};

const LAYER_NORM_EPS: f64 = 1e-5;
const ROPE_THETA: f64 = 65536.0;
const INIT_STD: f64 = 0.02;

/// Checkpoint tensor names
pub const NEURON_EMBEDDING: &str = "E";
pub const CONTEXT_PROJECTION: &str = "Dx";
pub const OUTPUT_PROJECTION: &str = "Dy";
pub const READOUT: &str = "readout";
pub const TOKEN_EMBEDDING: &str = "embed.weight";
pub const POSITION_EMBEDDING: &str = "pos_embed.weight";

/// Which per-head projection set to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionSet {
    /// `Dx`: drives the context activations
    Context,
    /// `Dy`: drives the output (neuron) activations
    Output,
}

/// Rotary position embedding with pairwise-shared frequencies
///
/// Neuron pairs `(2k, 2k + 1)` rotate together at `theta^(-2k / width)`.
/// Tables are computed per call, so sequence length is not capped.
struct RotaryEmbedding {
    inv_freq: Tensor,
}

impl RotaryEmbedding {
    fn new(width: usize, theta: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..width)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / width as f64)) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;
        Ok(Self { inv_freq })
    }

    /// Rotate `x` of shape `[B, H, T, width]`
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _h, seq_len, width) = x.dims4()?;
        let positions: Vec<f32> = (0..seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, x.device())?;

        // [seq_len, width/2]
        let freqs = positions
            .unsqueeze(1)?
            .matmul(&self.inv_freq.unsqueeze(0)?)?
            .to_dtype(x.dtype())?;
        let cos = freqs.cos()?.unsqueeze(0)?;
        let sin = freqs.sin()?.unsqueeze(0)?;

        let x_pairs = x.reshape(((), seq_len, width / 2, 2))?;
        let x0 = x_pairs.i((.., .., .., 0))?;
        let x1 = x_pairs.i((.., .., .., 1))?;

        let out0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
        let out1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;

        let out = Tensor::stack(&[&out0, &out1], D::Minus1)?;
        Ok(out.reshape(x.shape())?)
    }
}

/// LayerNorm over the last dimension without affine parameters
fn layer_norm(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let x_centered = x.broadcast_sub(&mean)?;
    let var = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
    Ok(x_centered.broadcast_div(&(var + LAYER_NORM_EPS)?.sqrt()?)?)
}

/// The raw parameter tensors of a BDH model
#[derive(Debug, Clone)]
pub struct BdhParameters {
    /// Token embedding `[V, D]`
    pub token_embedding: Tensor,
    /// Absolute position embedding `[T, D]`, only with `use_abs_pos`
    pub position_embedding: Option<Tensor>,
    /// Neuron embedding `E`, `[N, D]`
    pub neuron_embedding: Tensor,
    /// Context projection `Dx`, `[H, D, N/H]`
    pub context_projection: Tensor,
    /// Output projection `Dy`, `[H, D, N/H]`
    pub output_projection: Tensor,
    /// Readout `[D, V]`
    pub readout: Tensor,
}

impl BdhParameters {
    /// Seeded random initialisation (N(0, 0.02) everywhere)
    pub fn random(config: &BdhConfig, seed: u64, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, INIT_STD as f32)?;
        let mut randn = |shape: &[usize]| -> Result<Tensor> {
            let count: usize = shape.iter().product();
            let data: Vec<f32> = (0..count).map(|_| normal.sample(&mut rng)).collect();
            Ok(Tensor::from_vec(data, shape, device)?)
        };

        let (v, t, h, n, d) = (
            config.vocab_size,
            config.max_seq_len,
            config.n_heads,
            config.n_neurons,
            config.d_model,
        );
        let nh = config.neurons_per_head();

        Ok(Self {
            token_embedding: randn(&[v, d])?,
            position_embedding: if config.use_abs_pos {
                Some(randn(&[t, d])?)
            } else {
                None
            },
            neuron_embedding: randn(&[n, d])?,
            context_projection: randn(&[h, d, nh])?,
            output_projection: randn(&[h, d, nh])?,
            readout: randn(&[d, v])?,
        })
    }

    /// Load from a VarBuilder, checking every shape against `config`
    pub fn load(vb: &VarBuilder, config: &BdhConfig) -> Result<Self> {
        config.validate()?;
        let (v, t, h, n, d) = (
            config.vocab_size,
            config.max_seq_len,
            config.n_heads,
            config.n_neurons,
            config.d_model,
        );
        let nh = config.neurons_per_head();
        let get = |shape: &[usize], name: &str| -> Result<Tensor> {
            vb.get(shape, name).map_err(|e| {
                ExplorerError::ParameterLoad(format!("tensor `{name}`: {e}")).into()
            })
        };

        Ok(Self {
            token_embedding: get(&[v, d], TOKEN_EMBEDDING)?,
            position_embedding: if config.use_abs_pos {
                Some(get(&[t, d], POSITION_EMBEDDING)?)
            } else {
                None
            },
            neuron_embedding: get(&[n, d], NEURON_EMBEDDING)?,
            context_projection: get(&[h, d, nh], CONTEXT_PROJECTION)?,
            output_projection: get(&[h, d, nh], OUTPUT_PROJECTION)?,
            readout: get(&[d, v], READOUT)?,
        })
    }

    /// Named tensors in checkpoint layout
    pub fn named_tensors(&self) -> Vec<(&'static str, &Tensor)> {
        let mut tensors = vec![
            (TOKEN_EMBEDDING, &self.token_embedding),
            (NEURON_EMBEDDING, &self.neuron_embedding),
            (CONTEXT_PROJECTION, &self.context_projection),
            (OUTPUT_PROJECTION, &self.output_projection),
            (READOUT, &self.readout),
        ];
        if let Some(pos) = &self.position_embedding {
            tensors.push((POSITION_EMBEDDING, pos));
        }
        tensors
    }

    /// Total number of scalar parameters
    pub fn count(&self) -> usize {
        self.named_tensors()
            .iter()
            .map(|(_, t)| t.elem_count())
            .sum()
    }
}

/// BDH model with per-layer activation capture
///
/// Parameters are immutable after construction; the model is `Send + Sync`
/// and is meant to be shared behind an `Arc`.
#[derive(Debug)]
pub struct BdhModel {
    config: BdhConfig,
    params: BdhParameters,
    embed: Embedding,
    pos_embed: Option<Embedding>,
    rotary: Option<RotaryEmbedding>,
    masks: MaskCache,
    device: Device,
}

impl std::fmt::Debug for RotaryEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotaryEmbedding")
            .field("width", &(self.inv_freq.elem_count() * 2))
            .finish()
    }
}

impl BdhModel {
    /// Build a model from already-loaded parameters
    pub fn new(config: BdhConfig, params: BdhParameters, device: &Device) -> Result<Self> {
        config.validate()?;
        let embed = Embedding::new(params.token_embedding.clone(), config.d_model);
        let pos_embed = params
            .position_embedding
            .as_ref()
            .map(|p| Embedding::new(p.clone(), config.d_model));
        let rotary = if config.use_rope {
            Some(RotaryEmbedding::new(
                config.neurons_per_head(),
                ROPE_THETA,
                device,
            )?)
        } else {
            None
        };

        info!(
            "BDH model ready: {} layers, {} heads, {} neurons, d={}, vocab={}",
            config.n_layers, config.n_heads, config.n_neurons, config.d_model, config.vocab_size
        );

        Ok(Self {
            config,
            params,
            embed,
            pos_embed,
            rotary,
            masks: MaskCache::new(),
            device: device.clone(),
        })
    }

    /// Randomly initialised model (untrained)
    pub fn random(config: BdhConfig, seed: u64, device: &Device) -> Result<Self> {
        info!("Initialising random BDH parameters (seed {})", seed);
        let params = BdhParameters::random(&config, seed, device)?;
        Self::new(config, params, device)
    }

    pub fn config(&self) -> &BdhConfig {
        &self.config
    }

    pub fn params(&self) -> &BdhParameters {
        &self.params
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn n_layers(&self) -> usize {
        self.config.n_layers
    }

    pub fn n_heads(&self) -> usize {
        self.config.n_heads
    }

    pub fn n_neurons(&self) -> usize {
        self.config.n_neurons
    }

    pub fn d_model(&self) -> usize {
        self.config.d_model
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    /// Neuron embedding `E`, `[N, D]`
    pub fn neuron_embedding(&self) -> &Tensor {
        &self.params.neuron_embedding
    }

    /// Per-head projection set, `[H, D, N/H]`
    pub fn projection(&self, set: ProjectionSet) -> &Tensor {
        match set {
            ProjectionSet::Context => &self.params.context_projection,
            ProjectionSet::Output => &self.params.output_projection,
        }
    }

    /// Validate token ids and build a `[1, T]` input tensor
    pub fn input_tensor(&self, tokens: &[u32]) -> Result<Tensor> {
        if tokens.is_empty() {
            return Err(ExplorerError::invalid_argument("tokens", "sequence is empty").into());
        }
        if let Some((pos, tok)) = tokens
            .iter()
            .enumerate()
            .find(|(_, &t)| t as usize >= self.config.vocab_size)
        {
            return Err(ExplorerError::invalid_argument(
                "tokens",
                format!(
                    "token {tok} at position {pos} is outside the vocabulary (V={})",
                    self.config.vocab_size
                ),
            )
            .into());
        }
        if self.pos_embed.is_some() && tokens.len() > self.config.max_seq_len {
            return Err(ExplorerError::invalid_argument(
                "tokens",
                format!(
                    "{} tokens exceed the absolute position table (T={})",
                    tokens.len(),
                    self.config.max_seq_len
                ),
            )
            .into());
        }
        Ok(Tensor::new(tokens, &self.device)?.unsqueeze(0)?)
    }

    /// Plain forward pass; returns logits `[B, T, V]`
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let mut tracker = ActivationTracker::new();
        self.forward_tracked(input_ids, &mut tracker)
    }

    /// Forward pass that records every layer into `tracker` when it is enabled
    ///
    /// Only batch element 0 is recorded. The tracker is appended to, never
    /// reset; callers reset or re-enable it between distinct calls.
    pub fn forward_tracked(
        &self,
        input_ids: &Tensor,
        tracker: &mut ActivationTracker,
    ) -> Result<Tensor> {
        let (b, seq_len) = input_ids.dims2()?;
        let n = self.config.n_neurons;

        let mut hidden = self.embed.forward(input_ids)?;
        if let Some(pos_embed) = &self.pos_embed {
            let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?;
            hidden = hidden.broadcast_add(&pos_embed.forward(&positions)?)?;
        }
        // [B, 1, T, D]
        let mut v = layer_norm(&hidden)?.unsqueeze(1)?;

        let mask = self
            .masks
            .strict_causal(seq_len, &self.device, v.dtype())?;

        for layer in 0..self.config.n_layers {
            // [B, H, T, N/H]
            let x = v
                .broadcast_matmul(&self.params.context_projection)?
                .relu()?;

            let qr = match &self.rotary {
                Some(rotary) => rotary.apply(&x)?,
                None => x.clone(),
            };
            let kr_t = qr.t()?.contiguous()?;
            // [B, H, T, T]
            let scores = qr.contiguous()?.matmul(&kr_t)?.broadcast_mul(&mask)?;
            // [B, H, T, D]
            let a = scores.broadcast_matmul(&v)?;

            let y = layer_norm(&a)?
                .broadcast_matmul(&self.params.output_projection)?
                .relu()?
                .mul(&x)?;
            // Concatenate heads per position: [B, 1, T, N]
            let y = y.transpose(1, 2)?.contiguous()?.reshape((b, 1, seq_len, n))?;

            let delta = layer_norm(&y.broadcast_matmul(&self.params.neuron_embedding)?)?;
            v = layer_norm(&(v + delta)?)?;

            tracker.record(|| {
                Ok(LayerActivations {
                    context_vector: x
                        .i(0)?
                        .transpose(0, 1)?
                        .contiguous()?
                        .reshape((seq_len, n))?,
                    neuron_activations: y.i((0, 0))?,
                    output_activations: v.i((0, 0))?,
                    attention_scores: scores.i(0)?.mean(0)?,
                })
            })?;

            if (layer + 1) % 4 == 0 {
                debug!("Processed layer {}/{}", layer + 1, self.config.n_layers);
            }
        }

        let logits = v.squeeze(1)?.broadcast_matmul(&self.params.readout)?;
        Ok(logits)
    }

    /// Per-position argmax over logits `[1, T, V]`
    pub fn predictions(&self, logits: &Tensor) -> Result<Vec<u32>> {
        logits
            .i(0)?
            .argmax(D::Minus1)?
            .to_vec1::<u32>()
            .context("Failed to read predictions")
    }
}
