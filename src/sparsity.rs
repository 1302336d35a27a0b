//! Activation sparsity analysis
//!
//! Sparsity here is the fraction of strictly positive entries (the "active"
//! fraction), measured per layer for the context family `x` and the output
//! family `y` of an [`ActivationSnapshot`].
//!
//! Shape policy: every layer of a family must have the same `(tokens, neurons)`
//! shape, and both families must agree. Anything else is rejected with
//! [`ExplorerError::ShapeMismatch`]; nothing is truncated or padded.

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::Serialize;

use crate::bounding::{sample_owned, Sampled};
use crate::config::BoundsConfig;
use crate::error::ExplorerError;
use crate::stats::Summary;
use crate::tracker::ActivationSnapshot;

/// Per-layer sparsity of one activation family plus its aggregates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilySparsity {
    pub per_layer: Vec<f64>,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl FamilySparsity {
    fn from_layers(per_layer: Vec<f64>) -> Self {
        let summary = Summary::of(&per_layer);
        Self {
            per_layer,
            mean: summary.mean,
            std: summary.std,
            min: summary.min,
            max: summary.max,
        }
    }
}

/// Sparsity of both activation families for one tracked call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SparsityRecord {
    pub n_layers: usize,
    pub seq_len: usize,
    pub n_neurons: usize,
    /// Context-driven family (`x`)
    pub context: FamilySparsity,
    /// Output-driven family (`y`)
    pub output: FamilySparsity,
    /// Output-family sparsity per token position, averaged over layers
    pub output_per_token: Sampled<f64>,
}

/// Per-neuron view of the output family, averaged over layers and tokens
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeuronProfile {
    /// Fraction of (layer, token) cells where the neuron fired
    pub activation_frequency: Sampled<f32>,
    /// Mean activation value
    pub mean_activation: Sampled<f32>,
}

/// Descriptive statistics of one layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStatistics {
    pub layer: usize,
    pub context: ValueStatistics,
    pub output: ValueStatistics,
}

/// Value distribution of one activation tensor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueStatistics {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub sparsity: f64,
}

/// A family's layers as host matrices of identical shape
struct FamilyData {
    seq_len: usize,
    n_neurons: usize,
    /// Row-major `(seq_len, n_neurons)` buffer per layer
    layers: Vec<Vec<f32>>,
}

fn collect_family(tensors: &[&Tensor], name: &str) -> Result<FamilyData> {
    let mut shape: Option<(usize, usize)> = None;
    let mut layers = Vec::with_capacity(tensors.len());
    for (layer, tensor) in tensors.iter().enumerate() {
        let dims = tensor.dims2().map_err(|_| {
            ExplorerError::shape_mismatch(
                format!("layer {layer} {name}"),
                "rank 2 (tokens, neurons)",
                format!("{:?}", tensor.dims()),
            )
        })?;
        match shape {
            None => shape = Some(dims),
            Some(expected) if expected != dims => {
                return Err(ExplorerError::shape_mismatch(
                    format!("layer {layer} {name}"),
                    format!("{expected:?}"),
                    format!("{dims:?}"),
                )
                .into());
            }
            Some(_) => {}
        }
        layers.push(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?);
    }
    let (seq_len, n_neurons) = shape.unwrap_or((0, 0));
    Ok(FamilyData {
        seq_len,
        n_neurons,
        layers,
    })
}

/// Fraction of entries strictly greater than zero; 0.0 for an empty buffer
pub fn active_fraction(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|&&v| v > 0.0).count() as f64 / values.len() as f64
}

fn load_families(snapshot: &ActivationSnapshot) -> Result<(FamilyData, FamilyData)> {
    let context = collect_family(&snapshot.context_vectors(), "context_vector")?;
    let output = collect_family(&snapshot.neuron_activations(), "neuron_activations")?;
    if !snapshot.is_empty()
        && (context.seq_len, context.n_neurons) != (output.seq_len, output.n_neurons)
    {
        return Err(ExplorerError::shape_mismatch(
            "neuron_activations vs context_vector",
            format!("{:?}", (context.seq_len, context.n_neurons)),
            format!("{:?}", (output.seq_len, output.n_neurons)),
        )
        .into());
    }
    Ok((context, output))
}

/// Compute the sparsity record of a snapshot
///
/// `max_tokens` bounds the per-token list.
pub fn analyze_sparsity(snapshot: &ActivationSnapshot, max_tokens: usize) -> Result<SparsityRecord> {
    let (context, output) = load_families(snapshot)?;

    let context_per_layer: Vec<f64> = context.layers.iter().map(|l| active_fraction(l)).collect();
    let output_per_layer: Vec<f64> = output.layers.iter().map(|l| active_fraction(l)).collect();

    let n = output.n_neurons;
    let per_token: Vec<f64> = (0..output.seq_len)
        .map(|t| {
            let active: usize = output
                .layers
                .iter()
                .map(|l| l[t * n..(t + 1) * n].iter().filter(|&&v| v > 0.0).count())
                .sum();
            let total = output.layers.len() * n;
            if total == 0 {
                0.0
            } else {
                active as f64 / total as f64
            }
        })
        .collect();

    Ok(SparsityRecord {
        n_layers: snapshot.n_layers(),
        seq_len: output.seq_len,
        n_neurons: output.n_neurons,
        context: FamilySparsity::from_layers(context_per_layer),
        output: FamilySparsity::from_layers(output_per_layer),
        output_per_token: sample_owned(per_token, max_tokens),
    })
}

/// Per-neuron firing frequency and mean activation of the output family
pub fn neuron_profile(snapshot: &ActivationSnapshot, bounds: &BoundsConfig) -> Result<NeuronProfile> {
    let (_, output) = load_families(snapshot)?;
    let n = output.n_neurons;
    let cells = (output.layers.len() * output.seq_len) as f32;

    let mut fired = vec![0usize; n];
    let mut sum = vec![0f32; n];
    for layer in &output.layers {
        for row in layer.chunks_exact(n.max(1)) {
            for (j, &value) in row.iter().enumerate() {
                if value > 0.0 {
                    fired[j] += 1;
                }
                sum[j] += value;
            }
        }
    }

    let (frequency, mean): (Vec<f32>, Vec<f32>) = if cells == 0.0 {
        (vec![0.0; n], vec![0.0; n])
    } else {
        (
            fired.iter().map(|&c| c as f32 / cells).collect(),
            sum.iter().map(|&s| s / cells).collect(),
        )
    };

    Ok(NeuronProfile {
        activation_frequency: sample_owned(frequency, bounds.max_neurons),
        mean_activation: sample_owned(mean, bounds.max_neurons),
    })
}

/// A neuron tied to a token, with its mean activation for that token
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConceptNeuron {
    pub neuron_id: usize,
    pub avg_activation: f32,
}

/// Neurons whose mean `y` activation for `token` exceeds the threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenConcept {
    pub token: u32,
    /// Positions holding the token
    pub occurrences: usize,
    pub neurons: Sampled<ConceptNeuron>,
}

/// Map each token present in `tokens` to its concept neurons
///
/// For token `t`, a neuron's score is its `y` activation averaged over every
/// layer and every position holding `t`; neurons scoring strictly above
/// `threshold` are kept in ascending id order. Tokens are reported in
/// ascending id order, absent ones are skipped.
pub fn concept_neurons(
    snapshot: &ActivationSnapshot,
    tokens: &[u32],
    vocab_size: usize,
    threshold: f32,
    bounds: &BoundsConfig,
) -> Result<Vec<TokenConcept>> {
    if !threshold.is_finite() {
        return Err(ExplorerError::invalid_argument("threshold", "must be finite").into());
    }
    if let Some(&tok) = tokens.iter().find(|&&t| t as usize >= vocab_size) {
        return Err(ExplorerError::invalid_argument(
            "tokens",
            format!("token {tok} is outside the vocabulary (V={vocab_size})"),
        )
        .into());
    }
    let (_, output) = load_families(snapshot)?;
    if !snapshot.is_empty() && tokens.len() != output.seq_len {
        return Err(ExplorerError::shape_mismatch(
            "concept tokens",
            output.seq_len.to_string(),
            tokens.len(),
        )
        .into());
    }
    if snapshot.is_empty() {
        return Ok(Vec::new());
    }

    let n = output.n_neurons;
    let mut positions: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (pos, &tok) in tokens.iter().enumerate() {
        positions.entry(tok).or_default().push(pos);
    }

    Ok(positions
        .into_iter()
        .map(|(token, at)| {
            let mut sum = vec![0f32; n];
            for layer in &output.layers {
                for &pos in &at {
                    for (acc, &v) in sum.iter_mut().zip(&layer[pos * n..(pos + 1) * n]) {
                        *acc += v;
                    }
                }
            }
            let cells = (output.layers.len() * at.len()) as f32;
            let neurons: Vec<ConceptNeuron> = sum
                .into_iter()
                .enumerate()
                .map(|(neuron_id, s)| ConceptNeuron {
                    neuron_id,
                    avg_activation: s / cells,
                })
                .filter(|c| c.avg_activation > threshold)
                .collect();
            TokenConcept {
                token,
                occurrences: at.len(),
                neurons: sample_owned(neurons, bounds.max_neurons),
            }
        })
        .collect())
}

fn value_statistics(values: &[f32]) -> ValueStatistics {
    let as_f64: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    let summary = Summary::of(&as_f64);
    ValueStatistics {
        mean: summary.mean,
        std: summary.std,
        min: summary.min,
        max: summary.max,
        sparsity: active_fraction(values),
    }
}

/// Mean / std / min / max / sparsity of both families, layer by layer
pub fn layer_statistics(snapshot: &ActivationSnapshot) -> Result<Vec<LayerStatistics>> {
    let (context, output) = load_families(snapshot)?;
    Ok(context
        .layers
        .iter()
        .zip(&output.layers)
        .enumerate()
        .map(|(layer, (x, y))| LayerStatistics {
            layer,
            context: value_statistics(x),
            output: value_statistics(y),
        })
        .collect())
}
