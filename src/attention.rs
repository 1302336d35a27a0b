//! Attention flow analysis for BDH snapshots
//!
//! BDH attention scores are unnormalised (`rope(x) rope(x)^T` under a strict
//! causal mask), so "weights" here are raw head-averaged scores, not
//! probabilities. Row `i` holds what position `i` reads from earlier positions.

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::Serialize;

use crate::bounding::{bound_tensor, BoundedTensor};
use crate::config::BoundsConfig;
use crate::error::ExplorerError;
use crate::tracker::ActivationSnapshot;

/// Head-averaged score matrices, one `[T, T]` per layer
#[derive(Debug, Clone)]
pub struct AttentionPatterns {
    seq_len: usize,
    /// Row-major `[T, T]` per layer
    patterns: Vec<Vec<f32>>,
}

impl AttentionPatterns {
    /// Collect the attention matrices of a snapshot
    pub fn from_snapshot(snapshot: &ActivationSnapshot) -> Result<Self> {
        let mut seq_len = None;
        let patterns = snapshot
            .attention_scores()
            .into_iter()
            .enumerate()
            .map(|(layer, scores)| {
                let (rows, cols) = scores.dims2()?;
                let expected = *seq_len.get_or_insert(rows);
                if rows != cols || rows != expected {
                    return Err(ExplorerError::shape_mismatch(
                        format!("layer {layer} attention"),
                        format!("[{expected}, {expected}]"),
                        format!("[{rows}, {cols}]"),
                    )
                    .into());
                }
                flatten(scores)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            seq_len: seq_len.unwrap_or(0),
            patterns,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.patterns.len()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Scores from `position` to every position: `[T]`
    pub fn attention_from_position(&self, layer: usize, position: usize) -> Option<Vec<f32>> {
        let pattern = self.patterns.get(layer)?;
        (position < self.seq_len)
            .then(|| pattern[position * self.seq_len..(position + 1) * self.seq_len].to_vec())
    }

    /// Scores from every position to `position`: `[T]`
    pub fn attention_to_position(&self, layer: usize, position: usize) -> Option<Vec<f32>> {
        let pattern = self.patterns.get(layer)?;
        (position < self.seq_len).then(|| {
            pattern
                .iter()
                .skip(position)
                .step_by(self.seq_len)
                .copied()
                .collect()
        })
    }

    /// Top-k positions that `from_position` reads from
    pub fn top_attended_positions(
        &self,
        layer: usize,
        from_position: usize,
        k: usize,
    ) -> Option<Vec<(usize, f32)>> {
        let attn = self.attention_from_position(layer, from_position)?;
        let mut indexed: Vec<(usize, f32)> = attn.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        indexed.truncate(k);
        Some(indexed)
    }

    /// Strongest `k` entries of a layer, strongest first
    ///
    /// Equal scores keep row-major order.
    pub fn top_edges(&self, layer: usize, k: usize) -> Vec<AttentionEdge> {
        let Some(pattern) = self.patterns.get(layer) else {
            return Vec::new();
        };
        let mut order: Vec<usize> = (0..pattern.len()).collect();
        order.sort_by(|&a, &b| pattern[b].total_cmp(&pattern[a]).then(a.cmp(&b)));
        order
            .into_iter()
            .take(k)
            .map(|flat| AttentionEdge {
                source: flat / self.seq_len,
                target: flat % self.seq_len,
                weight: pattern[flat],
            })
            .collect()
    }

    /// Mean over all `T x T` entries of a layer, masked zeros included
    pub fn mean_score(&self, layer: usize) -> f64 {
        match self.patterns.get(layer) {
            Some(p) if !p.is_empty() => p.iter().map(|&v| f64::from(v)).sum::<f64>() / p.len() as f64,
            _ => 0.0,
        }
    }
}

fn flatten(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
}

/// One attention edge between token positions
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AttentionEdge {
    /// Reading position
    pub source: usize,
    /// Position read from
    pub target: usize,
    pub weight: f32,
}

/// Attention summary of one layer
#[derive(Debug, Clone, Serialize)]
pub struct LayerAttention {
    pub layer: usize,
    pub top_edges: Vec<AttentionEdge>,
    pub mean_score: f64,
}

/// Attention flow across a whole snapshot
#[derive(Debug, Clone, Serialize)]
pub struct AttentionFlow {
    pub n_layers: usize,
    pub seq_len: usize,
    pub top_k: usize,
    pub layers: Vec<LayerAttention>,
    /// Head-averaged matrices, bounded per axis to `max_tokens`
    pub matrices: Vec<BoundedTensor>,
}

/// Summarise attention: top-k edges and mean score per layer
pub fn attention_flow(
    snapshot: &ActivationSnapshot,
    top_k: usize,
    bounds: &BoundsConfig,
) -> Result<AttentionFlow> {
    let patterns = AttentionPatterns::from_snapshot(snapshot)?;
    let layers = (0..patterns.n_layers())
        .map(|layer| LayerAttention {
            layer,
            top_edges: patterns.top_edges(layer, top_k),
            mean_score: patterns.mean_score(layer),
        })
        .collect();
    let matrices = snapshot
        .attention_scores()
        .into_iter()
        .map(|scores| bound_tensor(scores, &[bounds.max_tokens, bounds.max_tokens]))
        .collect::<Result<Vec<_>>>()?;

    Ok(AttentionFlow {
        n_layers: patterns.n_layers(),
        seq_len: patterns.seq_len(),
        top_k,
        layers,
        matrices,
    })
}
