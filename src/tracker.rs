//! Call-scoped activation tracking for BDH forward passes
//!
//! An [`ActivationTracker`] is created by the caller, handed to
//! [`BdhModel::forward_tracked`](crate::forward_bdh::BdhModel::forward_tracked)
//! and owned by that single call. Two concurrent requests never share a
//! tracker, so one request's snapshot cannot leak into another's.
//!
//! A tracker must be reset (or re-enabled, which resets) before it is reused
//! for a logically distinct inference call; otherwise layers from the previous
//! call stay in front of the new ones.

use anyhow::Result;
use candle_core::Tensor;
use serde::Serialize;

use crate::bounding::{bound_tensor, sample_indices, BoundedTensor};
use crate::config::BoundsConfig;

/// Tensors captured at the end of one layer (batch dimension removed)
#[derive(Debug, Clone)]
pub struct LayerActivations {
    /// Sparse context activations `x = relu(v Dx)`, shape `(seq_len, n_neurons)`
    pub context_vector: Tensor,
    /// Gated neuron activations `y = relu(ln(a) Dy) * x`, shape `(seq_len, n_neurons)`
    pub neuron_activations: Tensor,
    /// Residual stream after the layer, shape `(seq_len, d_model)`
    pub output_activations: Tensor,
    /// Head-averaged attention scores, shape `(seq_len, seq_len)`
    pub attention_scores: Tensor,
}

/// Records per-layer tensors while enabled; a pass-through while disabled
#[derive(Debug, Default)]
pub struct ActivationTracker {
    enabled: bool,
    layers: Vec<LayerActivations>,
}

impl ActivationTracker {
    /// A disabled tracker; recording is a no-op and allocates nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// An enabled tracker with room for `n_layers`
    pub fn enabled(n_layers: usize) -> Self {
        Self {
            enabled: true,
            layers: Vec::with_capacity(n_layers),
        }
    }

    /// Start capturing; clears anything recorded before
    pub fn enable(&mut self) {
        self.reset();
        self.enabled = true;
    }

    /// Stop capturing; already recorded layers are kept
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Drop every recorded layer
    pub fn reset(&mut self) {
        self.layers.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of layers recorded so far
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Record one layer. `capture` only runs while enabled.
    pub fn record<F>(&mut self, capture: F) -> Result<()>
    where
        F: FnOnce() -> Result<LayerActivations>,
    {
        if self.enabled {
            self.layers.push(capture()?);
        }
        Ok(())
    }

    /// Move the recorded layers out, leaving the tracker reset
    pub fn take_snapshot(&mut self) -> ActivationSnapshot {
        ActivationSnapshot {
            layers: std::mem::take(&mut self.layers),
        }
    }

    /// Consume the tracker into its snapshot
    pub fn into_snapshot(self) -> ActivationSnapshot {
        ActivationSnapshot {
            layers: self.layers,
        }
    }
}

/// Everything captured during one tracked forward pass, in layer order
#[derive(Debug, Clone, Default)]
pub struct ActivationSnapshot {
    layers: Vec<LayerActivations>,
}

impl ActivationSnapshot {
    pub fn new(layers: Vec<LayerActivations>) -> Self {
        Self { layers }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get_layer(&self, layer: usize) -> Option<&LayerActivations> {
        self.layers.get(layer)
    }

    pub fn layers(&self) -> &[LayerActivations] {
        &self.layers
    }

    /// Context activations of every layer
    pub fn context_vectors(&self) -> Vec<&Tensor> {
        self.layers.iter().map(|l| &l.context_vector).collect()
    }

    /// Neuron activations of every layer
    pub fn neuron_activations(&self) -> Vec<&Tensor> {
        self.layers.iter().map(|l| &l.neuron_activations).collect()
    }

    /// Attention score matrices of every layer
    pub fn attention_scores(&self) -> Vec<&Tensor> {
        self.layers.iter().map(|l| &l.attention_scores).collect()
    }

    /// Convert into bounded nested arrays for transmission
    pub fn bound(&self, bounds: &BoundsConfig) -> Result<BoundedSnapshot> {
        let layer_indices = sample_indices(self.layers.len(), bounds.max_layers);
        let neuron_caps = [bounds.max_tokens, bounds.max_neurons];
        let attention_caps = [bounds.max_tokens, bounds.max_tokens];

        let layers = layer_indices
            .iter()
            .map(|&layer| {
                let acts = &self.layers[layer];
                Ok(BoundedLayer {
                    layer,
                    context_vector: bound_tensor(&acts.context_vector, &neuron_caps)?,
                    neuron_activations: bound_tensor(&acts.neuron_activations, &neuron_caps)?,
                    output_activations: bound_tensor(&acts.output_activations, &neuron_caps)?,
                    attention_scores: bound_tensor(&acts.attention_scores, &attention_caps)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(BoundedSnapshot {
            n_layers: self.layers.len(),
            layers,
        })
    }
}

/// One layer of a bounded snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundedLayer {
    /// Index of the layer in the model
    pub layer: usize,
    pub context_vector: BoundedTensor,
    pub neuron_activations: BoundedTensor,
    pub output_activations: BoundedTensor,
    pub attention_scores: BoundedTensor,
}

/// Snapshot after bounding; layers may themselves be stride-sampled
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundedSnapshot {
    /// Layer count before sampling
    pub n_layers: usize,
    pub layers: Vec<BoundedLayer>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn zero_layer(seq_len: usize, n: usize, d: usize) -> LayerActivations {
        let device = Device::Cpu;
        LayerActivations {
            context_vector: Tensor::zeros((seq_len, n), DType::F32, &device).unwrap(),
            neuron_activations: Tensor::zeros((seq_len, n), DType::F32, &device).unwrap(),
            output_activations: Tensor::zeros((seq_len, d), DType::F32, &device).unwrap(),
            attention_scores: Tensor::zeros((seq_len, seq_len), DType::F32, &device).unwrap(),
        }
    }

    #[test]
    fn test_disabled_tracker_skips_capture() {
        let mut tracker = ActivationTracker::new();
        tracker
            .record(|| panic!("capture must not run while disabled"))
            .unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_enable_resets_previous_call() {
        let mut tracker = ActivationTracker::enabled(2);
        tracker.record(|| Ok(zero_layer(3, 8, 4))).unwrap();
        tracker.record(|| Ok(zero_layer(3, 8, 4))).unwrap();
        assert_eq!(tracker.n_layers(), 2);

        tracker.enable();
        assert!(tracker.is_empty());
        assert!(tracker.is_enabled());
    }

    #[test]
    fn test_take_snapshot_leaves_tracker_reset() {
        let mut tracker = ActivationTracker::enabled(1);
        tracker.record(|| Ok(zero_layer(2, 4, 2))).unwrap();

        let snapshot = tracker.take_snapshot();
        assert_eq!(snapshot.n_layers(), 1);
        assert!(tracker.is_empty());
        assert!(tracker.is_enabled());
    }

    #[test]
    fn test_capture_error_propagates() {
        let mut tracker = ActivationTracker::enabled(1);
        let result = tracker.record(|| anyhow::bail!("device lost"));
        assert_eq!(result.unwrap_err().to_string(), "device lost");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_bound_snapshot_caps_every_axis() {
        let snapshot = ActivationSnapshot::new(vec![zero_layer(10, 600, 64); 5]);
        let bounds = BoundsConfig {
            max_neurons: 100,
            max_tokens: 4,
            max_layers: 2,
            ..Default::default()
        };

        let bounded = snapshot.bound(&bounds).unwrap();
        assert_eq!(bounded.n_layers, 5);
        assert_eq!(
            bounded.layers.iter().map(|l| l.layer).collect::<Vec<_>>(),
            vec![0, 3]
        );
        let layer = &bounded.layers[0];
        assert_eq!(layer.context_vector.sampled_shape(), vec![4, 100]);
        assert_eq!(layer.output_activations.sampled_shape(), vec![4, 64]);
        assert_eq!(layer.attention_scores.sampled_shape(), vec![4, 4]);
    }
}
