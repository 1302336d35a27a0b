//! High-level introspection runner
//!
//! [`Explorer`] ties a shared model to the analysis configuration and exposes
//! one method per request kind. Every tracked call builds its own
//! [`ActivationTracker`], so an `Explorer` can serve concurrent callers.

use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attention::{attention_flow, AttentionFlow};
use crate::config::ExplorerConfig;
use crate::forward_bdh::{BdhModel, ProjectionSet};
use crate::grid::{Coord, Grid};
use crate::model::ModelSummary;
use crate::pathfind::{compare, CellReadout, GreedyParams, ModelScorer, PathComparison, Strategy};
use crate::sparsity::{
    analyze_sparsity, concept_neurons, layer_statistics, neuron_profile, LayerStatistics,
    NeuronProfile, SparsityRecord, TokenConcept,
};
use crate::topology::{extract_topology, TopologyGraph, TopologyParams};
use crate::tracker::{ActivationSnapshot, ActivationTracker, BoundedSnapshot};

/// Output of one tracked inference call
#[derive(Debug, Clone, Serialize)]
pub struct InferenceReport {
    pub tokens: Vec<u32>,
    /// Argmax of the final logits per position
    pub predictions: Vec<u32>,
    /// Argmax per position when each layer's output is read out directly
    pub layer_predictions: Vec<Vec<u32>>,
    pub snapshot: BoundedSnapshot,
    pub sparsity: SparsityRecord,
    pub attention: AttentionFlow,
}

/// Output of a sparsity request
#[derive(Debug, Clone, Serialize)]
pub struct SparsityReport {
    pub record: SparsityRecord,
    pub layers: Vec<LayerStatistics>,
    pub neurons: NeuronProfile,
    /// Concept neurons of every token in the input
    pub concepts: Vec<TokenConcept>,
}

/// Topology knobs; unset fields fall back to [`ExplorerConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyRequest {
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
    pub hub_percentile: Option<f64>,
}

/// Output of a path request
#[derive(Debug, Clone, Serialize)]
pub struct PathReport {
    pub grid: Grid,
    pub start: Coord,
    pub goal: Coord,
    pub readout: CellReadout,
    pub comparison: PathComparison,
    /// Argmax per cell of the board forward pass, `rows x cols`
    pub predicted_board: Vec<Vec<u32>>,
    pub sparsity: SparsityRecord,
    pub attention: AttentionFlow,
}

/// Runs introspection requests against one shared model
#[derive(Debug, Clone)]
pub struct Explorer {
    model: Arc<BdhModel>,
    config: ExplorerConfig,
}

impl Explorer {
    pub fn new(model: Arc<BdhModel>, config: ExplorerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    pub fn model(&self) -> &BdhModel {
        &self.model
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary::of(&self.model)
    }

    /// Tracked forward pass with a tracker owned by this call
    ///
    /// Returns the logits `[1, T, V]` and the snapshot.
    pub fn trace(&self, tokens: &[u32]) -> Result<(Tensor, ActivationSnapshot)> {
        let input = self.model.input_tensor(tokens)?;
        let mut tracker = ActivationTracker::enabled(self.model.n_layers());
        let logits = self.model.forward_tracked(&input, &mut tracker)?;
        Ok((logits, tracker.into_snapshot()))
    }

    /// Predictions, bounded activations, sparsity and attention flow
    pub fn infer(&self, tokens: &[u32]) -> Result<InferenceReport> {
        info!("Inference on {} tokens", tokens.len());
        let (logits, snapshot) = self.trace(tokens)?;
        let bounds = &self.config.bounds;

        let report = InferenceReport {
            tokens: tokens.to_vec(),
            predictions: self.model.predictions(&logits)?,
            layer_predictions: self.layer_predictions(&snapshot)?,
            snapshot: snapshot.bound(bounds)?,
            sparsity: analyze_sparsity(&snapshot, bounds.max_tokens)?,
            attention: attention_flow(&snapshot, self.config.attention_top_k, bounds)?,
        };
        info!(
            "Sparsity: x {:.3}, y {:.3}",
            report.sparsity.context.mean, report.sparsity.output.mean
        );
        Ok(report)
    }

    /// Read every layer's output through the readout matrix
    fn layer_predictions(&self, snapshot: &ActivationSnapshot) -> Result<Vec<Vec<u32>>> {
        let readout = &self.model.params().readout;
        snapshot
            .layers()
            .iter()
            .map(|layer| {
                let logits = layer.output_activations.matmul(readout)?;
                Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
            })
            .collect()
    }

    /// Sparsity record, per-layer statistics, neuron profile and concept neurons
    pub fn sparsity(&self, tokens: &[u32]) -> Result<SparsityReport> {
        let (_, snapshot) = self.trace(tokens)?;
        let bounds = &self.config.bounds;
        Ok(SparsityReport {
            record: analyze_sparsity(&snapshot, bounds.max_tokens)?,
            layers: layer_statistics(&snapshot)?,
            neurons: neuron_profile(&snapshot, bounds)?,
            concepts: concept_neurons(
                &snapshot,
                tokens,
                self.model.vocab_size(),
                self.config.concept_threshold,
                bounds,
            )?,
        })
    }

    /// Resolve a request against the configured defaults
    pub fn topology_params(&self, request: &TopologyRequest) -> TopologyParams {
        TopologyParams {
            threshold: request.threshold.unwrap_or(self.config.topology_threshold),
            top_k: request.top_k,
            hub_percentile: request.hub_percentile.unwrap_or(self.config.hub_percentile),
            max_edges: self.config.bounds.max_edges,
            max_nodes: self.config.bounds.max_nodes,
        }
    }

    /// Thresholded neuron graph of one projection set; never cached
    pub fn topology(&self, set: ProjectionSet, request: &TopologyRequest) -> Result<TopologyGraph> {
        extract_topology(&self.model, set, &self.topology_params(request))
    }

    pub fn greedy_params(&self) -> GreedyParams {
        GreedyParams {
            heuristic_weight: self.config.heuristic_weight,
            step_bound_factor: self.config.step_bound_factor,
            max_steps: None,
        }
    }

    /// Solve a board with BFS and `strategy` and report what the model sees
    ///
    /// The tracked pass runs on the board encoded with the current position
    /// at the start cell.
    pub fn pathfind(
        &self,
        grid: &Grid,
        start: Option<Coord>,
        goal: Option<Coord>,
        strategy: Strategy,
    ) -> Result<PathReport> {
        let (start, goal) = grid.endpoints(start, goal)?;
        let scorer = ModelScorer::for_grid(&self.model, grid)?;
        let comparison = compare(grid, start, goal, strategy, &scorer, &self.greedy_params())?;

        let tokens = grid.encode_board(start, goal, start)?;
        let (logits, snapshot) = self.trace(&tokens)?;
        let predictions: Vec<u32> = logits
            .i(0)?
            .to_dtype(DType::F32)?
            .argmax(D::Minus1)?
            .to_vec1()?;
        let predicted_board = predictions
            .chunks_exact(grid.cols())
            .map(<[u32]>::to_vec)
            .collect();

        Ok(PathReport {
            grid: grid.clone(),
            start,
            goal,
            readout: scorer.readout(),
            comparison,
            predicted_board,
            sparsity: analyze_sparsity(&snapshot, self.config.bounds.max_tokens)?,
            attention: attention_flow(&snapshot, self.config.attention_top_k, &self.config.bounds)?,
        })
    }
}
