// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in path length deltas
#![allow(clippy::many_single_char_names)] // x, y, v, E standard in the BDH equations
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // BdhModel in forward_bdh.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::float_cmp)] // exact ties are meaningful in the greedy solver
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! BDH Explorer: introspection of Baby Dragon Hatchling models
//!
//! Taps a BDH forward pass for its sparse neuron activations and attention
//! scores, derives a neuron graph from the fixed projection matrices, and
//! solves grid boards with BFS next to a model-guided greedy solver.
//!
//! ## Architecture
//!
//! - `forward_bdh`: BDH parameters and forward pass with activation capture
//! - `tracker`: Call-scoped ActivationTracker and ActivationSnapshot
//! - `masks`: Strict causal masks for the linear attention
//! - `model`: Checkpoint I/O, hub loading, device selection, ModelCache
//! - `sparsity`: Per-layer and aggregate activation sparsity
//! - `attention`: Attention flow (top edges and mean score per layer)
//! - `topology`: Thresholded neuron graph with degree and hub metrics
//! - `community`: Louvain communities and modularity of that graph
//! - `grid`: Boards, board encoding and random board generation
//! - `pathfind`: BFS, greedy and model-ordered solvers
//! - `bounding`: Deterministic stride sampling of outgoing payloads
//! - `explorer`: Request-level runner over a shared model
//! - `config` / `error` / `stats`: Shared configuration, errors and statistics

pub mod attention;
pub mod bounding;
pub mod community;
pub mod config;
pub mod error;
pub mod explorer;
pub mod forward_bdh;
pub mod grid;
pub mod masks;
pub mod model;
pub mod pathfind;
pub mod sparsity;
pub mod stats;
pub mod topology;
pub mod tracker;

pub use attention::{attention_flow, AttentionEdge, AttentionFlow, AttentionPatterns, LayerAttention};
pub use bounding::{bound_tensor, sample, BoundedTensor, NestedArray, Sampled};
pub use community::{louvain, modularity, Partition};
pub use config::{BdhConfig, BoundsConfig, ExplorerConfig};
pub use error::ExplorerError;
pub use explorer::{Explorer, InferenceReport, PathReport, SparsityReport, TopologyRequest};
pub use forward_bdh::{BdhModel, BdhParameters, ProjectionSet};
pub use grid::{random_board, BoardSpec, CellKind, Coord, Grid, RandomBoard};
pub use masks::{create_strict_causal_mask, MaskCache};
pub use model::{
    load_checkpoint, load_from_hub, save_checkpoint, select_device, ModelCache, ModelSource,
    ModelSummary,
};
pub use pathfind::{
    bfs_path, compare, greedy_path, model_ordered_bfs, solve, CellReadout, CellScorer,
    GreedyParams, ModelScorer, PathComparison, PathOutcome, Strategy, ZeroScorer,
};
pub use sparsity::{
    analyze_sparsity, concept_neurons, layer_statistics, neuron_profile, ConceptNeuron,
    FamilySparsity, LayerStatistics, NeuronProfile, SparsityRecord, TokenConcept,
};
pub use topology::{extract_topology, projection_matrix, Edge, GraphMetrics, Node, TopologyGraph, TopologyParams};
pub use tracker::{ActivationSnapshot, ActivationTracker, BoundedSnapshot, LayerActivations};
