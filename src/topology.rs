//! Neuron topology extraction
//!
//! Builds the directed neuron graph implied by the fixed BDH parameters:
//! `G = [E Dx[0] | E Dx[1] | ... | E Dx[H-1]]` (or the same with `Dy`), an
//! `N x N` matrix whose entry `(i, j)` is the weight of the edge `i -> j`.
//! Only entries with `|w| > threshold` become edges.
//!
//! Hub policy: the hub cutoff is the configured percentile of the degree
//! distribution of the nodes being reported (after thresholding and any top-K
//! restriction), recomputed on every call. Changing the threshold or top-K
//! therefore moves the cutoff too. A node needs a non-zero degree to count as a
//! hub, so a graph without edges has no hubs.
//!
//! Communities come from Louvain over the undirected version of the reported
//! subgraph; direction and weights are dropped.

use std::collections::BTreeSet;

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bounding::{sample_owned, stride_for, Sampled};
use crate::community::louvain;
use crate::error::ExplorerError;
use crate::forward_bdh::{BdhModel, ProjectionSet};
use crate::stats::{percentile, Summary};

/// Parameters of one topology request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyParams {
    /// Edge iff `|w| > threshold`
    pub threshold: f32,
    /// Keep only the K highest-degree nodes (ties: lower id first)
    pub top_k: Option<usize>,
    /// Percentile of the live degree distribution used as hub cutoff
    pub hub_percentile: f64,
    /// Cap on emitted edges (stride-sampled beyond it)
    pub max_edges: usize,
    /// Cap on emitted nodes and degree lists
    pub max_nodes: usize,
}

impl Default for TopologyParams {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            top_k: None,
            hub_percentile: 90.0,
            max_edges: 5000,
            max_nodes: 4096,
        }
    }
}

impl TopologyParams {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ExplorerError::invalid_argument(
                "threshold",
                format!("must be finite and >= 0, got {}", self.threshold),
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
        if self.top_k == Some(0) {
            return Err(ExplorerError::invalid_argument("top_k", "must be at least 1").into());
        }
        if self.max_edges == 0 || self.max_nodes == 0 {
            return Err(ExplorerError::invalid_argument(
                "max_edges/max_nodes",
                "caps must be at least 1",
            )
            .into());
        }
        Ok(())
    }
}

/// A neuron in the derived graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: usize,
    pub in_degree: usize,
    pub out_degree: usize,
    pub degree: usize,
    pub is_hub: bool,
}

/// A thresholded connection `source -> target`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Edge {
    pub source: usize,
    pub target: usize,
    pub weight: f32,
}

/// Degree and hub statistics of the reported node set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphMetrics {
    /// Nodes reported (all N, or top-K)
    pub node_count: usize,
    /// Edges between reported nodes
    pub edge_count: usize,
    /// Edges in the full thresholded graph
    pub total_edge_count: usize,
    pub avg_degree: f64,
    pub max_degree: usize,
    pub min_degree: usize,
    pub std_degree: f64,
    /// Percentile used for the hub cutoff
    pub hub_percentile: f64,
    /// Degree at or above which a node is a hub
    pub hub_percentile_threshold: f64,
    pub hub_count: usize,
    /// Hub ids, ascending
    pub hubs: Sampled<usize>,
    /// Degrees of the reported nodes, in ascending id order
    pub degree_distribution: Sampled<usize>,
    /// Louvain modularity; 0 without edges
    pub modularity: f64,
    /// Communities among nodes with at least one edge
    pub num_communities: usize,
}

/// Derived neuron graph, already bounded for transmission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyGraph {
    pub projection: ProjectionSet,
    pub threshold: f32,
    pub nodes: Sampled<Node>,
    pub edges: Sampled<Edge>,
    pub metrics: GraphMetrics,
}

impl TopologyGraph {
    /// True when no entry passed the threshold
    pub fn is_degenerate(&self) -> bool {
        self.metrics.total_edge_count == 0
    }
}

/// Compute the `N x N` neuron matrix for a projection set
///
/// Head `h` contributes `E @ P[h]` (`N x N/H`); heads are concatenated along
/// the column axis.
pub fn projection_matrix(model: &BdhModel, set: ProjectionSet) -> Result<Tensor> {
    let embedding = model.neuron_embedding();
    let projection = model.projection(set);
    let heads = (0..model.n_heads())
        .map(|h| Ok(embedding.matmul(&projection.i(h)?.contiguous()?)?))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&heads, 1)?)
}

/// Extract the thresholded graph of a model's projection set
pub fn extract_topology(
    model: &BdhModel,
    set: ProjectionSet,
    params: &TopologyParams,
) -> Result<TopologyGraph> {
    params.validate()?;
    let matrix = projection_matrix(model, set)?;
    let (rows, cols) = matrix.dims2()?;
    let values: Vec<f32> = matrix.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    let graph = graph_from_matrix(&values, rows, cols, set, params)?;
    info!(
        "Topology ({:?}, t={}): {} nodes, {} edges, {} hubs",
        set, params.threshold, graph.metrics.node_count, graph.metrics.edge_count, graph.metrics.hub_count
    );
    Ok(graph)
}

/// Build the graph from a row-major square matrix
pub fn graph_from_matrix(
    values: &[f32],
    rows: usize,
    cols: usize,
    set: ProjectionSet,
    params: &TopologyParams,
) -> Result<TopologyGraph> {
    params.validate()?;
    if rows != cols || values.len() != rows * cols {
        return Err(ExplorerError::shape_mismatch(
            "topology matrix",
            "square N x N",
            format!("{rows} x {cols} with {} values", values.len()),
        )
        .into());
    }
    let n = rows;
    let t = params.threshold;
    let is_edge = |w: f32| w.abs() > t;

    let mut in_degree = vec![0usize; n];
    let mut out_degree = vec![0usize; n];
    let mut total_edge_count = 0usize;
    for (i, row) in values.chunks_exact(n.max(1)).enumerate().take(n) {
        for (j, &w) in row.iter().enumerate() {
            if is_edge(w) {
                out_degree[i] += 1;
                in_degree[j] += 1;
                total_edge_count += 1;
            }
        }
    }
    let degree: Vec<usize> = (0..n).map(|i| in_degree[i] + out_degree[i]).collect();

    // Reported node set, ascending ids
    let selected: Vec<usize> = match params.top_k {
        Some(k) if k < n => {
            let mut ranked: Vec<usize> = (0..n).collect();
            ranked.sort_by(|&a, &b| degree[b].cmp(&degree[a]).then(a.cmp(&b)));
            ranked.truncate(k);
            ranked.sort_unstable();
            ranked
        }
        _ => (0..n).collect(),
    };
    let mut in_set = vec![false; n];
    for &id in &selected {
        in_set[id] = true;
    }

    let set_degrees: Vec<usize> = selected.iter().map(|&id| degree[id]).collect();
    let mut sorted: Vec<f64> = set_degrees.iter().map(|&d| d as f64).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let hub_cutoff = percentile(&sorted, params.hub_percentile);
    let is_hub = |id: usize| degree[id] > 0 && degree[id] as f64 >= hub_cutoff;

    let nodes: Vec<Node> = selected
        .iter()
        .map(|&id| Node {
            id,
            in_degree: in_degree[id],
            out_degree: out_degree[id],
            degree: degree[id],
            is_hub: is_hub(id),
        })
        .collect();
    let hubs: Vec<usize> = selected.iter().copied().filter(|&id| is_hub(id)).collect();

    // Count edges inside the set first so the stride is known before emitting
    let edge_count = if selected.len() == n {
        total_edge_count
    } else {
        selected
            .iter()
            .map(|&i| {
                selected
                    .iter()
                    .filter(|&&j| is_edge(values[i * n + j]))
                    .count()
            })
            .sum()
    };
    let stride = stride_for(edge_count, params.max_edges);
    let mut edges = Vec::with_capacity(edge_count.div_ceil(stride));
    let mut seen = 0usize;
    let mut undirected = BTreeSet::new();
    for &i in &selected {
        for j in 0..n {
            let w = values[i * n + j];
            if in_set[j] && is_edge(w) {
                undirected.insert((i.min(j), i.max(j)));
                if seen % stride == 0 {
                    edges.push(Edge {
                        source: i,
                        target: j,
                        weight: w,
                    });
                }
                seen += 1;
            }
        }
    }
    debug!("Emitted {} of {} edges (stride {})", edges.len(), edge_count, stride);
    let partition = louvain(n, &undirected);

    let summary = Summary::of(&sorted);
    let metrics = GraphMetrics {
        node_count: selected.len(),
        edge_count,
        total_edge_count,
        avg_degree: summary.mean,
        max_degree: set_degrees.iter().copied().max().unwrap_or(0),
        min_degree: set_degrees.iter().copied().min().unwrap_or(0),
        std_degree: summary.std,
        hub_percentile: params.hub_percentile,
        hub_percentile_threshold: hub_cutoff,
        hub_count: hubs.len(),
        hubs: sample_owned(hubs, params.max_nodes),
        degree_distribution: sample_owned(set_degrees, params.max_nodes),
        modularity: partition.modularity,
        num_communities: partition.community_count,
    };

    Ok(TopologyGraph {
        projection: set,
        threshold: t,
        nodes: sample_owned(nodes, params.max_nodes),
        edges: Sampled {
            total: edge_count,
            stride,
            items: edges,
        },
        metrics,
    })
}
