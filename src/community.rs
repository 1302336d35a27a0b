//! Community detection on the undirected neuron graph
//!
//! Louvain with a deterministic visiting order: nodes are moved one at a time
//! to the neighbouring community with the largest modularity gain (ties go to
//! the lower community id, staying put wins over an equal gain), then
//! communities are merged into super-nodes and the pass repeats until nothing
//! moves. Edges are unweighted; a self-loop counts twice towards its node's
//! degree.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

const MIN_GAIN: f64 = 1e-12;

/// Community assignment of a graph's nodes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Partition {
    /// Community label per node, numbered from 0 in order of first appearance.
    /// Isolated nodes get `None`.
    pub labels: Vec<Option<usize>>,
    pub community_count: usize,
    pub modularity: f64,
}

impl Partition {
    fn empty(n: usize) -> Self {
        Self {
            labels: vec![None; n],
            community_count: 0,
            modularity: 0.0,
        }
    }
}

/// Symmetric weighted adjacency; `adj[i][i]` holds twice the loop weight
#[derive(Debug, Clone)]
struct Adjacency {
    adj: Vec<BTreeMap<usize, f64>>,
}

impl Adjacency {
    fn from_edges(n: usize, edges: &BTreeSet<(usize, usize)>) -> Self {
        let mut adj = vec![BTreeMap::new(); n];
        for &(a, b) in edges {
            if a == b {
                *adj[a].entry(a).or_insert(0.0) += 2.0;
            } else {
                *adj[a].entry(b).or_insert(0.0) += 1.0;
                *adj[b].entry(a).or_insert(0.0) += 1.0;
            }
        }
        Self { adj }
    }

    fn len(&self) -> usize {
        self.adj.len()
    }

    fn degree(&self, i: usize) -> f64 {
        self.adj[i].values().sum()
    }

    /// Collapse every community into one node
    fn aggregate(&self, community: &[usize], count: usize) -> Self {
        let mut adj = vec![BTreeMap::new(); count];
        for (i, row) in self.adj.iter().enumerate() {
            for (&j, &w) in row {
                *adj[community[i]].entry(community[j]).or_insert(0.0) += w;
            }
        }
        Self { adj }
    }
}

/// One round of local moves; returns the relabelled (0..count) assignment
fn local_moves(graph: &Adjacency, m2: f64) -> (Vec<usize>, usize, bool) {
    let n = graph.len();
    let degree: Vec<f64> = (0..n).map(|i| graph.degree(i)).collect();
    let mut community: Vec<usize> = (0..n).collect();
    let mut total = degree.clone();
    let mut moved_any = false;

    loop {
        let mut moved = false;
        for i in 0..n {
            let k = degree[i];
            if k == 0.0 {
                continue;
            }
            let own = community[i];
            total[own] -= k;

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for (&j, &w) in &graph.adj[i] {
                if j != i {
                    *links.entry(community[j]).or_insert(0.0) += w;
                }
            }
            let gain = |c: usize, w: f64| w - total[c] * k / m2;

            let mut best = own;
            let mut best_gain = gain(own, links.get(&own).copied().unwrap_or(0.0));
            for (&c, &w) in &links {
                let g = gain(c, w);
                if g > best_gain + MIN_GAIN {
                    best = c;
                    best_gain = g;
                }
            }

            total[best] += k;
            if best != own {
                community[i] = best;
                moved = true;
                moved_any = true;
            }
        }
        if !moved {
            break;
        }
    }

    let mut relabel = BTreeMap::new();
    for c in &mut community {
        let next = relabel.len();
        *c = *relabel.entry(*c).or_insert(next);
    }
    (community, relabel.len(), moved_any)
}

/// Newman modularity of `labels` over an undirected edge set
pub fn modularity(n: usize, edges: &BTreeSet<(usize, usize)>, labels: &[Option<usize>]) -> f64 {
    let graph = Adjacency::from_edges(n, edges);
    let m2: f64 = (0..n).map(|i| graph.degree(i)).sum();
    if m2 == 0.0 {
        return 0.0;
    }
    let mut inner: BTreeMap<usize, f64> = BTreeMap::new();
    let mut total: BTreeMap<usize, f64> = BTreeMap::new();
    for (i, row) in graph.adj.iter().enumerate() {
        let Some(ci) = labels[i] else { continue };
        *total.entry(ci).or_insert(0.0) += graph.degree(i);
        for (&j, &w) in row {
            if labels[j] == Some(ci) {
                *inner.entry(ci).or_insert(0.0) += w;
            }
        }
    }
    total
        .iter()
        .map(|(c, &tot)| inner.get(c).copied().unwrap_or(0.0) / m2 - (tot / m2).powi(2))
        .sum()
}

/// Louvain communities of an undirected graph on nodes `0..n`
///
/// `edges` holds each undirected edge once as `(min, max)`.
pub fn louvain(n: usize, edges: &BTreeSet<(usize, usize)>) -> Partition {
    let base = Adjacency::from_edges(n, edges);
    let m2: f64 = (0..n).map(|i| base.degree(i)).sum();
    if m2 == 0.0 {
        return Partition::empty(n);
    }

    // membership[i]: super-node holding original node i
    let mut membership: Vec<usize> = (0..n).collect();
    let mut graph = base.clone();
    let mut levels = 0usize;
    loop {
        let (community, count, moved) = local_moves(&graph, m2);
        for m in &mut membership {
            *m = community[*m];
        }
        levels += 1;
        if !moved || count == graph.len() {
            break;
        }
        graph = graph.aggregate(&community, count);
    }

    let mut relabel = BTreeMap::new();
    let labels: Vec<Option<usize>> = (0..n)
        .map(|i| {
            if base.degree(i) == 0.0 {
                return None;
            }
            let next = relabel.len();
            Some(*relabel.entry(membership[i]).or_insert(next))
        })
        .collect();
    let modularity = modularity(n, edges, &labels);
    debug!(
        "Louvain: {} communities over {} levels, Q={:.4}",
        relabel.len(),
        levels,
        modularity
    );
    Partition {
        labels,
        community_count: relabel.len(),
        modularity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_set(pairs: &[(usize, usize)]) -> BTreeSet<(usize, usize)> {
        pairs.iter().map(|&(a, b)| (a.min(b), a.max(b))).collect()
    }

    #[test]
    fn test_empty_graph() {
        let p = louvain(5, &BTreeSet::new());
        assert_eq!(p.community_count, 0);
        assert_eq!(p.modularity, 0.0);
        assert!(p.labels.iter().all(Option::is_none));
    }

    #[test]
    fn test_two_triangles_with_bridge() {
        let edges = edge_set(&[(0, 1), (1, 2), (0, 2), (3, 4), (4, 5), (3, 5), (2, 3)]);
        let p = louvain(6, &edges);
        assert_eq!(p.community_count, 2);
        assert_eq!(p.labels[0], p.labels[1]);
        assert_eq!(p.labels[1], p.labels[2]);
        assert_eq!(p.labels[3], p.labels[4]);
        assert_eq!(p.labels[4], p.labels[5]);
        assert_ne!(p.labels[0], p.labels[3]);
        // 2 * (3/7 - (7/14)^2)
        assert!((p.modularity - (6.0 / 7.0 - 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_complete_graph_is_one_community() {
        let edges = edge_set(&[(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]);
        let p = louvain(4, &edges);
        assert_eq!(p.community_count, 1);
        assert!(p.modularity.abs() < 1e-9);
    }

    #[test]
    fn test_isolated_nodes_are_unlabelled() {
        let edges = edge_set(&[(0, 1), (3, 4)]);
        let p = louvain(6, &edges);
        assert_eq!(p.labels[2], None);
        assert_eq!(p.labels[5], None);
        assert_eq!(p.community_count, 2);
        // 2 * (1/2 - (2/4)^2)
        assert!((p.modularity - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_self_loop_only() {
        let p = louvain(3, &edge_set(&[(1, 1)]));
        assert_eq!(p.community_count, 1);
        assert_eq!(p.labels[1], Some(0));
        assert!(p.modularity.abs() < 1e-9);
    }

    #[test]
    fn test_deterministic() {
        let edges = edge_set(&[(0, 1), (1, 2), (3, 4), (4, 5), (2, 3), (5, 0)]);
        assert_eq!(louvain(6, &edges), louvain(6, &edges));
    }
}
