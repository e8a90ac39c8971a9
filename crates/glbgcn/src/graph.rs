//! Skeleton graph topology.
//!
//! [`Graph`] turns a [`GraphConfig`] into the `(K, V, V)` adjacency tensor the
//! backbone convolves with. Each layout lists its joint count, its bone list
//! and a centre joint; the partitioning strategy then splits the normalised
//! adjacency into `K` kernels.
//!
//! With [`GraphConfig::global_node`] set, a virtual node is appended after the
//! last joint and linked to every joint. The backbone places the fused
//! auxiliary feature on that node, so a `V`-joint layout yields a
//! `(K, V + 1, V + 1)` adjacency.

use ndarray::{Array2, Array3};
use std::collections::VecDeque;

use crate::config::{GraphConfig, Layout, Strategy};

/// Hop distance between two nodes that are farther apart than `max_hop`.
pub const UNREACHABLE: usize = usize::MAX;

/// A skeleton graph and its partitioned adjacency.
#[derive(Debug, Clone)]
pub struct Graph {
    num_node: usize,
    num_joints: usize,
    center: usize,
    hop_dis: Array2<usize>,
    adjacency: Array3<f32>,
}

impl Graph {
    /// Build the graph described by `cfg`.
    pub fn new(cfg: &GraphConfig) -> Self {
        let (num_joints, neighbor_link, center) = layout_edges(cfg.layout);
        let num_node = if cfg.global_node { num_joints + 1 } else { num_joints };

        let mut edges: Vec<(usize, usize)> = (0..num_node).map(|i| (i, i)).collect();
        edges.extend(neighbor_link);
        if cfg.global_node {
            edges.extend((0..num_joints).map(|j| (num_joints, j)));
        }

        let hop_dis = hop_distance(num_node, &edges, cfg.max_hop);
        let adjacency = partition(&hop_dis, center, cfg.strategy, cfg.max_hop, cfg.dilation);

        tracing::debug!(
            layout = ?cfg.layout,
            strategy = ?cfg.strategy,
            num_node,
            kernels = adjacency.dim().0,
            "built skeleton graph"
        );

        Graph { num_node, num_joints, center, hop_dis, adjacency }
    }

    /// Total number of nodes, including the virtual node when present.
    pub fn num_node(&self) -> usize {
        self.num_node
    }

    /// Number of skeletal joints (excludes the virtual node).
    pub fn num_joints(&self) -> usize {
        self.num_joints
    }

    /// Index of the centre joint used by the spatial strategy.
    pub fn center(&self) -> usize {
        self.center
    }

    /// Hop distances truncated at `max_hop` ([`UNREACHABLE`] beyond).
    pub fn hop_distance(&self) -> &Array2<usize> {
        &self.hop_dis
    }

    /// The `(K, V, V)` partitioned adjacency.
    pub fn adjacency(&self) -> &Array3<f32> {
        &self.adjacency
    }
}

/// Joint count, bone list (0-based) and centre joint of a layout.
fn layout_edges(layout: Layout) -> (usize, Vec<(usize, usize)>, usize) {
    match layout {
        Layout::OpenPose => {
            let links = vec![
                (4, 3), (3, 2), (7, 6), (6, 5), (13, 12), (12, 11), (10, 9), (9, 8),
                (11, 5), (8, 2), (5, 1), (2, 1), (0, 1), (15, 0), (14, 0), (17, 15),
                (16, 14),
            ];
            (18, links, 1)
        }
        Layout::NtuRgbD => {
            let one_based = [
                (1, 2), (2, 21), (3, 21), (4, 3), (5, 21), (6, 5), (7, 6), (8, 7),
                (9, 21), (10, 9), (11, 10), (12, 11), (13, 1), (14, 13), (15, 14),
                (16, 15), (17, 1), (18, 17), (19, 18), (20, 19), (22, 23), (23, 8),
                (24, 25), (25, 12),
            ];
            (25, zero_based(&one_based), 21 - 1)
        }
        Layout::NtuEdge => {
            let one_based = [
                (1, 2), (3, 2), (4, 3), (5, 2), (6, 5), (7, 6), (8, 7), (9, 2),
                (10, 9), (11, 10), (12, 11), (13, 1), (14, 13), (15, 14), (16, 15),
                (17, 1), (18, 17), (19, 18), (20, 19), (21, 22), (22, 8), (23, 24),
                (24, 12),
            ];
            (24, zero_based(&one_based), 2)
        }
        Layout::Coco => {
            let one_based = [
                (16, 14), (14, 12), (17, 15), (15, 13), (12, 13), (6, 12), (7, 13),
                (6, 7), (8, 6), (9, 7), (10, 8), (11, 9), (2, 3), (2, 1), (3, 1),
                (4, 2), (5, 3), (4, 6), (5, 7),
            ];
            (17, zero_based(&one_based), 0)
        }
    }
}

fn zero_based(links: &[(usize, usize)]) -> Vec<(usize, usize)> {
    links.iter().map(|&(i, j)| (i - 1, j - 1)).collect()
}

/// Breadth-first hop distances, cut off at `max_hop`.
fn hop_distance(num_node: usize, edges: &[(usize, usize)], max_hop: usize) -> Array2<usize> {
    let mut neighbours = vec![Vec::new(); num_node];
    for &(i, j) in edges {
        if i != j {
            neighbours[i].push(j);
            neighbours[j].push(i);
        }
    }

    let mut dist = Array2::from_elem((num_node, num_node), UNREACHABLE);
    let mut queue = VecDeque::new();
    for src in 0..num_node {
        dist[[src, src]] = 0;
        queue.clear();
        queue.push_back(src);
        while let Some(u) = queue.pop_front() {
            let d = dist[[src, u]];
            if d == max_hop {
                continue;
            }
            for &w in &neighbours[u] {
                if dist[[src, w]] == UNREACHABLE {
                    dist[[src, w]] = d + 1;
                    queue.push_back(w);
                }
            }
        }
    }
    dist
}

/// Column-normalise: `A · D⁻¹` with `D` the column-sum degree matrix.
fn normalize_digraph(adjacency: &Array2<f32>) -> Array2<f32> {
    let degree = adjacency.sum_axis(ndarray::Axis(0));
    let mut out = adjacency.clone();
    for ((_, j), v) in out.indexed_iter_mut() {
        let d = degree[j];
        *v = if d > 0.0 { *v / d } else { 0.0 };
    }
    out
}

fn partition(
    hop_dis: &Array2<usize>,
    center: usize,
    strategy: Strategy,
    max_hop: usize,
    dilation: usize,
) -> Array3<f32> {
    let n = hop_dis.nrows();
    let valid_hops: Vec<usize> = (0..=max_hop).step_by(dilation).collect();

    let mut adjacency = Array2::<f32>::zeros((n, n));
    for ((i, j), &h) in hop_dis.indexed_iter() {
        if valid_hops.contains(&h) {
            adjacency[[i, j]] = 1.0;
        }
    }
    let normalized = normalize_digraph(&adjacency);

    match strategy {
        Strategy::Uniform => normalized.insert_axis(ndarray::Axis(0)),
        Strategy::Distance => {
            let mut a = Array3::<f32>::zeros((valid_hops.len(), n, n));
            for (k, &hop) in valid_hops.iter().enumerate() {
                for ((i, j), &h) in hop_dis.indexed_iter() {
                    if h == hop {
                        a[[k, i, j]] = normalized[[i, j]];
                    }
                }
            }
            a
        }
        Strategy::Spatial => {
            let mut parts: Vec<Array2<f32>> = Vec::new();
            for &hop in &valid_hops {
                let mut root = Array2::<f32>::zeros((n, n));
                let mut close = Array2::<f32>::zeros((n, n));
                let mut further = Array2::<f32>::zeros((n, n));
                for i in 0..n {
                    for j in 0..n {
                        if hop_dis[[j, i]] != hop {
                            continue;
                        }
                        let (dj, di) = (hop_dis[[j, center]], hop_dis[[i, center]]);
                        if dj == di {
                            root[[j, i]] = normalized[[j, i]];
                        } else if dj > di {
                            close[[j, i]] = normalized[[j, i]];
                        } else {
                            further[[j, i]] = normalized[[j, i]];
                        }
                    }
                }
                if hop == 0 {
                    parts.push(root);
                } else {
                    parts.push(root + close);
                    parts.push(further);
                }
            }
            let mut a = Array3::<f32>::zeros((parts.len(), n, n));
            for (k, p) in parts.into_iter().enumerate() {
                a.index_axis_mut(ndarray::Axis(0), k).assign(&p);
            }
            a
        }
    }
}
