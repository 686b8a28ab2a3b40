//! Layered left-to-right placement of the diagram graph.
//!
//! Layers are assigned by longest path from the sources, so every edge points
//! from a lower layer to a strictly higher one. Within a layer nodes are ordered
//! by the barycenter of their predecessors to keep crossings down. The result
//! is a pure function of the input: same nodes and edges, same coordinates.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::builder::{EdgeKind, GraphEdge, GraphNode, Position};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Horizontal space between adjacent layers.
    pub layer_gap: f64,
    /// Vertical space between nodes stacked in one layer.
    pub node_gap: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            layer_gap: 120.0,
            node_gap: 40.0,
        }
    }
}

/// Axis-aligned box around every positioned node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    fn around(nodes: &[GraphNode]) -> Self {
        let mut iter = nodes.iter();
        let Some(first) = iter.next() else {
            return Self::default();
        };
        let mut bounds = Self {
            min_x: first.position.x,
            min_y: first.position.y,
            max_x: first.position.x + first.size.width,
            max_y: first.position.y + first.size.height,
        };
        for node in iter {
            bounds.min_x = bounds.min_x.min(node.position.x);
            bounds.min_y = bounds.min_y.min(node.position.y);
            bounds.max_x = bounds.max_x.max(node.position.x + node.size.width);
            bounds.max_y = bounds.max_y.max(node.position.y + node.size.height);
        }
        bounds
    }
}

/// Nodes with final coordinates, ready for rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionedGraph {
    /// Same order as the input nodes. Positions are top-left corners.
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// Node ids per layer, left to right, each in vertical order.
    pub layers: Vec<Vec<String>>,
    /// Edges dropped to break cycles or because an endpoint was missing.
    pub discarded_edges: Vec<GraphEdge>,
    pub bounds: Bounds,
}

impl PositionedGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    pub fn layer_of(&self, id: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.iter().any(|n| n == id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayoutEngine {
    config: LayoutConfig,
}

impl LayoutEngine {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    pub fn layout(&self, mut nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> PositionedGraph {
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut kept = Vec::new();
        let mut discarded = Vec::new();
        for edge in edges {
            match (
                index.get(edge.source_id.as_str()),
                index.get(edge.target_id.as_str()),
            ) {
                (Some(&s), Some(&t)) if s != t => kept.push((s, t, edge)),
                _ => {
                    tracing::warn!(edge = %edge.id, "Edge has a missing endpoint or is a self-loop, not laid out");
                    discarded.push(edge);
                }
            }
        }

        let n = nodes.len();
        let back = back_edges(n, &kept);
        let mut dag = Vec::with_capacity(kept.len());
        for (i, (s, t, edge)) in kept.into_iter().enumerate() {
            if back.contains(&i) {
                tracing::warn!(edge = %edge.id, "Cycle in pipeline graph, dropping edge");
                discarded.push(edge);
            } else {
                dag.push((s, t, edge));
            }
        }

        let layer = assign_layers(n, &dag);
        let layers = order_layers(n, &layer, &dag);
        self.place(&mut nodes, &layers);

        let bounds = Bounds::around(&nodes);
        let layer_ids = layers
            .iter()
            .map(|l| l.iter().map(|&i| nodes[i].id.clone()).collect())
            .collect();

        PositionedGraph {
            edges: dag.into_iter().map(|(_, _, e)| e).collect(),
            layers: layer_ids,
            discarded_edges: discarded,
            bounds,
            nodes,
        }
    }

    /// Columns left to right; each column's stack is centred on `y = 0`.
    fn place(&self, nodes: &mut [GraphNode], layers: &[Vec<usize>]) {
        let mut x = 0.0;
        for layer in layers {
            let width = layer
                .iter()
                .map(|&i| nodes[i].size.width)
                .fold(0.0_f64, f64::max);
            let height: f64 = layer.iter().map(|&i| nodes[i].size.height).sum::<f64>()
                + self.config.node_gap * layer.len().saturating_sub(1) as f64;

            let mut y = -height / 2.0;
            for &i in layer {
                let size = nodes[i].size;
                nodes[i].position = Position {
                    x: x + (width - size.width) / 2.0,
                    y,
                };
                y += size.height + self.config.node_gap;
            }
            x += width + self.config.layer_gap;
        }
    }
}

/// Indices into `edges` to drop so the rest is acyclic.
///
/// Structural edges are admitted first, then dependency edges in input order;
/// an edge is dropped when its target already reaches its source. Parent/child
/// placement therefore survives any dependency cycle.
fn back_edges(n: usize, edges: &[(usize, usize, GraphEdge)]) -> HashSet<usize> {
    let structural = (0..edges.len()).filter(|&i| edges[i].2.kind == EdgeKind::Structural);
    let dependency = (0..edges.len()).filter(|&i| edges[i].2.kind != EdgeKind::Structural);

    let mut succ: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut back = HashSet::new();
    for i in structural.chain(dependency) {
        let (s, t, _) = &edges[i];
        if reaches(&succ, *t, *s) {
            back.insert(i);
        } else {
            succ[*s].push(*t);
        }
    }
    back
}

fn reaches(succ: &[Vec<usize>], from: usize, to: usize) -> bool {
    let mut seen = vec![false; succ.len()];
    let mut stack = vec![from];
    while let Some(v) = stack.pop() {
        if v == to {
            return true;
        }
        if !std::mem::replace(&mut seen[v], true) {
            stack.extend(&succ[v]);
        }
    }
    false
}

/// Longest-path layering. Nodes with no edges at all go to a trailing layer.
fn assign_layers(n: usize, dag: &[(usize, usize, GraphEdge)]) -> Vec<usize> {
    let mut succ: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    let mut connected = vec![false; n];
    for (s, t, _) in dag {
        succ[*s].push(*t);
        indegree[*t] += 1;
        connected[*s] = true;
        connected[*t] = true;
    }

    let mut layer = vec![0usize; n];
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    while let Some(v) = ready.pop_first() {
        for &w in &succ[v] {
            layer[w] = layer[w].max(layer[v] + 1);
            indegree[w] -= 1;
            if indegree[w] == 0 {
                ready.insert(w);
            }
        }
    }

    if connected.iter().any(|&c| c) {
        let trailing = (0..n)
            .filter(|&i| connected[i])
            .map(|i| layer[i])
            .max()
            .unwrap_or(0)
            + 1;
        for i in (0..n).filter(|&i| !connected[i]) {
            layer[i] = trailing;
        }
    }
    layer
}

/// Group node indices by layer and order each layer by predecessor barycenter.
fn order_layers(n: usize, layer: &[usize], dag: &[(usize, usize, GraphEdge)]) -> Vec<Vec<usize>> {
    let depth = layer.iter().copied().max().map_or(0, |m| m + 1);
    let mut layers: Vec<Vec<usize>> = vec![Vec::new(); depth];
    for i in 0..n {
        layers[layer[i]].push(i);
    }

    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (s, t, _) in dag {
        preds[*t].push(*s);
    }

    let mut slot = vec![0usize; n];
    for l in 0..layers.len() {
        if l > 0 {
            let mut keyed: Vec<(f64, usize)> = layers[l]
                .iter()
                .enumerate()
                .map(|(pos, &i)| {
                    let key = if preds[i].is_empty() {
                        pos as f64
                    } else {
                        preds[i].iter().map(|&p| slot[p] as f64).sum::<f64>()
                            / preds[i].len() as f64
                    };
                    (key, i)
                })
                .collect();
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            layers[l] = keyed.into_iter().map(|(_, i)| i).collect();
        }
        for (pos, &i) in layers[l].iter().enumerate() {
            slot[i] = pos;
        }
    }
    layers
}
