//! Construction of the diagram graph from a pipeline snapshot.
//!
//! Every artifact becomes one [`GraphNode`]. Level-2 children hang off a
//! synthetic group node attached to their parent so the level-1 spine stays a
//! simple chain. Where two or more edges converge on, or fan out from, one
//! artifact, a stateless waypoint node is inserted so the layout never has to
//! special-case fan-in.

use std::collections::{HashMap, HashSet};

use conveyor_types::{ArtifactNode, CanonicalState, PipelineSnapshot};
use serde::{Deserialize, Serialize};

use crate::classifier::StateClassifier;
use crate::expansion::{ExpandKind, Expanded};

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Extra room reserved beside an expanded node, per expansion kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarReserve {
    pub questions: Size,
    pub children: Size,
    pub document: Size,
}

impl Default for SidecarReserve {
    fn default() -> Self {
        Self {
            questions: Size::new(320.0, 120.0),
            children: Size::new(0.0, 48.0),
            document: Size::new(480.0, 240.0),
        }
    }
}

impl SidecarReserve {
    pub fn for_kind(&self, kind: ExpandKind) -> Size {
        match kind {
            ExpandKind::Questions => self.questions,
            ExpandKind::Children => self.children,
            ExpandKind::Document => self.document,
        }
    }
}

/// Node dimensions by kind. Level-1 documents are larger than level-2 items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSizing {
    pub document: Size,
    pub work_item: Size,
    pub group: Size,
    pub waypoint: Size,
    pub sidecar: SidecarReserve,
}

impl Default for NodeSizing {
    fn default() -> Self {
        Self {
            document: Size::new(240.0, 88.0),
            work_item: Size::new(200.0, 64.0),
            group: Size::new(180.0, 44.0),
            waypoint: Size::new(8.0, 8.0),
            sidecar: SidecarReserve::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Artifact,
    Waypoint,
    Group,
}

/// Payload handed through to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeData {
    Artifact {
        artifact: ArtifactNode,
        state: CanonicalState,
        #[serde(skip_serializing_if = "Option::is_none")]
        expanded: Option<ExpandKind>,
    },
    Waypoint {
        #[serde(skip_serializing_if = "Option::is_none")]
        upstream: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        downstream: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Group {
        parent_id: String,
        children: Vec<String>,
    },
}

impl NodeData {
    /// Canonical state, present only on artifact nodes.
    pub fn state(&self) -> Option<CanonicalState> {
        match self {
            NodeData::Artifact { state, .. } => Some(*state),
            _ => None,
        }
    }

    pub fn artifact(&self) -> Option<&ArtifactNode> {
        match self {
            NodeData::Artifact { artifact, .. } => Some(artifact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub position: Position,
    pub size: Size,
    pub data: NodeData,
}

impl GraphNode {
    pub fn is_expanded(&self) -> bool {
        matches!(
            self.data,
            NodeData::Artifact {
                expanded: Some(_),
                ..
            }
        )
    }
}

/// Visual style of an edge, derived from its endpoints' canonical states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStyle {
    Blocked,
    InProgress,
    Ready,
    Stabilized,
    Neutral,
}

impl From<CanonicalState> for EdgeStyle {
    fn from(state: CanonicalState) -> Self {
        match state {
            CanonicalState::Blocked => EdgeStyle::Blocked,
            CanonicalState::InProgress => EdgeStyle::InProgress,
            CanonicalState::Ready => EdgeStyle::Ready,
            CanonicalState::Stabilized => EdgeStyle::Stabilized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Declared artifact dependency, possibly routed through a waypoint.
    Dependency,
    /// Parent → group → child attachment.
    Structural,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub style_hint: EdgeStyle,
    pub kind: EdgeKind,
}

/// Children of one level-1 artifact, gathered under a group node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub parent_id: String,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildOutput {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub groups: Vec<Group>,
    pub expanded: Option<Expanded>,
}

impl BuildOutput {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn waypoints(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Waypoint)
    }

    /// The group belonging to the expanded node, if it has one.
    pub fn expanded_group(&self) -> Option<&Group> {
        let expanded = self.expanded.as_ref()?;
        self.groups.iter().find(|g| g.parent_id == expanded.node_id)
    }
}

// Synthetic ids stay inside `RESERVED_ID_PREFIXES`, which artifact ids may not use.

pub fn group_id(parent_id: &str) -> String {
    format!("group:{parent_id}")
}

fn fan_in_id(target_id: &str) -> String {
    format!("wp:in:{target_id}")
}

fn fan_out_id(source_id: &str) -> String {
    format!("wp:out:{source_id}")
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

/// Upstream / downstream artifact a synthetic node stands in for, when unique.
#[derive(Default)]
struct Anchors {
    upstream: Option<String>,
    downstream: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    classifier: StateClassifier,
    sizing: NodeSizing,
}

impl GraphBuilder {
    pub fn new(classifier: StateClassifier, sizing: NodeSizing) -> Self {
        Self { classifier, sizing }
    }

    /// Build nodes and edges for `snapshot`. Positions are left at the origin.
    ///
    /// `expanded` is attached to the matching artifact node and widens it by
    /// the sidecar reservation; the builder does not enforce single expansion.
    pub fn build(
        &self,
        snapshot: &PipelineSnapshot,
        expanded: Option<&Expanded>,
    ) -> BuildOutput {
        let states: HashMap<&str, CanonicalState> = snapshot
            .iter_all()
            .map(|a| (a.id.as_str(), self.classifier.classify_artifact(a)))
            .collect();

        let mut nodes = Vec::new();
        let mut anchors: HashMap<String, Anchors> = HashMap::new();
        let mut links: Vec<(String, String, EdgeKind)> = Vec::new();
        let mut groups = Vec::new();

        for doc in &snapshot.documents {
            nodes.push(self.artifact_node(doc, states[doc.id.as_str()], expanded));
        }

        for doc in snapshot.documents.iter().filter(|d| !d.children.is_empty()) {
            let gid = group_id(&doc.id);
            let children: Vec<String> = doc.children.iter().map(|c| c.id.clone()).collect();
            nodes.push(GraphNode {
                id: gid.clone(),
                kind: NodeKind::Group,
                position: Position::default(),
                size: self.sizing.group,
                data: NodeData::Group {
                    parent_id: doc.id.clone(),
                    children: children.clone(),
                },
            });
            anchors.insert(
                gid.clone(),
                Anchors {
                    upstream: Some(doc.id.clone()),
                    downstream: (children.len() == 1).then(|| children[0].clone()),
                },
            );
            links.push((doc.id.clone(), gid.clone(), EdgeKind::Structural));
            for child in &doc.children {
                nodes.push(self.artifact_node(child, states[child.id.as_str()], expanded));
                links.push((gid.clone(), child.id.clone(), EdgeKind::Structural));
            }
            groups.push(Group {
                id: gid,
                parent_id: doc.id.clone(),
                children,
            });
        }

        links.extend(
            collect_dependencies(snapshot, &states)
                .into_iter()
                .map(|(source, target)| (source, target, EdgeKind::Dependency)),
        );
        let links = self.route_links(links, &states, &mut nodes, &mut anchors);

        let mut seen = HashSet::new();
        let edges = links
            .into_iter()
            .filter_map(|(source, target, kind)| {
                let id = format!("{source}->{target}");
                if !seen.insert(id.clone()) {
                    return None;
                }
                let style_hint = edge_style(&source, &target, &states, &anchors);
                Some(GraphEdge {
                    id,
                    source_id: source,
                    target_id: target,
                    style_hint,
                    kind,
                })
            })
            .collect();

        BuildOutput {
            nodes,
            edges,
            groups,
            expanded: expanded.cloned(),
        }
    }

    fn artifact_node(
        &self,
        artifact: &ArtifactNode,
        state: CanonicalState,
        expanded: Option<&Expanded>,
    ) -> GraphNode {
        let mut size = if artifact.level >= 2 {
            self.sizing.work_item
        } else {
            self.sizing.document
        };
        let expanded = expanded
            .filter(|e| e.node_id == artifact.id)
            .map(|e| e.kind);
        if let Some(kind) = expanded {
            let reserve = self.sizing.sidecar.for_kind(kind);
            size.width += reserve.width;
            size.height += reserve.height;
        }
        GraphNode {
            id: artifact.id.clone(),
            kind: NodeKind::Artifact,
            position: Position::default(),
            size,
            data: NodeData::Artifact {
                artifact: artifact.clone(),
                state,
                expanded,
            },
        }
    }

    /// Route links through waypoints wherever two or more edges meet at an
    /// artifact, counting structural and dependency edges alike.
    ///
    /// A connector between an artifact and its waypoint is structural when any
    /// edge it carries is, so parent/child chains stay unbreakable in layout.
    fn route_links(
        &self,
        links: Vec<(String, String, EdgeKind)>,
        states: &HashMap<&str, CanonicalState>,
        nodes: &mut Vec<GraphNode>,
        anchors: &mut HashMap<String, Anchors>,
    ) -> Vec<(String, String, EdgeKind)> {
        let mut out_edges: HashMap<&str, (usize, EdgeKind)> = HashMap::new();
        let mut in_edges: HashMap<&str, (usize, EdgeKind)> = HashMap::new();
        for (source, target, kind) in &links {
            for (map, id) in [(&mut out_edges, source), (&mut in_edges, target)] {
                let entry = map.entry(id.as_str()).or_insert((0, EdgeKind::Dependency));
                entry.0 += 1;
                if *kind == EdgeKind::Structural {
                    entry.1 = EdgeKind::Structural;
                }
            }
        }
        let fans = |map: &HashMap<&str, (usize, EdgeKind)>, id: &str| {
            states.contains_key(id) && map.get(id).is_some_and(|(n, _)| *n >= 2)
        };

        let mut routed = Vec::new();
        let mut rewired = Vec::with_capacity(links.len());
        for (source, target, kind) in &links {
            let from = if fans(&out_edges, source) {
                let id = fan_out_id(source);
                let anchor = Anchors {
                    upstream: Some(source.clone()),
                    downstream: None,
                };
                if self.waypoint(&id, anchor, nodes, anchors) {
                    routed.push((source.clone(), id.clone(), out_edges[source.as_str()].1));
                }
                id
            } else {
                source.clone()
            };
            let to = if fans(&in_edges, target) {
                let id = fan_in_id(target);
                let anchor = Anchors {
                    upstream: None,
                    downstream: Some(target.clone()),
                };
                if self.waypoint(&id, anchor, nodes, anchors) {
                    routed.push((id.clone(), target.clone(), in_edges[target.as_str()].1));
                }
                id
            } else {
                target.clone()
            };
            rewired.push((from, to, *kind));
        }
        routed.extend(rewired);
        routed
    }

    /// Add a waypoint node unless it exists. Returns whether it was created.
    fn waypoint(
        &self,
        id: &str,
        anchor: Anchors,
        nodes: &mut Vec<GraphNode>,
        anchors: &mut HashMap<String, Anchors>,
    ) -> bool {
        if anchors.contains_key(id) {
            return false;
        }
        nodes.push(GraphNode {
            id: id.to_string(),
            kind: NodeKind::Waypoint,
            position: Position::default(),
            size: self.sizing.waypoint,
            data: NodeData::Waypoint {
                upstream: anchor.upstream.clone(),
                downstream: anchor.downstream.clone(),
            },
        });
        anchors.insert(id.to_string(), anchor);
        true
    }
}

/// Declared dependencies as (dependency, dependent) pairs in pipeline order.
fn collect_dependencies(
    snapshot: &PipelineSnapshot,
    states: &HashMap<&str, CanonicalState>,
) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();
    for artifact in snapshot.iter_all() {
        for dep in &artifact.dependencies {
            if dep == &artifact.id {
                tracing::debug!(artifact = %artifact.id, "Ignoring self-dependency");
                continue;
            }
            if !states.contains_key(dep.as_str()) {
                tracing::debug!(artifact = %artifact.id, dependency = %dep, "Dependency not in snapshot, skipping edge");
                continue;
            }
            if seen.insert((dep.as_str(), artifact.id.as_str())) {
                pairs.push((dep.clone(), artifact.id.clone()));
            }
        }
    }
    pairs
}

fn upstream_state(
    id: &str,
    states: &HashMap<&str, CanonicalState>,
    anchors: &HashMap<String, Anchors>,
) -> Option<CanonicalState> {
    match anchors.get(id) {
        Some(anchor) => anchor
            .upstream
            .as_deref()
            .and_then(|a| states.get(a).copied()),
        None => states.get(id).copied(),
    }
}

fn downstream_state(
    id: &str,
    states: &HashMap<&str, CanonicalState>,
    anchors: &HashMap<String, Anchors>,
) -> Option<CanonicalState> {
    match anchors.get(id) {
        Some(anchor) => anchor
            .downstream
            .as_deref()
            .and_then(|a| states.get(a).copied()),
        None => states.get(id).copied(),
    }
}

/// Blocked when the target is blocked, otherwise the source's state.
/// Synthetic endpoints resolve to the artifact they stand in for.
fn edge_style(
    source: &str,
    target: &str,
    states: &HashMap<&str, CanonicalState>,
    anchors: &HashMap<String, Anchors>,
) -> EdgeStyle {
    match (
        upstream_state(source, states, anchors),
        downstream_state(target, states, anchors),
    ) {
        (_, Some(CanonicalState::Blocked)) => EdgeStyle::Blocked,
        (Some(state), _) => state.into(),
        (None, Some(state)) => state.into(),
        (None, None) => EdgeStyle::Neutral,
    }
}
