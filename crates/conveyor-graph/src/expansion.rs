//! Single-node expansion state.
//!
//! At most one artifact is expanded at a time, showing one kind of auxiliary
//! content. Expanding another node replaces the previous expansion outright.

use std::collections::HashSet;

use conveyor_types::PipelineSnapshot;
use serde::{Deserialize, Serialize};

use crate::layout::{Bounds, PositionedGraph};

/// Auxiliary content shown next to an expanded node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpandKind {
    Questions,
    Children,
    Document,
}

impl std::str::FromStr for ExpandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "questions" => Ok(ExpandKind::Questions),
            "children" => Ok(ExpandKind::Children),
            "document" => Ok(ExpandKind::Document),
            other => Err(format!(
                "unknown expand type '{other}' (expected questions, children, or document)"
            )),
        }
    }
}

/// The expanded node and what it shows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expanded {
    pub node_id: String,
    pub kind: ExpandKind,
}

impl Expanded {
    pub fn new(node_id: impl Into<String>, kind: ExpandKind) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
        }
    }
}

/// Request to re-frame the viewport around freshly laid out content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitRequest {
    pub bounds: Bounds,
}

#[derive(Debug, Default)]
pub struct ExpansionController {
    current: Option<Expanded>,
    fit_pending: bool,
    auto_expand: Option<Expanded>,
    auto_expanded: HashSet<String>,
}

impl ExpansionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expanded(&self) -> Option<&Expanded> {
        self.current.as_ref()
    }

    pub fn expanded_node_id(&self) -> Option<&str> {
        self.current.as_ref().map(|e| e.node_id.as_str())
    }

    pub fn expand_type(&self) -> Option<ExpandKind> {
        self.current.as_ref().map(|e| e.kind)
    }

    /// Expand `node_id`, implicitly collapsing whatever was expanded before.
    pub fn expand(&mut self, node_id: impl Into<String>, kind: ExpandKind) {
        let next = Expanded::new(node_id, kind);
        if let Some(prev) = &self.current {
            if prev.node_id != next.node_id {
                tracing::debug!(from = %prev.node_id, to = %next.node_id, "Expansion moved");
            }
        }
        self.current = Some(next);
    }

    /// Clear the expansion and schedule a fit-to-view for the next layout.
    pub fn collapse(&mut self) {
        if let Some(prev) = self.current.take() {
            tracing::debug!(node = %prev.node_id, "Expansion collapsed");
        }
        self.fit_pending = true;
    }

    /// Expand, or collapse when the same node and kind are already expanded.
    pub fn toggle(&mut self, node_id: &str, kind: ExpandKind) {
        match &self.current {
            Some(e) if e.node_id == node_id && e.kind == kind => self.collapse(),
            _ => self.expand(node_id, kind),
        }
    }

    /// One-shot auto-expansion of a newly created artifact.
    ///
    /// Applied by [`reconcile`](Self::reconcile) once the id appears in a
    /// snapshot. An id is auto-expanded at most once.
    pub fn request_auto_expand(&mut self, node_id: impl Into<String>, kind: ExpandKind) {
        let node_id = node_id.into();
        if self.auto_expanded.contains(&node_id) {
            return;
        }
        self.auto_expand = Some(Expanded::new(node_id, kind));
    }

    /// Bring the expansion in line with the latest snapshot.
    ///
    /// An expansion pointing at a node that no longer exists is collapsed
    /// silently. Returns `true` when that happened.
    pub fn reconcile(&mut self, snapshot: &PipelineSnapshot) -> bool {
        let vanished = self
            .current
            .as_ref()
            .is_some_and(|e| !snapshot.contains(&e.node_id));
        if vanished {
            tracing::info!(
                node = self.expanded_node_id().unwrap_or_default(),
                "Expanded node left the pipeline, collapsing"
            );
            self.collapse();
        }

        let arrived = self
            .auto_expand
            .as_ref()
            .is_some_and(|p| snapshot.contains(&p.node_id));
        if arrived {
            if let Some(pending) = self.auto_expand.take() {
                tracing::debug!(node = %pending.node_id, "Auto-expanding new artifact");
                self.auto_expanded.insert(pending.node_id.clone());
                self.current = Some(pending);
            }
        }

        vanished
    }

    /// Drop all expansion state, e.g. when the viewed project changes.
    pub fn reset(&mut self) {
        self.collapse();
        self.auto_expand = None;
        self.auto_expanded.clear();
    }

    pub fn fit_pending(&self) -> bool {
        self.fit_pending
    }

    /// Yield the scheduled fit-to-view once, framed on `graph`.
    ///
    /// Call after laying out the graph that reflects the collapse.
    pub fn take_fit_request(&mut self, graph: &PositionedGraph) -> Option<FitRequest> {
        if !std::mem::take(&mut self.fit_pending) {
            return None;
        }
        Some(FitRequest {
            bounds: graph.bounds,
        })
    }
}
