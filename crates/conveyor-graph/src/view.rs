//! Builder and layout bundled behind one configuration file.

use std::path::Path;

use conveyor_types::{PipelineSnapshot, Result};
use serde::{Deserialize, Serialize};

use crate::builder::{GraphBuilder, NodeSizing};
use crate::classifier::{ClassifierConfig, StateClassifier};
use crate::expansion::Expanded;
use crate::layout::{LayoutConfig, LayoutEngine, PositionedGraph};

/// Rendering configuration. Every section is optional in the JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub classifier: ClassifierConfig,
    pub sizing: NodeSizing,
    pub layout: LayoutConfig,
}

impl ViewConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded view config");
        Ok(config)
    }

    pub fn classifier(&self) -> StateClassifier {
        StateClassifier::new(self.classifier.clone())
    }
}

/// Snapshot in, positioned graph out.
#[derive(Debug, Clone, Default)]
pub struct GraphView {
    builder: GraphBuilder,
    layout: LayoutEngine,
}

impl GraphView {
    pub fn new(config: &ViewConfig) -> Self {
        Self {
            builder: GraphBuilder::new(config.classifier(), config.sizing.clone()),
            layout: LayoutEngine::new(config.layout.clone()),
        }
    }

    pub fn render(
        &self,
        snapshot: &PipelineSnapshot,
        expanded: Option<&Expanded>,
    ) -> PositionedGraph {
        let built = self.builder.build(snapshot, expanded);
        let graph = self.layout.layout(built.nodes, built.edges);
        tracing::trace!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            layers = graph.layers.len(),
            "Rendered pipeline graph"
        );
        graph
    }
}
