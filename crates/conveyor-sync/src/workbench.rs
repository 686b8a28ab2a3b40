//! Project-scoped controller tying the channel, expansion, and layout together.
//!
//! The [`Workbench`] is the single owner of the viewed project's
//! [`StatusChannel`] and [`ExpansionController`]. Each [`Workbench::render`]
//! reconciles the expansion against the latest snapshot and returns a frame
//! for the renderer, reusing the previous layout when neither the snapshot
//! revision nor the expansion changed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conveyor_graph::{
    ExpandKind, Expanded, ExpansionController, FitRequest, GraphView, PositionedGraph, ViewConfig,
};
use conveyor_types::{Answers, ConnectionState, ConveyorError, PipelineSnapshot, Result};
use uuid::Uuid;

use crate::channel::{ChannelOptions, StatusChannel};
use crate::feed::StatusFeed;
use crate::retry::BackoffPolicy;

/// Everything the renderer needs after one pass.
#[derive(Debug, Clone)]
pub struct Frame {
    pub project: Option<String>,
    pub graph: Arc<PositionedGraph>,
    pub connection: ConnectionState,
    pub expanded: Option<Expanded>,
    /// Present once after a collapse; frame the viewport on these bounds.
    pub fit: Option<FitRequest>,
    pub revision: u64,
    pub last_synced: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Memo {
    session: Uuid,
    revision: u64,
    expanded: Option<Expanded>,
    graph: Arc<PositionedGraph>,
}

pub struct Workbench {
    feed: Arc<dyn StatusFeed>,
    options: ChannelOptions,
    view: GraphView,
    channel: Option<StatusChannel>,
    expansion: ExpansionController,
    memo: Option<Memo>,
}

impl Workbench {
    pub fn new(feed: Arc<dyn StatusFeed>, config: &ViewConfig, backoff: BackoffPolicy) -> Self {
        Self {
            feed,
            options: ChannelOptions {
                backoff,
                classifier: config.classifier(),
            },
            view: GraphView::new(config),
            channel: None,
            expansion: ExpansionController::new(),
            memo: None,
        }
    }

    pub fn channel(&self) -> Option<&StatusChannel> {
        self.channel.as_ref()
    }

    pub fn project(&self) -> Option<&str> {
        self.channel.as_ref().map(StatusChannel::project)
    }

    pub fn expansion(&self) -> &ExpansionController {
        &self.expansion
    }

    /// Tear down the current project's channel and start syncing `project_id`.
    ///
    /// Any expansion is collapsed. Results of submissions still in flight on
    /// the old channel no longer touch local state.
    pub fn switch_project(&mut self, project_id: impl Into<String>) -> &StatusChannel {
        let project_id = project_id.into();
        if let Some(previous) = self.channel.take() {
            tracing::info!(from = %previous.project(), to = %project_id, "Switching project");
            previous.shutdown();
        }
        self.expansion.reset();
        self.memo = None;
        self.channel
            .insert(StatusChannel::open(project_id, Arc::clone(&self.feed), self.options.clone()))
    }

    /// Close the current project, if any.
    pub fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
        }
        self.expansion.reset();
        self.memo = None;
    }

    // ---- Expansion ----

    pub fn expand(&mut self, node_id: &str, kind: ExpandKind) {
        self.expansion.expand(node_id, kind);
    }

    pub fn collapse(&mut self) {
        self.expansion.collapse();
    }

    pub fn toggle(&mut self, node_id: &str, kind: ExpandKind) {
        self.expansion.toggle(node_id, kind);
    }

    pub fn request_auto_expand(&mut self, node_id: &str, kind: ExpandKind) {
        self.expansion.request_auto_expand(node_id, kind);
    }

    // ---- Rendering ----

    /// Lay out the latest snapshot with the current expansion.
    pub fn render(&mut self) -> Frame {
        let (snapshot, connection, revision, last_synced, session) = match &self.channel {
            Some(channel) => {
                let view = channel.view();
                (
                    view.snapshot,
                    view.connection,
                    view.revision,
                    view.last_synced,
                    Some(channel.session()),
                )
            }
            None => (
                Arc::new(PipelineSnapshot::default()),
                ConnectionState::Disconnected,
                0,
                None,
                None,
            ),
        };

        self.expansion.reconcile(&snapshot);
        let expanded = self.expansion.expanded().cloned();

        let cached = self.memo.as_ref().filter(|m| {
            Some(m.session) == session && m.revision == revision && m.expanded == expanded
        });
        let graph = match cached {
            Some(memo) => Arc::clone(&memo.graph),
            None => {
                let graph = Arc::new(self.view.render(&snapshot, expanded.as_ref()));
                if let Some(session) = session {
                    self.memo = Some(Memo {
                        session,
                        revision,
                        expanded: expanded.clone(),
                        graph: Arc::clone(&graph),
                    });
                }
                graph
            }
        };

        let fit = self.expansion.take_fit_request(&graph);
        Frame {
            project: self.project().map(str::to_string),
            graph,
            connection,
            expanded,
            fit,
            revision,
            last_synced,
        }
    }

    // ---- Operator calls ----

    fn open_channel(&self) -> Result<StatusChannel> {
        self.channel
            .clone()
            .ok_or_else(|| ConveyorError::Other("No project is open".into()))
    }

    pub async fn resolve_interrupt(&self, interrupt_id: &str, answers: Answers) -> Result<()> {
        self.open_channel()?
            .resolve_interrupt(interrupt_id, answers)
            .await
    }

    pub async fn start_production(&self, artifact_id: &str) -> Result<()> {
        self.open_channel()?.start_production(artifact_id).await
    }
}

impl Drop for Workbench {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedMessage, FeedStream};
    use async_trait::async_trait;
    use conveyor_types::ArtifactNode;

    struct FixedFeed;

    #[async_trait]
    impl StatusFeed for FixedFeed {
        async fn connect(&self, project_id: &str) -> Result<FeedStream> {
            let snapshot = PipelineSnapshot::new(vec![
                ArtifactNode::new(format!("{project_id}-brief"), "Brief", "produced"),
                ArtifactNode::new(format!("{project_id}-plan"), "Plan", "ready"),
            ]);
            Ok(Box::pin(tokio_stream::StreamExt::chain(
                tokio_stream::once(Ok(FeedMessage::Snapshot(snapshot))),
                tokio_stream::pending(),
            )))
        }

        async fn resolve_interrupt(&self, _interrupt_id: &str, _answers: &Answers) -> Result<()> {
            Ok(())
        }

        async fn start_production(&self, _project_id: &str, _artifact_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn workbench() -> Workbench {
        Workbench::new(Arc::new(FixedFeed), &ViewConfig::default(), BackoffPolicy::None)
    }

    async fn synced(wb: &Workbench) {
        let mut rx = wb.channel().unwrap().subscribe();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            rx.wait_for(|v| v.last_synced.is_some()),
        )
        .await
        .expect("timed out waiting for snapshot")
        .expect("channel dropped");
    }

    #[tokio::test]
    async fn render_without_project_is_empty() {
        let mut wb = workbench();
        let frame = wb.render();
        assert!(frame.project.is_none());
        assert!(frame.graph.nodes.is_empty());
        assert!(wb.start_production("x").await.is_err());
    }

    #[tokio::test]
    async fn unchanged_inputs_reuse_the_layout() {
        let mut wb = workbench();
        wb.switch_project("alpha");
        synced(&wb).await;

        let first = wb.render();
        let second = wb.render();
        assert!(Arc::ptr_eq(&first.graph, &second.graph));

        wb.expand("alpha-plan", ExpandKind::Document);
        let third = wb.render();
        assert!(!Arc::ptr_eq(&second.graph, &third.graph));
        assert!(third.graph.node("alpha-plan").unwrap().is_expanded());
    }

    #[tokio::test]
    async fn collapse_yields_one_fit_request() {
        let mut wb = workbench();
        wb.switch_project("alpha");
        synced(&wb).await;

        wb.expand("alpha-brief", ExpandKind::Questions);
        wb.render();
        wb.collapse();
        let frame = wb.render();
        assert!(frame.expanded.is_none());
        assert_eq!(frame.fit.map(|f| f.bounds), Some(frame.graph.bounds));
        assert!(wb.render().fit.is_none());
    }

    #[tokio::test]
    async fn switching_project_closes_old_channel_and_collapses() {
        let mut wb = workbench();
        let old = wb.switch_project("alpha").clone();
        synced(&wb).await;
        wb.expand("alpha-brief", ExpandKind::Document);

        wb.switch_project("beta");
        assert!(old.is_closed());
        assert!(wb.expansion().expanded().is_none());
        synced(&wb).await;

        let frame = wb.render();
        assert_eq!(frame.project.as_deref(), Some("beta"));
        assert!(frame.graph.node("beta-brief").is_some());
        assert!(frame.graph.node("alpha-brief").is_none());
    }

    #[tokio::test]
    async fn close_shuts_the_channel_down() {
        let mut wb = workbench();
        let channel = wb.switch_project("alpha").clone();
        wb.close();
        assert!(channel.is_closed());
        assert!(wb.channel().is_none());
    }
}
