//! Connection state machine and optimistic overlay, free of any I/O.
//!
//! [`SyncState`] holds the last authoritative snapshot, the connection state
//! (`connecting → connected ⇄ disconnected`), and transient overlays for
//! interrupts answered locally but not yet confirmed. The exposed view is the
//! authoritative snapshot with the overlays applied. Every authoritative
//! update discards all overlays: the server's word replaces local guesses,
//! it is never merged with them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conveyor_graph::StateClassifier;
use conveyor_types::{CanonicalState, ConnectionState, Interrupt, PipelineSnapshot, Result};

use crate::feed::FeedMessage;

/// What collaborators see of the channel at one instant.
#[derive(Debug, Clone)]
pub struct ChannelView {
    pub project: String,
    pub snapshot: Arc<PipelineSnapshot>,
    pub connection: ConnectionState,
    /// Bumped whenever `snapshot` changes.
    pub revision: u64,
    /// When the last authoritative update arrived.
    pub last_synced: Option<DateTime<Utc>>,
}

impl ChannelView {
    /// Stale-but-available: a snapshot exists while the connection is down.
    pub fn is_stale(&self) -> bool {
        self.connection == ConnectionState::Disconnected && self.last_synced.is_some()
    }
}

/// Handle to one applied overlay, used to roll it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverlayTicket(u64);

#[derive(Debug, Clone)]
struct Overlay {
    interrupt_id: String,
    artifact_id: String,
}

/// Interrupt changes caused by one authoritative update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    pub changed: bool,
    pub revision: u64,
    pub opened: Vec<Interrupt>,
    /// Closed interrupts, each flagged when answers were submitted locally.
    pub closed: Vec<(Interrupt, bool)>,
}

#[derive(Debug)]
pub struct SyncState {
    project: String,
    classifier: StateClassifier,
    connection: ConnectionState,
    authoritative: PipelineSnapshot,
    overlays: BTreeMap<OverlayTicket, Overlay>,
    next_ticket: u64,
    view: Arc<PipelineSnapshot>,
    revision: u64,
    last_synced: Option<DateTime<Utc>>,
    attempt: u32,
}

impl SyncState {
    pub fn new(project: impl Into<String>, classifier: StateClassifier) -> Self {
        Self {
            project: project.into(),
            classifier,
            connection: ConnectionState::Connecting,
            authoritative: PipelineSnapshot::default(),
            overlays: BTreeMap::new(),
            next_ticket: 0,
            view: Arc::new(PipelineSnapshot::default()),
            revision: 0,
            last_synced: None,
            attempt: 0,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }

    pub fn authoritative(&self) -> &PipelineSnapshot {
        &self.authoritative
    }

    /// The authoritative snapshot with pending overlays applied.
    pub fn snapshot(&self) -> Arc<PipelineSnapshot> {
        Arc::clone(&self.view)
    }

    pub fn view(&self) -> ChannelView {
        ChannelView {
            project: self.project.clone(),
            snapshot: self.snapshot(),
            connection: self.connection,
            revision: self.revision,
            last_synced: self.last_synced,
        }
    }

    pub fn has_overlays(&self) -> bool {
        !self.overlays.is_empty()
    }

    // ---- Connection transitions ----

    /// Transport is up. Returns `true` if the state changed.
    pub fn connected(&mut self) -> bool {
        self.attempt = 0;
        let changed = self.connection != ConnectionState::Connected;
        self.connection = ConnectionState::Connected;
        changed
    }

    /// Transport is down. The snapshot is kept as is.
    ///
    /// Returns the 0-indexed reconnect attempt this loss starts.
    pub fn disconnected(&mut self) -> u32 {
        self.connection = ConnectionState::Disconnected;
        let attempt = self.attempt;
        self.attempt = self.attempt.saturating_add(1);
        attempt
    }

    // ---- Authoritative updates ----

    /// Apply a snapshot or patch from the feed.
    ///
    /// The result must satisfy the snapshot invariants; otherwise it is
    /// rejected and the previous snapshot stays in place.
    pub fn apply(&mut self, message: FeedMessage) -> Result<ApplyOutcome> {
        let next = match message {
            FeedMessage::Snapshot(snapshot) => snapshot,
            FeedMessage::Patch(patch) => {
                let mut next = self.authoritative.clone();
                next.apply_patch(patch)?;
                next
            }
        };
        next.validate()?;

        self.last_synced = Some(Utc::now());
        let had_overlays = !self.overlays.is_empty();
        if next == self.authoritative && !had_overlays {
            return Ok(ApplyOutcome {
                changed: false,
                revision: self.revision,
                ..ApplyOutcome::default()
            });
        }

        let before = self.authoritative.interrupts();
        let after = next.interrupts();
        let opened = after
            .iter()
            .filter(|i| !before.iter().any(|b| b.id == i.id))
            .cloned()
            .collect();
        let closed = before
            .into_iter()
            .filter(|b| !after.iter().any(|i| i.id == b.id))
            .map(|b| {
                let local = self.overlays.values().any(|o| o.interrupt_id == b.id);
                (b, local)
            })
            .collect();

        if had_overlays {
            tracing::debug!(
                project = %self.project,
                overlays = self.overlays.len(),
                "Authoritative snapshot replaces optimistic overlay"
            );
        }
        self.overlays.clear();
        self.authoritative = next;
        self.rebuild_view();

        Ok(ApplyOutcome {
            changed: true,
            revision: self.revision,
            opened,
            closed,
        })
    }

    // ---- Interrupts and overlay ----

    /// An interrupt that is open in the current view.
    pub fn open_interrupt(&self, interrupt_id: &str) -> Option<Interrupt> {
        self.view.interrupt(interrupt_id)
    }

    /// Whether answers for `interrupt_id` are shown optimistically and not yet
    /// confirmed or replaced by a snapshot.
    pub fn is_pending(&self, interrupt_id: &str) -> bool {
        self.overlays.values().any(|o| o.interrupt_id == interrupt_id)
    }

    /// Show `interrupt` as resolved ahead of the next authoritative snapshot.
    pub fn begin_optimistic(&mut self, interrupt: &Interrupt) -> OverlayTicket {
        let ticket = OverlayTicket(self.next_ticket);
        self.next_ticket += 1;
        self.overlays.insert(
            ticket,
            Overlay {
                interrupt_id: interrupt.id.clone(),
                artifact_id: interrupt.artifact_id.clone(),
            },
        );
        self.rebuild_view();
        ticket
    }

    /// Undo an overlay. Returns `false` if a snapshot already replaced it.
    pub fn rollback(&mut self, ticket: OverlayTicket) -> bool {
        if self.overlays.remove(&ticket).is_none() {
            return false;
        }
        self.rebuild_view();
        true
    }

    /// Canonical state of an artifact in the current view.
    pub fn state_of(&self, artifact_id: &str) -> Option<CanonicalState> {
        self.view
            .find(artifact_id)
            .map(|a| self.classifier.classify_artifact(a))
    }

    fn rebuild_view(&mut self) {
        let mut view = self.authoritative.clone();
        for overlay in self.overlays.values() {
            if let Some(artifact) = view.find_mut(&overlay.artifact_id) {
                if artifact.interrupt_id.as_deref() == Some(overlay.interrupt_id.as_str()) {
                    artifact.interrupt_id = None;
                    artifact.questions.clear();
                    for station in &mut artifact.stations {
                        station.needs_input = false;
                    }
                }
            }
        }
        self.view = Arc::new(view);
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::{ArtifactNode, ArtifactPatch, Question, Station};

    fn state() -> SyncState {
        SyncState::new("p1", StateClassifier::default())
    }

    fn doc(id: &str, raw: &str) -> ArtifactNode {
        ArtifactNode::new(id, id, raw)
    }

    fn waiting(id: &str, interrupt: &str) -> ArtifactNode {
        let mut a = doc(id, "awaiting_operator");
        a.interrupt_id = Some(interrupt.into());
        a.stations = vec![Station {
            id: "s1".into(),
            label: "Draft".into(),
            raw_state: "active".into(),
            needs_input: true,
            current_step: None,
        }];
        a.questions = vec![Question {
            id: "q1".into(),
            text: "Audience?".into(),
            required: true,
            answer_type: Default::default(),
            choices: None,
        }];
        a
    }

    fn snap(docs: Vec<ArtifactNode>) -> FeedMessage {
        FeedMessage::Snapshot(PipelineSnapshot::new(docs))
    }

    #[test]
    fn starts_connecting_and_empty() {
        let s = state();
        assert_eq!(s.connection(), ConnectionState::Connecting);
        assert!(s.snapshot().is_empty());
        assert!(s.last_synced().is_none());
    }

    #[test]
    fn disconnect_keeps_last_snapshot() {
        let mut s = state();
        s.connected();
        s.apply(snap(vec![doc("A", "in_production")])).unwrap();
        let before = s.snapshot();

        assert_eq!(s.disconnected(), 0);
        assert_eq!(s.connection(), ConnectionState::Disconnected);
        assert_eq!(*s.snapshot(), *before);
        assert!(s.view().is_stale());
    }

    #[test]
    fn reconnect_attempts_count_up_until_connected() {
        let mut s = state();
        assert_eq!(s.disconnected(), 0);
        assert_eq!(s.disconnected(), 1);
        assert_eq!(s.disconnected(), 2);
        assert!(s.connected());
        assert!(!s.connected());
        assert_eq!(s.disconnected(), 0);
    }

    #[test]
    fn identical_snapshot_does_not_bump_revision() {
        let mut s = state();
        let first = s.apply(snap(vec![doc("A", "queued")])).unwrap();
        assert!(first.changed);
        let again = s.apply(snap(vec![doc("A", "queued")])).unwrap();
        assert!(!again.changed);
        assert_eq!(again.revision, first.revision);
    }

    #[test]
    fn invalid_snapshot_is_rejected_and_previous_kept() {
        let mut s = state();
        s.apply(snap(vec![doc("A", "queued")])).unwrap();
        let revision = s.revision();

        let err = s
            .apply(snap(vec![doc("A", "queued"), doc("A", "produced")]))
            .unwrap_err();
        assert!(matches!(err, conveyor_types::ConveyorError::InvalidSnapshot(_)));
        assert_eq!(s.revision(), revision);
        assert_eq!(s.snapshot().documents.len(), 1);
    }

    #[test]
    fn patches_update_in_place() {
        let mut s = state();
        s.apply(snap(vec![doc("A", "queued"), doc("B", "queued")])).unwrap();
        s.apply(FeedMessage::Patch(ArtifactPatch::Upsert {
            artifact: doc("A", "produced"),
            parent_id: None,
        }))
        .unwrap();
        assert_eq!(s.state_of("A"), Some(CanonicalState::Stabilized));
        assert_eq!(s.snapshot().documents[0].id, "A");
    }

    #[test]
    fn optimistic_overlay_clears_needs_input_in_view_only() {
        let mut s = state();
        s.apply(snap(vec![waiting("B", "int-1")])).unwrap();
        let interrupt = s.open_interrupt("int-1").unwrap();

        s.begin_optimistic(&interrupt);
        let view = s.snapshot();
        let b = view.find("B").unwrap();
        assert!(!b.needs_input());
        assert!(b.interrupt_id.is_none());
        assert!(s.open_interrupt("int-1").is_none());
        // Authoritative copy is untouched.
        assert!(s.authoritative().find("B").unwrap().needs_input());
    }

    #[test]
    fn rollback_restores_interrupt() {
        let mut s = state();
        s.apply(snap(vec![waiting("B", "int-1")])).unwrap();
        let interrupt = s.open_interrupt("int-1").unwrap();
        let ticket = s.begin_optimistic(&interrupt);

        assert!(s.is_pending("int-1"));
        assert!(!s.is_pending("int-2"));

        assert!(s.rollback(ticket));
        assert!(s.open_interrupt("int-1").is_some());
        assert!(!s.is_pending("int-1"));
        assert!(!s.rollback(ticket));
    }

    #[test]
    fn authoritative_snapshot_replaces_overlay() {
        let mut s = state();
        s.apply(snap(vec![waiting("B", "int-1")])).unwrap();
        let interrupt = s.open_interrupt("int-1").unwrap();
        let ticket = s.begin_optimistic(&interrupt);

        // Server has not processed the answer yet: interrupt still open.
        s.apply(snap(vec![waiting("B", "int-1")])).unwrap();
        assert!(!s.has_overlays());
        assert!(s.open_interrupt("int-1").is_some());
        assert!(!s.rollback(ticket));
    }

    #[test]
    fn interrupt_open_and_close_are_reported() {
        let mut s = state();
        let outcome = s.apply(snap(vec![waiting("B", "int-1")])).unwrap();
        assert_eq!(outcome.opened.len(), 1);
        assert_eq!(outcome.opened[0].artifact_id, "B");

        let interrupt = s.open_interrupt("int-1").unwrap();
        s.begin_optimistic(&interrupt);
        let outcome = s.apply(snap(vec![doc("B", "in_production")])).unwrap();
        assert_eq!(outcome.closed.len(), 1);
        assert_eq!(outcome.closed[0].0.id, "int-1");
        assert!(outcome.closed[0].1, "closed after local answers");
    }

    #[test]
    fn interrupt_closed_elsewhere_is_not_local() {
        let mut s = state();
        s.apply(snap(vec![waiting("B", "int-1")])).unwrap();
        let outcome = s.apply(snap(vec![doc("B", "produced")])).unwrap();
        assert_eq!(outcome.closed.len(), 1);
        assert!(!outcome.closed[0].1);
    }

    #[test]
    fn unknown_artifact_has_no_state() {
        let s = state();
        assert_eq!(s.state_of("nope"), None);
    }
}
