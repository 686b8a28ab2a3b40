//! Live status channel for one project.
//!
//! [`StatusChannel::open`] spawns a connection task that keeps a
//! [`SyncState`] fed from a [`StatusFeed`], reconnecting with backoff when the
//! feed drops. Collaborators watch the resulting [`ChannelView`] and call the
//! two operator operations. The task lives until [`StatusChannel::shutdown`]
//! or until the last handle is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use conveyor_graph::StateClassifier;
use conveyor_types::{
    validate_answers, Answers, CanonicalState, ConnectionState, ConveyorError, PipelineSnapshot,
    Result,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::events::{ChannelEvent, EventEmitter};
use crate::feed::{FeedMessage, StatusFeed};
use crate::retry::BackoffPolicy;
use crate::state::{ChannelView, SyncState};

#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub backoff: BackoffPolicy,
    pub classifier: StateClassifier,
}

/// State shared between the handle and the connection task.
struct Shared {
    project: String,
    session: Uuid,
    state: Mutex<SyncState>,
    view_tx: watch::Sender<ChannelView>,
    events: EventEmitter,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&SyncState) -> T) -> T {
        f(&*self.lock())
    }

    /// Mutate the state and publish the resulting view.
    fn update<T>(&self, f: impl FnOnce(&mut SyncState) -> T) -> T {
        let mut state = self.lock();
        let out = f(&mut *state);
        self.view_tx.send_replace(state.view());
        out
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ConveyorError::ChannelClosed {
                project: self.project.clone(),
            });
        }
        Ok(())
    }

    fn set_connected(&self) {
        if self.is_closed() {
            return;
        }
        if self.update(SyncState::connected) {
            tracing::info!(project = %self.project, "Status feed connected");
            self.events.emit(ChannelEvent::ConnectionChanged {
                project: self.project.clone(),
                state: ConnectionState::Connected,
                attempt: 0,
            });
        }
    }

    fn set_disconnected(&self) -> u32 {
        let attempt = self.update(SyncState::disconnected);
        self.events.emit(ChannelEvent::ConnectionChanged {
            project: self.project.clone(),
            state: ConnectionState::Disconnected,
            attempt,
        });
        attempt
    }

    fn apply(&self, message: FeedMessage) {
        if self.is_closed() {
            return;
        }
        let outcome = match self.update(|s| s.apply(message)) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(project = %self.project, error = %e, "Rejected update from status feed");
                self.events.emit(ChannelEvent::SnapshotRejected {
                    project: self.project.clone(),
                    error: e.to_string(),
                });
                return;
            }
        };
        if !outcome.changed {
            return;
        }

        let artifacts = self.read(|s| s.authoritative().iter_all().count());
        tracing::debug!(project = %self.project, revision = outcome.revision, artifacts, "Snapshot applied");
        self.events.emit(ChannelEvent::SnapshotApplied {
            project: self.project.clone(),
            revision: outcome.revision,
            artifacts,
        });
        for interrupt in outcome.opened {
            tracing::info!(interrupt = %interrupt.id, artifact = %interrupt.artifact_id, "Interrupt opened");
            self.events.emit(ChannelEvent::InterruptOpened {
                interrupt_id: interrupt.id,
                artifact_id: interrupt.artifact_id,
            });
        }
        for (interrupt, locally_resolved) in outcome.closed {
            if !locally_resolved {
                tracing::debug!(interrupt = %interrupt.id, "Interrupt closed elsewhere, discarding");
            }
            self.events.emit(ChannelEvent::InterruptClosed {
                interrupt_id: interrupt.id,
                artifact_id: interrupt.artifact_id,
                locally_resolved,
            });
        }
    }
}

struct Inner {
    shared: Arc<Shared>,
    feed: Arc<dyn StatusFeed>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn abort_task(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_task();
    }
}

/// Handle to the live connection of one project. Cheap to clone.
#[derive(Clone)]
pub struct StatusChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StatusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusChannel")
            .field("project", &self.inner.shared.project)
            .field("session", &self.inner.shared.session)
            .field("closed", &self.inner.shared.is_closed())
            .finish()
    }
}

impl StatusChannel {
    /// Start syncing `project_id`. Must be called inside a Tokio runtime.
    pub fn open(
        project_id: impl Into<String>,
        feed: Arc<dyn StatusFeed>,
        options: ChannelOptions,
    ) -> Self {
        let project = project_id.into();
        let state = SyncState::new(project.clone(), options.classifier);
        let (view_tx, _) = watch::channel(state.view());
        let shared = Arc::new(Shared {
            project,
            session: Uuid::new_v4(),
            state: Mutex::new(state),
            view_tx,
            events: EventEmitter::default(),
            closed: AtomicBool::new(false),
        });

        tracing::info!(project = %shared.project, session = %shared.session, "Opening status channel");
        let task = tokio::spawn(run_connection(
            Arc::clone(&shared),
            Arc::clone(&feed),
            options.backoff,
        ));

        Self {
            inner: Arc::new(Inner {
                shared,
                feed,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    pub fn project(&self) -> &str {
        &self.inner.shared.project
    }

    /// Unique per `open`, distinguishing channels for the same project.
    pub fn session(&self) -> Uuid {
        self.inner.shared.session
    }

    pub fn view(&self) -> ChannelView {
        self.inner.shared.view_tx.borrow().clone()
    }

    /// Latest snapshot, including any optimistic overlay.
    pub fn snapshot(&self) -> Arc<PipelineSnapshot> {
        self.inner.shared.read(SyncState::snapshot)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.shared.read(SyncState::connection)
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelView> {
        self.inner.shared.view_tx.subscribe()
    }

    /// The current view followed by every later one.
    pub fn updates(&self) -> WatchStream<ChannelView> {
        WatchStream::new(self.subscribe())
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Submit answers for an open interrupt.
    ///
    /// The interrupt is shown as resolved immediately. If submission fails the
    /// overlay is rolled back and the error returned. Answering an interrupt
    /// whose earlier answers are still shown optimistically is a submission
    /// error. An interrupt that is no longer open, locally or on the server, is
    /// discarded silently.
    pub async fn resolve_interrupt(&self, interrupt_id: &str, answers: Answers) -> Result<()> {
        let shared = &self.inner.shared;
        shared.ensure_open()?;

        let (open, pending) =
            shared.read(|s| (s.open_interrupt(interrupt_id), s.is_pending(interrupt_id)));
        if pending {
            return Err(ConveyorError::Submission {
                operation: "resolve_interrupt".into(),
                message: format!(
                    "answers for interrupt '{interrupt_id}' are awaiting confirmation"
                ),
            });
        }
        let Some(interrupt) = open else {
            tracing::debug!(interrupt = %interrupt_id, "Interrupt no longer open, nothing to submit");
            shared.events.emit(ChannelEvent::StaleInterruptDiscarded {
                interrupt_id: interrupt_id.to_string(),
            });
            return Ok(());
        };
        validate_answers(&interrupt.questions, &answers)?;

        let ticket = shared.update(|s| s.begin_optimistic(&interrupt));
        shared.events.emit(ChannelEvent::OverlayApplied {
            interrupt_id: interrupt.id.clone(),
            artifact_id: interrupt.artifact_id.clone(),
        });

        let result = self.inner.feed.resolve_interrupt(interrupt_id, &answers).await;

        if shared.is_closed() {
            tracing::debug!(interrupt = %interrupt_id, "Channel closed during submission, ignoring outcome");
            return result.or_else(|e| if e.is_stale() { Ok(()) } else { Err(e) });
        }

        match result {
            Ok(()) => {
                tracing::info!(interrupt = %interrupt_id, artifact = %interrupt.artifact_id, "Interrupt answers submitted");
                Ok(())
            }
            Err(e) if e.is_stale() => {
                tracing::debug!(interrupt = %interrupt_id, "Interrupt already resolved on the server");
                shared.events.emit(ChannelEvent::StaleInterruptDiscarded {
                    interrupt_id: interrupt_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                let rolled_back = shared.update(|s| s.rollback(ticket));
                tracing::warn!(interrupt = %interrupt_id, error = %e, rolled_back, "Interrupt submission failed");
                if rolled_back {
                    shared.events.emit(ChannelEvent::OverlayRolledBack {
                        interrupt_id: interrupt_id.to_string(),
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Ask the service to start producing a `ready` artifact.
    ///
    /// Local state is not touched; the transition shows up in a later snapshot.
    pub async fn start_production(&self, artifact_id: &str) -> Result<()> {
        let shared = &self.inner.shared;
        shared.ensure_open()?;

        let state = shared
            .read(|s| s.state_of(artifact_id))
            .ok_or_else(|| ConveyorError::UnknownArtifact {
                id: artifact_id.to_string(),
            })?;
        if state != CanonicalState::Ready {
            return Err(ConveyorError::NotReady {
                id: artifact_id.to_string(),
                state,
            });
        }

        shared.events.emit(ChannelEvent::ProductionRequested {
            artifact_id: artifact_id.to_string(),
        });
        self.inner
            .feed
            .start_production(&shared.project, artifact_id)
            .await?;
        tracing::info!(project = %shared.project, artifact = %artifact_id, "Production start requested");
        Ok(())
    }

    /// Stop the connection task. Later operations return `ChannelClosed`.
    pub fn shutdown(&self) {
        let shared = &self.inner.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.abort_task();
        shared.update(|s| {
            s.disconnected();
        });
        tracing::info!(project = %shared.project, session = %shared.session, "Status channel closed");
        shared.events.emit(ChannelEvent::ChannelClosed {
            project: shared.project.clone(),
            session: shared.session.to_string(),
        });
    }
}

/// Connect, drain the feed, back off, repeat until closed.
async fn run_connection(shared: Arc<Shared>, feed: Arc<dyn StatusFeed>, backoff: BackoffPolicy) {
    loop {
        match feed.connect(&shared.project).await {
            Ok(mut stream) => {
                shared.set_connected();
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(message) => shared.apply(message),
                        Err(e) => {
                            tracing::warn!(project = %shared.project, error = %e, "Status feed failed");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(project = %shared.project, error = %e, retryable = e.is_retryable(), "Cannot connect to status feed");
            }
        }

        if shared.is_closed() {
            break;
        }
        let attempt = shared.set_disconnected();
        let delay = backoff.delay_for_attempt(attempt);
        tracing::info!(project = %shared.project, attempt, delay_ms = %delay.as_millis(), "Reconnecting to status feed");
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}
