//! Live synchronization with the production service.
//!
//! - [`StatusFeed`] / [`HttpFeed`]: transport to the service
//! - [`SyncState`]: pure connection state machine with the optimistic overlay
//! - [`StatusChannel`]: async driver exposing snapshot, connection state,
//!   interrupt resolution, and production start
//! - [`Workbench`]: project-scoped owner of channel, expansion, and layout memo

pub mod channel;
pub mod events;
pub mod feed;
pub mod retry;
pub mod state;
pub mod workbench;

pub use channel::{ChannelOptions, StatusChannel};
pub use events::{ChannelEvent, EventEmitter};
pub use feed::{FeedConfig, FeedMessage, FeedStream, HttpFeed, StatusFeed};
pub use retry::BackoffPolicy;
pub use state::{ApplyOutcome, ChannelView, OverlayTicket, SyncState};
pub use workbench::{Frame, Workbench};
