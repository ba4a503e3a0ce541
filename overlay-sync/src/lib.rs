//! Overlay Sync - optimistic state reconciliation for list/detail views
//!
//! Local edits land in an overlay store and render immediately; per-entity
//! lanes carry them to the remote service in issue order; server snapshots
//! are merged under the overlays without ever discarding an unconfirmed
//! value; pollers turn count increases into "new items" notifications.

pub mod config;
pub mod debounce;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod notify;
pub mod poller;
pub mod reconciler;
pub mod remote;
pub mod store;
pub mod view;

pub use config::SyncConfig;
pub use dispatcher::{DispatchOutcome, MutationDispatcher};
pub use error::{FailureKind, RemoteError, SyncError};
pub use notify::{NotificationSink, TracingSink};
pub use remote::{AuthTokenProvider, HttpRemote, RemoteDataService, StaticToken};
pub use store::{OverlayStore, SharedStore};
pub use view::{AdditionHandle, SyncView};
