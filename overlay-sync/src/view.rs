//! SyncView - the per-view facade over the whole subsystem.
//!
//! A view (task board, settings panel, report editor) owns exactly one
//! `SyncView`. It holds the view's overlay store, dispatcher, save scheduler
//! and pollers, and tears all of them down together.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared_types::{
    Entity, EntityId, FieldMap, ListPage, ListQuery, MergedView, ResourceScope, Snapshot, TicketId,
    WriteIntent,
};
use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::debounce::SaveScheduler;
use crate::dispatcher::{DispatchOutcome, MutationDispatcher};
use crate::error::SyncError;
use crate::identity::IdentityKeys;
use crate::notify::NotificationSink;
use crate::poller::{PollArguments, PollListener, PollMsg, PollRegistry};
use crate::reconciler::{reconcile, snapshot_from_page};
use crate::remote::{AuthTokenProvider, RemoteDataService};
use crate::store::{OverlayStore, SharedStore};

/// State reachable from poller and child-view callbacks.
struct ViewShared {
    store: SharedStore,
    snapshots: Mutex<HashMap<ResourceScope, Snapshot>>,
}

impl ViewShared {
    fn remember(&self, snapshot: &Snapshot) {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        let newer = snapshots
            .get(&snapshot.scope)
            .map_or(true, |last| snapshot.fetched_at >= last.fetched_at);
        if newer {
            snapshots.insert(snapshot.scope.clone(), snapshot.clone());
        }
    }

    fn last_snapshot(&self, scope: &ResourceScope) -> Option<Snapshot> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
    }

    fn apply_snapshot(&self, snapshot: Snapshot) -> MergedView {
        self.remember(&snapshot);
        self.store.write(|store| reconcile(store, &snapshot))
    }

    fn apply_page(&self, scope: &ResourceScope, page: ListPage, fetched_at: DateTime<Utc>) -> MergedView {
        let snapshot = self
            .store
            .write_silent(|store| snapshot_from_page(store, scope, page, fetched_at));
        self.apply_snapshot(snapshot)
    }
}

pub struct SyncView {
    shared: Arc<ViewShared>,
    dispatcher: Arc<MutationDispatcher>,
    scheduler: SaveScheduler,
    /// Unsent tickets each save key is collecting fields into, one per entity
    batches: Arc<Mutex<HashMap<String, Vec<TicketId>>>>,
    pollers: PollRegistry,
    remote: Arc<dyn RemoteDataService>,
    auth: Arc<dyn AuthTokenProvider>,
    config: SyncConfig,
    torn_down: AtomicBool,
}

impl SyncView {
    pub fn new(
        remote: Arc<dyn RemoteDataService>,
        auth: Arc<dyn AuthTokenProvider>,
        sink: Arc<dyn NotificationSink>,
        config: SyncConfig,
    ) -> Self {
        Self::with_identity_keys(remote, auth, sink, config, IdentityKeys::default())
    }

    pub fn with_identity_keys(
        remote: Arc<dyn RemoteDataService>,
        auth: Arc<dyn AuthTokenProvider>,
        sink: Arc<dyn NotificationSink>,
        config: SyncConfig,
        keys: IdentityKeys,
    ) -> Self {
        let store = SharedStore::new(
            OverlayStore::new(keys).with_settle_horizon(config.staleness_window),
        );
        let dispatcher = Arc::new(MutationDispatcher::new(
            store.clone(),
            Arc::clone(&remote),
            Arc::clone(&auth),
            sink,
            &config,
        ));
        let scheduler = SaveScheduler::new(&dispatcher, config.clone());

        Self {
            shared: Arc::new(ViewShared {
                store,
                snapshots: Mutex::new(HashMap::new()),
            }),
            dispatcher,
            scheduler,
            batches: Arc::new(Mutex::new(HashMap::new())),
            pollers: PollRegistry::new(),
            remote,
            auth,
            config,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.shared.store
    }

    /// Revision counter bumped after every store write; re-render on change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.store.subscribe()
    }

    // ------------------------------------------------------------------------
    // Overlay Store
    // ------------------------------------------------------------------------

    pub fn set_overlay(&self, resource: &str, id: &EntityId, field: &str, value: Value) -> TicketId {
        self.shared
            .store
            .write(|store| store.set_overlay(resource, id, field, value))
    }

    pub fn clear_overlay(&self, id: &EntityId, field: &str) {
        self.shared.store.write(|store| store.clear_overlay(id, field));
    }

    pub fn get_overlay(&self, id: &EntityId) -> FieldMap {
        self.shared.store.read(|store| store.get_overlay(id))
    }

    pub fn has_pending(&self, id: &EntityId) -> bool {
        self.shared.store.read(|store| store.has_pending(id))
    }

    pub fn stage_create(&self, scope: ResourceScope, fields: FieldMap) -> (EntityId, TicketId) {
        self.shared
            .store
            .write(|store| store.stage_create(scope, fields))
    }

    pub fn stage_delete(&self, resource: &str, id: &EntityId) -> TicketId {
        self.shared
            .store
            .write(|store| store.stage_delete(resource, id))
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    pub fn dispatch(
        &self,
        ticket_id: &TicketId,
        intent: WriteIntent,
    ) -> impl Future<Output = Result<DispatchOutcome, SyncError>> + Send + 'static {
        self.dispatcher.dispatch(ticket_id, intent)
    }

    /// Apply one field edit and send it straight away.
    pub fn save(
        &self,
        resource: &str,
        id: &EntityId,
        field: &str,
        value: Value,
        intent: WriteIntent,
    ) -> impl Future<Output = Result<DispatchOutcome, SyncError>> + Send + 'static {
        let ticket_id = self.set_overlay(resource, id, field, value);
        self.dispatch(&ticket_id, intent)
    }

    // ------------------------------------------------------------------------
    // Debounced saves
    // ------------------------------------------------------------------------

    pub fn schedule<F>(&self, key: impl Into<String>, produce: F)
    where
        F: FnOnce() -> Option<TicketId> + Send + 'static,
    {
        self.scheduler.schedule(key, produce);
    }

    /// Apply a high-frequency edit now and send it once `key` goes quiet.
    /// Fields of one entity edited under the same key are sent together.
    /// Returns `None` when `key` has been finalized.
    pub fn schedule_save(
        &self,
        key: impl Into<String>,
        resource: &str,
        id: &EntityId,
        field: &str,
        value: Value,
    ) -> Option<TicketId> {
        let key = key.into();
        if self.scheduler.is_final(&key) {
            tracing::debug!(key = %key, "Record is final; edit ignored");
            return None;
        }
        let ticket_id = {
            let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
            let batch = batches.entry(key.clone()).or_default();
            let ticket_id = self.shared.store.write(|store| {
                let target = store.resolve(id);
                let joinable = batch.iter().find(|ticket_id| {
                    store
                        .ticket(ticket_id)
                        .is_some_and(|ticket| store.resolve(&ticket.entity_id) == target)
                });
                store.set_overlay_in(resource, id, field, value, joinable)
            });
            if !batch.contains(&ticket_id) {
                batch.push(ticket_id.clone());
            }
            ticket_id
        };

        let batches = Arc::clone(&self.batches);
        let dispatcher = Arc::downgrade(&self.dispatcher);
        let batch_key = key.clone();
        self.scheduler.schedule(key, move || {
            let batch = batches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&batch_key)
                .unwrap_or_default();
            let (last, earlier) = batch.split_last()?;
            if let Some(dispatcher) = dispatcher.upgrade() {
                for ticket_id in earlier {
                    // Queued on call; only the last ticket's outcome is awaited.
                    let _ = dispatcher.dispatch(ticket_id, WriteIntent::Autosave);
                }
            }
            Some(last.clone())
        });
        Some(ticket_id)
    }

    pub fn finalize(&self, key: &str) {
        self.scheduler.finalize(key);
    }

    pub fn pending_saves(&self) -> Vec<String> {
        self.scheduler.pending_keys()
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    /// Merge a snapshot for its scope and remember it for later re-renders.
    pub fn reconcile(&self, snapshot: Snapshot) -> MergedView {
        self.shared.apply_snapshot(snapshot)
    }

    /// Merged view from the last snapshot seen for `scope`; additions only if
    /// none has arrived yet.
    pub fn current_view(&self, scope: &ResourceScope) -> MergedView {
        let snapshot = self
            .shared
            .last_snapshot(scope)
            .unwrap_or_else(|| Snapshot::new(scope.clone(), Vec::new(), DateTime::<Utc>::MIN_UTC));
        self.shared
            .store
            .write_silent(|store| reconcile(store, &snapshot))
    }

    /// Fetch `scope` now and reconcile it. Without a credential the fetch is
    /// skipped and the current view returned.
    pub async fn refresh(&self, scope: &ResourceScope) -> Result<MergedView, SyncError> {
        let Some(token) = self.auth.token() else {
            tracing::debug!(scope = %scope, "No credential available; refresh skipped");
            return Ok(self.current_view(scope));
        };
        let fetched_at = Utc::now();
        let page = self
            .remote
            .list(&scope.resource, &ListQuery::from(scope), &token)
            .await?;
        Ok(self.shared.apply_page(scope, page, fetched_at))
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    /// Poll `scope` every `interval`. Each fetch is reconciled into this view;
    /// `on_new_items` runs once per observed increase.
    pub async fn start_polling<F>(
        &self,
        scope: ResourceScope,
        interval: Duration,
        on_new_items: F,
    ) -> Result<ractor::ActorRef<PollMsg>, SyncError>
    where
        F: Fn(&ResourceScope, &[Value]) + Send + Sync + 'static,
    {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(SyncError::Detached);
        }
        let listener = ViewPollListener {
            shared: Arc::downgrade(&self.shared),
            on_new_items: Box::new(on_new_items),
        };
        self.pollers
            .start(PollArguments {
                scope,
                remote: Arc::clone(&self.remote),
                auth: Arc::clone(&self.auth),
                listener: Arc::new(listener),
                interval,
            })
            .await
    }

    pub fn stop_polling(&self, scope: &ResourceScope) -> bool {
        self.pollers.stop(scope)
    }

    pub fn polled_scopes(&self) -> Vec<ResourceScope> {
        self.pollers.scopes()
    }

    // ------------------------------------------------------------------------
    // Child views
    // ------------------------------------------------------------------------

    /// Handle a child view uses to push creations it made into this view.
    pub fn additions(&self) -> AdditionHandle {
        AdditionHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Cancel pending saves, stop polling and detach in-flight writes.
    /// Requests already sent still complete; their results are ignored.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.cancel_all();
        self.pollers.stop_all();
        self.dispatcher.detach();
        tracing::debug!("Sync view torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl Drop for SyncView {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct ViewPollListener {
    shared: Weak<ViewShared>,
    on_new_items: Box<dyn Fn(&ResourceScope, &[Value]) + Send + Sync>,
}

impl PollListener for ViewPollListener {
    fn page_fetched(&self, scope: &ResourceScope, page: &ListPage, fetched_at: DateTime<Utc>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.apply_page(scope, page.clone(), fetched_at);
        }
    }

    fn new_items(&self, scope: &ResourceScope, items: &[Value]) {
        if self.shared.upgrade().is_some() {
            (self.on_new_items)(scope, items);
        }
    }
}

/// Explicit channel from a child view to its parent's pending additions.
#[derive(Clone)]
pub struct AdditionHandle {
    shared: Weak<ViewShared>,
}

impl AdditionHandle {
    /// Show `entity` in the parent's `scope` until a snapshot includes it.
    /// Returns false once the parent is gone.
    pub fn push(&self, scope: ResourceScope, entity: Entity) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared
                    .store
                    .write(|store| store.adopt_addition(scope, entity));
                true
            }
            None => false,
        }
    }

    /// Push a raw record as returned by the remote service.
    pub fn push_record(&self, scope: ResourceScope, record: Value) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let entity = shared
            .store
            .write_silent(|store| store.identities_mut().entity_from_record(record));
        match entity {
            Some(entity) => {
                shared
                    .store
                    .write(|store| store.adopt_addition(scope, entity));
                true
            }
            None => {
                tracing::warn!(scope = %scope, "Pushed record has no id; ignored");
                false
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl std::fmt::Debug for AdditionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdditionHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}
