//! Mutation Dispatcher
//!
//! Sends tickets to the remote service through per-entity FIFO lanes.
//! Writes to the same entity never overlap and leave in issue order; writes
//! to different entities run concurrently. Resolution (confirm, retry once,
//! roll back, notify) happens inside the lane, see [`lane`]. A lane exits
//! once its queue is empty and is respawned by the next dispatch.

mod lane;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use shared_types::{EntityId, TicketId, WriteIntent};
use tokio::sync::oneshot;

use crate::config::SyncConfig;
use crate::error::{FailureKind, SyncError};
use crate::notify::NotificationSink;
use crate::remote::{AuthTokenProvider, RemoteDataService};
use crate::store::SharedStore;

use lane::{spawn_lane, LaneContext, LaneJob, LaneSlot};

/// How a dispatched ticket ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Server acknowledged the write
    Confirmed,
    /// Failed (after the retry, where one applies) and reverted
    RolledBack(FailureKind),
    /// No credential; reverted without notice
    Skipped,
    /// Cleared or resolved before the lane reached it
    Cancelled,
    /// View torn down before completion; result ignored
    Detached,
}

enum Queued {
    Lane(EntityId, oneshot::Receiver<DispatchOutcome>),
    /// Resolved and pruned before this dispatch
    Resolved,
}

pub struct MutationDispatcher {
    ctx: Arc<LaneContext>,
}

impl MutationDispatcher {
    pub fn new(
        store: SharedStore,
        remote: Arc<dyn RemoteDataService>,
        auth: Arc<dyn AuthTokenProvider>,
        sink: Arc<dyn NotificationSink>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(LaneContext {
                store,
                remote,
                auth,
                sink,
                retry_delay: config.retry_delay,
                staleness_window: config.staleness_window,
                detached: AtomicBool::new(false),
                expiry_timers: Mutex::new(Vec::new()),
                lanes: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `ticket_id` on its entity's lane.
    ///
    /// Queueing happens before this returns, so two calls made in sequence are
    /// sent in that order even if neither future is polled. The returned
    /// future resolves once the ticket is settled.
    pub fn dispatch(
        &self,
        ticket_id: &TicketId,
        intent: WriteIntent,
    ) -> impl Future<Output = Result<DispatchOutcome, SyncError>> + Send + 'static {
        let queued = self.enqueue(ticket_id, intent);
        async move {
            match queued? {
                Queued::Lane(entity_id, reply) => {
                    reply.await.map_err(|_| SyncError::LaneClosed(entity_id))
                }
                Queued::Resolved => Ok(DispatchOutcome::Cancelled),
            }
        }
    }

    fn enqueue(&self, ticket_id: &TicketId, intent: WriteIntent) -> Result<Queued, SyncError> {
        if self.is_detached() {
            return Err(SyncError::Detached);
        }

        // The intent is bookkeeping only; no rendered value changes.
        let entity_id = self.ctx.store.write_silent(|store| {
            match store.ticket(ticket_id).map(|t| store.resolve(&t.entity_id)) {
                Some(entity_id) => {
                    store.set_intent(ticket_id, intent);
                    Ok(Some(entity_id))
                }
                None if store.ticket_status(ticket_id).is_some() => Ok(None),
                None => Err(SyncError::UnknownTicket(ticket_id.clone())),
            }
        })?;
        let Some(entity_id) = entity_id else {
            tracing::debug!(ticket_id = %ticket_id, "Ticket already resolved; nothing to send");
            return Ok(Queued::Resolved);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = LaneJob {
            ticket_id: ticket_id.clone(),
            reply: reply_tx,
        };

        // Sending under the map lock keeps a draining lane from retiring
        // between lookup and send.
        let mut lanes = self.ctx.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let lane = lanes.entry(entity_id.clone()).or_insert_with(|| {
            let generation = self.ctx.next_generation.fetch_add(1, Ordering::Relaxed);
            LaneSlot {
                generation,
                sender: spawn_lane(entity_id.clone(), generation, Arc::clone(&self.ctx)),
            }
        });
        lane.sender
            .send(job)
            .map_err(|_| SyncError::LaneClosed(entity_id.clone()))?;

        tracing::trace!(ticket_id = %ticket_id, entity_id = %entity_id, ?intent, "Mutation queued");
        Ok(Queued::Lane(entity_id, reply_rx))
    }

    /// Stop notifying and touching the store. In-flight requests finish but
    /// their results are dropped.
    pub fn detach(&self) {
        if self.ctx.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut lanes = self.ctx.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let count = lanes.len();
        lanes.clear();
        self.ctx.abort_timers();
        tracing::debug!(lanes = count, "Dispatcher detached");
    }

    pub fn is_detached(&self) -> bool {
        self.ctx.is_detached()
    }

    /// Lanes with queued or in-flight work.
    pub fn lane_count(&self) -> usize {
        self.ctx
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for MutationDispatcher {
    fn drop(&mut self) {
        self.detach();
    }
}
