//! One FIFO lane per entity: a task draining an unbounded channel, sending
//! one ticket at a time so writes reach the server in the order they were
//! issued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use shared_types::{EntityId, MutationTicket, Operation, TicketId, WriteIntent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::DispatchOutcome;
use crate::error::{FailureKind, RemoteError};
use crate::notify::NotificationSink;
use crate::remote::{AuthTokenProvider, RemoteDataService};
use crate::store::SharedStore;

pub(crate) struct LaneJob {
    pub ticket_id: TicketId,
    pub reply: oneshot::Sender<DispatchOutcome>,
}

/// A running lane as seen from the dispatcher. The generation tells a
/// retiring lane apart from its replacement.
pub(crate) struct LaneSlot {
    pub generation: u64,
    pub sender: mpsc::UnboundedSender<LaneJob>,
}

/// Everything a lane needs, shared by all lanes of one dispatcher.
pub(crate) struct LaneContext {
    pub store: SharedStore,
    pub remote: Arc<dyn RemoteDataService>,
    pub auth: Arc<dyn AuthTokenProvider>,
    pub sink: Arc<dyn NotificationSink>,
    pub retry_delay: Duration,
    pub staleness_window: Duration,
    pub detached: AtomicBool,
    pub expiry_timers: Mutex<Vec<JoinHandle<()>>>,
    pub lanes: Mutex<HashMap<EntityId, LaneSlot>>,
    pub next_generation: AtomicU64,
}

impl LaneContext {
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Remove an idle lane from the map. False when a job arrived meanwhile.
    fn retire_lane(
        &self,
        entity_id: &EntityId,
        generation: u64,
        rx: &mpsc::UnboundedReceiver<LaneJob>,
    ) -> bool {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if !rx.is_empty() {
            return false;
        }
        if lanes
            .get(entity_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            lanes.remove(entity_id);
        }
        true
    }

    pub fn abort_timers(&self) {
        let mut timers = self
            .expiry_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for timer in timers.drain(..) {
            timer.abort();
        }
    }
}

pub(crate) fn spawn_lane(
    entity_id: EntityId,
    generation: u64,
    ctx: Arc<LaneContext>,
) -> mpsc::UnboundedSender<LaneJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let outcome = run_ticket(&ctx, &job.ticket_id).await;
            // Retire before replying so a caller that saw the outcome also
            // sees the lane gone.
            let idle = rx.is_empty() && ctx.retire_lane(&entity_id, generation, &rx);
            let _ = job.reply.send(outcome);
            if idle {
                break;
            }
        }
        tracing::trace!(entity_id = %entity_id, generation, "Dispatch lane drained");
    });
    tx
}

async fn run_ticket(ctx: &Arc<LaneContext>, ticket_id: &TicketId) -> DispatchOutcome {
    // Taking the ticket changes no rendered value.
    let Some(ticket) = ctx.store.write_silent(|store| store.prepare_send(ticket_id)) else {
        tracing::debug!(ticket_id = %ticket_id, "Ticket cancelled or already resolved; nothing to send");
        return DispatchOutcome::Cancelled;
    };

    let Some(token) = ctx.auth.token() else {
        if ctx.is_detached() {
            return DispatchOutcome::Detached;
        }
        tracing::debug!(
            ticket_id = %ticket_id,
            entity_id = %ticket.entity_id,
            "No credential available; reverting without notice"
        );
        ctx.store.write(|store| store.roll_back(ticket_id));
        return DispatchOutcome::Skipped;
    };

    let mut result = send_once(ctx, &ticket, &token).await;
    if let Err(err) = &result {
        log_failure(&ticket, err);
        if err.kind().retries() && !ctx.is_detached() {
            tokio::time::sleep(ctx.retry_delay).await;
            if ctx.is_detached() {
                return DispatchOutcome::Detached;
            }
            result = send_once(ctx, &ticket, &token).await;
            if let Err(err) = &result {
                log_failure(&ticket, err);
            }
        }
    }

    if ctx.is_detached() {
        return DispatchOutcome::Detached;
    }

    match result {
        Ok(ack) => {
            let confirmed = ctx.store.write(|store| store.confirm(ticket_id, ack.as_ref()));
            if let Some(confirmed) = confirmed {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    entity_id = %confirmed.entity_id,
                    attempts = confirmed.attempts,
                    "Mutation confirmed"
                );
                if confirmed.intent == WriteIntent::Submit {
                    ctx.sink.submit_confirmed(&confirmed);
                }
            }
            schedule_expiry(ctx, ticket_id.clone());
            DispatchOutcome::Confirmed
        }
        Err(err) => {
            let kind = err.kind();
            let rolled_back = ctx.store.write(|store| store.roll_back(ticket_id));
            if let Some(rolled_back) = rolled_back {
                if !kind.is_silent() {
                    ctx.sink.mutation_failed(&rolled_back, &err);
                }
            }
            DispatchOutcome::RolledBack(kind)
        }
    }
}

async fn send_once(
    ctx: &LaneContext,
    ticket: &MutationTicket,
    token: &str,
) -> Result<Option<Value>, RemoteError> {
    ctx.store.write_silent(|store| store.record_attempt(&ticket.ticket_id));
    match ticket.operation {
        Operation::Create => ctx
            .remote
            .create(&ticket.resource, &ticket.payload, token)
            .await
            .map(Some),
        Operation::Update => ctx
            .remote
            .update(&ticket.resource, &ticket.entity_id, &ticket.payload, token)
            .await
            .map(|ack| (!ack.is_null()).then_some(ack)),
        Operation::Delete => ctx
            .remote
            .delete(&ticket.resource, &ticket.entity_id, token)
            .await
            .map(|_| None),
    }
}

fn log_failure(ticket: &MutationTicket, err: &RemoteError) {
    match err.kind() {
        FailureKind::Unknown => tracing::error!(
            ticket_id = %ticket.ticket_id,
            entity_id = %ticket.entity_id,
            resource = %ticket.resource,
            error = %err,
            "Mutation failed with unexpected error"
        ),
        FailureKind::Auth => tracing::debug!(
            ticket_id = %ticket.ticket_id,
            entity_id = %ticket.entity_id,
            error = %err,
            "Mutation rejected: credential refused"
        ),
        kind => tracing::warn!(
            ticket_id = %ticket.ticket_id,
            entity_id = %ticket.entity_id,
            resource = %ticket.resource,
            kind = %kind,
            error = %err,
            "Mutation failed"
        ),
    }
}

/// After the staleness window the confirmed overlay retires to a watermark.
fn schedule_expiry(ctx: &Arc<LaneContext>, ticket_id: TicketId) {
    let window = ctx.staleness_window;
    let timer_ctx = Arc::clone(ctx);
    let timer = tokio::spawn(async move {
        tokio::time::sleep(window).await;
        if timer_ctx.is_detached() {
            return;
        }
        let retired = timer_ctx.store.write(|store| store.expire(&ticket_id));
        if retired {
            tracing::trace!(ticket_id = %ticket_id, "Confirmed overlay retired");
        }
    });

    let mut timers = ctx
        .expiry_timers
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    timers.retain(|timer| !timer.is_finished());
    timers.push(timer);
}
