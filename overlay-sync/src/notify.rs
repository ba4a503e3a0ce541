//! User-facing notifications emitted by the engine.

use serde_json::Value;
use shared_types::{MutationTicket, ResourceScope};

use crate::error::RemoteError;

/// Receives the few events a user should see: failed writes, confirmed
/// submits, and items that newly appeared in a polled scope.
///
/// Called from lane and poller tasks; implementations must not block.
pub trait NotificationSink: Send + Sync + 'static {
    fn mutation_failed(&self, ticket: &MutationTicket, error: &RemoteError);

    fn submit_confirmed(&self, ticket: &MutationTicket);

    fn new_items(&self, scope: &ResourceScope, items: &[Value]);
}

/// Sink that only logs. Used by the watcher binary and as a default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn mutation_failed(&self, ticket: &MutationTicket, error: &RemoteError) {
        tracing::warn!(
            ticket_id = %ticket.ticket_id,
            entity_id = %ticket.entity_id,
            resource = %ticket.resource,
            kind = %error.kind(),
            error = %error,
            "Save failed; change reverted"
        );
    }

    fn submit_confirmed(&self, ticket: &MutationTicket) {
        tracing::info!(
            ticket_id = %ticket.ticket_id,
            entity_id = %ticket.entity_id,
            resource = %ticket.resource,
            "Saved"
        );
    }

    fn new_items(&self, scope: &ResourceScope, items: &[Value]) {
        tracing::info!(scope = %scope, count = items.len(), "New items");
        for item in items {
            tracing::info!(scope = %scope, item = %item, "New item");
        }
    }
}
