//! Overlay Store - optimistic per-field values and the tickets behind them
//!
//! Holds everything a view has applied locally but the server has not yet
//! reflected:
//! - per (entity, field) overlay entries, at most one live entry per field
//! - mutation tickets, so late completions are matched by ticket id
//! - pending additions (optimistic creations) per resource scope
//! - removal tombstones (optimistic deletes)
//! - settled watermarks, the last confirmed value per field with the time it
//!   became authoritative, so out-of-order snapshots cannot revert it
//!
//! Resolved tickets nothing refers to any more are pruned; their final
//! status stays answerable through a bounded history.
//!
//! Every id is normalized through the [`IdentityMap`] before lookup.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared_types::{
    Entity, EntityId, FieldMap, MutationTicket, Operation, OverlayStatus, ResourceScope,
    TicketId, TicketStatus, WriteIntent,
};
use tokio::sync::watch;

use crate::identity::{IdentityKeys, IdentityMap};

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayEntry {
    pub entity_id: EntityId,
    pub field: String,
    pub value: Value,
    pub inserted_at: DateTime<Utc>,
    pub status: OverlayStatus,
    pub ticket_id: TicketId,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Value this entry superseded while that write was still unresolved
    prior: Option<Box<PriorValue>>,
}

#[derive(Debug, Clone, PartialEq)]
struct PriorValue {
    value: Value,
    ticket_id: TicketId,
    confirmed_at: Option<DateTime<Utc>>,
    prior: Option<Box<PriorValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settled {
    pub value: Value,
    pub as_of: DateTime<Utc>,
}

/// A locally created entity not yet present in any snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAddition {
    pub scope: ResourceScope,
    pub entity: Entity,
    pub ticket_id: TicketId,
    pub staged_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Removal {
    pub ticket_id: TicketId,
    pub confirmed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// OverlayStore
// ============================================================================

/// Final statuses remembered after their tickets are pruned.
const RESOLVED_HISTORY: usize = 256;

/// Default for [`OverlayStore::with_settle_horizon`].
const DEFAULT_SETTLE_HORIZON_MS: i64 = 1500;

#[derive(Debug)]
pub struct OverlayStore {
    pub(crate) identities: IdentityMap,
    pub(crate) entries: HashMap<EntityId, BTreeMap<String, OverlayEntry>>,
    pub(crate) tickets: HashMap<TicketId, MutationTicket>,
    pub(crate) resolved: VecDeque<(TicketId, TicketStatus)>,
    pub(crate) additions: Vec<PendingAddition>,
    pub(crate) removals: HashMap<EntityId, Removal>,
    pub(crate) settled: HashMap<EntityId, BTreeMap<String, Settled>>,
    pub(crate) settled_removals: HashMap<EntityId, DateTime<Utc>>,
    /// A watermark a snapshot issued this long after it still agrees with is dropped.
    pub(crate) settle_horizon: chrono::Duration,
}

impl Default for OverlayStore {
    fn default() -> Self {
        Self {
            identities: IdentityMap::default(),
            entries: HashMap::new(),
            tickets: HashMap::new(),
            resolved: VecDeque::new(),
            additions: Vec::new(),
            removals: HashMap::new(),
            settled: HashMap::new(),
            settled_removals: HashMap::new(),
            settle_horizon: chrono::Duration::milliseconds(DEFAULT_SETTLE_HORIZON_MS),
        }
    }
}

impl OverlayStore {
    pub fn new(keys: IdentityKeys) -> Self {
        Self {
            identities: IdentityMap::new(keys),
            ..Self::default()
        }
    }

    pub fn with_settle_horizon(mut self, horizon: std::time::Duration) -> Self {
        if let Ok(horizon) = chrono::Duration::from_std(horizon) {
            self.settle_horizon = horizon;
        }
        self
    }

    pub fn resolve(&self, id: &EntityId) -> EntityId {
        self.identities.resolve(id)
    }

    pub fn identities_mut(&mut self) -> &mut IdentityMap {
        &mut self.identities
    }

    /// Apply a local edit. Returns the ticket that will carry it to the server.
    ///
    /// An edit to a field whose ticket has not been taken by a lane yet updates
    /// that ticket in place. Otherwise a new ticket supersedes the old one and
    /// the old value is remembered for rollback.
    pub fn set_overlay(
        &mut self,
        resource: &str,
        entity_id: &EntityId,
        field: &str,
        value: Value,
    ) -> TicketId {
        self.set_overlay_in(resource, entity_id, field, value, None)
    }

    /// Like [`set_overlay`](Self::set_overlay), but joins `batch` while that
    /// ticket is an unsent update of the same entity, so several fields saved
    /// together leave as one write.
    pub fn set_overlay_in(
        &mut self,
        resource: &str,
        entity_id: &EntityId,
        field: &str,
        value: Value,
        batch: Option<&TicketId>,
    ) -> TicketId {
        let id = self.identities.resolve(entity_id);
        let now = Utc::now();

        if let Some(ticket_id) = self.fold_into_pending_create(&id, field, &value) {
            return ticket_id;
        }

        let old = self
            .entries
            .get_mut(&id)
            .and_then(|fields| fields.remove(field));
        let unsent = old
            .as_ref()
            .map(|entry| entry.ticket_id.clone())
            .filter(|ticket_id| self.is_unsent_update(ticket_id, &id));
        let target = batch
            .filter(|ticket_id| self.is_unsent_update(ticket_id, &id))
            .cloned()
            .or_else(|| unsent.clone());

        let ticket_id = match target.and_then(|ticket_id| self.tickets.get_mut(&ticket_id)) {
            Some(ticket) => {
                set_payload_field(&mut ticket.payload, field, value.clone());
                ticket.ticket_id.clone()
            }
            None => {
                let mut payload = FieldMap::new();
                payload.insert(field.to_string(), value.clone());
                let ticket = MutationTicket::new(
                    id.clone(),
                    resource,
                    Operation::Update,
                    Value::Object(payload),
                );
                let ticket_id = ticket.ticket_id.clone();
                self.tickets.insert(ticket_id.clone(), ticket);
                ticket_id
            }
        };

        let prior = match old {
            // Never sent, so there is nothing to fall back to but its own prior.
            Some(old) if unsent.as_ref() == Some(&old.ticket_id) => {
                if old.ticket_id != ticket_id {
                    self.drop_unsent_field(&old.ticket_id, field);
                }
                old.prior
            }
            Some(old) => {
                if let Some(old_ticket) = self.tickets.get_mut(&old.ticket_id) {
                    old_ticket.superseded_by = Some(ticket_id.clone());
                }
                Some(Box::new(PriorValue {
                    value: old.value,
                    ticket_id: old.ticket_id,
                    confirmed_at: old.confirmed_at,
                    prior: old.prior,
                }))
            }
            None => None,
        };

        self.entries.entry(id.clone()).or_default().insert(
            field.to_string(),
            OverlayEntry {
                entity_id: id,
                field: field.to_string(),
                value,
                inserted_at: now,
                status: OverlayStatus::Pending,
                ticket_id: ticket_id.clone(),
                confirmed_at: None,
                prior,
            },
        );
        ticket_id
    }

    fn is_unsent_update(&self, ticket_id: &TicketId, entity_id: &EntityId) -> bool {
        self.tickets.get(ticket_id).is_some_and(|ticket| {
            ticket.status == TicketStatus::Pending
                && !ticket.dispatched
                && ticket.operation == Operation::Update
                && self.identities.resolve(&ticket.entity_id) == *entity_id
        })
    }

    /// Take `field` out of an unsent ticket; a ticket left with nothing to
    /// send is cancelled.
    fn drop_unsent_field(&mut self, ticket_id: &TicketId, field: &str) {
        let Some(ticket) = self.tickets.get_mut(ticket_id) else {
            return;
        };
        if let Value::Object(payload) = &mut ticket.payload {
            payload.remove(field);
        }
        if ticket.payload.as_object().map_or(true, |payload| payload.is_empty()) {
            ticket.status = TicketStatus::RolledBack;
        }
    }

    /// Edits to an entity whose creation has not left yet ride along with it.
    fn fold_into_pending_create(
        &mut self,
        id: &EntityId,
        field: &str,
        value: &Value,
    ) -> Option<TicketId> {
        let addition = self.additions.iter_mut().find(|a| &a.entity.id == id)?;
        let ticket = self.tickets.get_mut(&addition.ticket_id)?;
        if ticket.dispatched || ticket.status != TicketStatus::Pending {
            return None;
        }
        addition
            .entity
            .fields
            .insert(field.to_string(), value.clone());
        set_payload_field(&mut ticket.payload, field, value.clone());
        Some(ticket.ticket_id.clone())
    }

    /// Drop the local value for one field. The field is taken out of an
    /// unsent ticket, which is cancelled once it carries nothing else.
    pub fn clear_overlay(&mut self, entity_id: &EntityId, field: &str) {
        let id = self.identities.resolve(entity_id);
        let Some(fields) = self.entries.get_mut(&id) else {
            return;
        };
        let removed = fields.remove(field);
        if fields.is_empty() {
            self.entries.remove(&id);
        }
        if let Some(entry) = removed {
            if self.is_unsent_update(&entry.ticket_id, &id) {
                self.drop_unsent_field(&entry.ticket_id, field);
            }
        }
        self.prune_tickets();
    }

    /// Live local values for one entity, pending or still inside the window.
    pub fn get_overlay(&self, entity_id: &EntityId) -> FieldMap {
        let id = self.identities.resolve(entity_id);
        self.entries
            .get(&id)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entry(&self, entity_id: &EntityId, field: &str) -> Option<&OverlayEntry> {
        let id = self.identities.resolve(entity_id);
        self.entries.get(&id).and_then(|fields| fields.get(field))
    }

    /// True while any write for the entity is unconfirmed.
    pub fn has_pending(&self, entity_id: &EntityId) -> bool {
        let id = self.identities.resolve(entity_id);
        let field_pending = self.entries.get(&id).is_some_and(|fields| {
            fields
                .values()
                .any(|entry| entry.status == OverlayStatus::Pending)
        });
        let creation_pending = self
            .additions
            .iter()
            .any(|a| a.entity.id == id && a.confirmed_at.is_none());
        let removal_pending = self
            .removals
            .get(&id)
            .is_some_and(|removal| removal.confirmed_at.is_none());
        field_pending || creation_pending || removal_pending
    }

    /// Stage an optimistic creation in `scope`. A client id is generated
    /// unless `fields` already carries one under the primary key.
    pub fn stage_create(&mut self, scope: ResourceScope, mut fields: FieldMap) -> (EntityId, TicketId) {
        let primary_key = self.identities.keys().primary.clone();
        let id = match fields.get(&primary_key).and_then(EntityId::from_value) {
            Some(id) => self.identities.resolve(&id),
            None => EntityId::generate(),
        };
        fields.insert(primary_key, Value::String(id.0.clone()));

        let ticket = MutationTicket::new(
            id.clone(),
            scope.resource.clone(),
            Operation::Create,
            Value::Object(fields.clone()),
        );
        let ticket_id = ticket.ticket_id.clone();
        self.tickets.insert(ticket_id.clone(), ticket);
        self.additions.push(PendingAddition {
            scope,
            entity: Entity::new(id.clone(), fields),
            ticket_id: ticket_id.clone(),
            staged_at: Utc::now(),
            confirmed_at: None,
        });
        (id, ticket_id)
    }

    /// Show an entity created elsewhere (e.g. by a child view) until a
    /// snapshot of `scope` includes it. Nothing is sent.
    pub fn adopt_addition(&mut self, scope: ResourceScope, mut entity: Entity) -> TicketId {
        let now = Utc::now();
        entity.id = self.identities.resolve(&entity.id);
        if let Some(existing) = self.additions.iter_mut().find(|a| a.entity.id == entity.id) {
            existing.entity.fields.extend(entity.fields);
            return existing.ticket_id.clone();
        }

        let mut ticket = MutationTicket::new(
            entity.id.clone(),
            scope.resource.clone(),
            Operation::Create,
            Value::Object(entity.fields.clone()),
        );
        ticket.dispatched = true;
        ticket.status = TicketStatus::Confirmed;
        let ticket_id = ticket.ticket_id.clone();
        self.tickets.insert(ticket_id.clone(), ticket);
        self.additions.push(PendingAddition {
            scope,
            entity,
            ticket_id: ticket_id.clone(),
            staged_at: now,
            confirmed_at: Some(now),
        });
        ticket_id
    }

    /// Stage an optimistic delete; the entity disappears from merged views.
    pub fn stage_delete(&mut self, resource: &str, entity_id: &EntityId) -> TicketId {
        let id = self.identities.resolve(entity_id);
        if let Some(existing) = self.removals.get(&id) {
            let live = self
                .tickets
                .get(&existing.ticket_id)
                .is_some_and(|t| !t.status.is_terminal());
            if live {
                return existing.ticket_id.clone();
            }
        }

        let ticket = MutationTicket::new(id.clone(), resource, Operation::Delete, Value::Null);
        let ticket_id = ticket.ticket_id.clone();
        self.tickets.insert(ticket_id.clone(), ticket);
        self.removals.insert(
            id,
            Removal {
                ticket_id: ticket_id.clone(),
                confirmed_at: None,
            },
        );
        ticket_id
    }

    pub fn additions(&self, scope: &ResourceScope) -> Vec<&PendingAddition> {
        self.additions.iter().filter(|a| &a.scope == scope).collect()
    }

    pub fn ticket(&self, ticket_id: &TicketId) -> Option<&MutationTicket> {
        self.tickets.get(ticket_id)
    }

    /// Current status, or the final one for a recently pruned ticket.
    pub fn ticket_status(&self, ticket_id: &TicketId) -> Option<TicketStatus> {
        self.tickets.get(ticket_id).map(|t| t.status).or_else(|| {
            self.resolved
                .iter()
                .rev()
                .find(|(id, _)| id == ticket_id)
                .map(|(_, status)| *status)
        })
    }

    /// Tickets still held, live or referenced by a live entry.
    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    pub fn set_intent(&mut self, ticket_id: &TicketId, intent: WriteIntent) {
        if let Some(ticket) = self.tickets.get_mut(ticket_id) {
            ticket.intent = intent;
        }
    }

    /// Drop all view-owned state.
    pub fn clear(&mut self) {
        let keys = self.identities.keys().clone();
        let settle_horizon = self.settle_horizon;
        *self = Self {
            settle_horizon,
            ..Self::new(keys)
        };
    }

    /// Forget resolved tickets that no entry, prior, addition or tombstone
    /// refers to.
    pub(crate) fn prune_tickets(&mut self) {
        let mut referenced: HashSet<TicketId> = HashSet::new();
        for entry in self.entries.values().flat_map(|fields| fields.values()) {
            referenced.insert(entry.ticket_id.clone());
            let mut link = entry.prior.as_deref();
            while let Some(prior) = link {
                referenced.insert(prior.ticket_id.clone());
                link = prior.prior.as_deref();
            }
        }
        referenced.extend(self.additions.iter().map(|a| a.ticket_id.clone()));
        referenced.extend(self.removals.values().map(|r| r.ticket_id.clone()));

        let resolved = &mut self.resolved;
        self.tickets.retain(|ticket_id, ticket| {
            if !ticket.status.is_terminal() || referenced.contains(ticket_id) {
                return true;
            }
            if resolved.len() == RESOLVED_HISTORY {
                resolved.pop_front();
            }
            resolved.push_back((ticket_id.clone(), ticket.status));
            false
        });
    }

    // ------------------------------------------------------------------------
    // Lane-facing transitions
    // ------------------------------------------------------------------------

    /// Take a ticket for sending. `None` when it was cancelled, already taken
    /// or already resolved.
    pub(crate) fn prepare_send(&mut self, ticket_id: &TicketId) -> Option<MutationTicket> {
        let ticket = self.tickets.get_mut(ticket_id)?;
        if ticket.status != TicketStatus::Pending || ticket.dispatched {
            return None;
        }
        ticket.dispatched = true;
        ticket.entity_id = self.identities.resolve(&ticket.entity_id);
        Some(ticket.clone())
    }

    pub(crate) fn record_attempt(&mut self, ticket_id: &TicketId) -> u32 {
        match self.tickets.get_mut(ticket_id) {
            Some(ticket) => {
                ticket.attempts += 1;
                ticket.attempts
            }
            None => 0,
        }
    }

    /// Server acknowledged the write. `ack` is the entity it returned, if any.
    pub(crate) fn confirm(&mut self, ticket_id: &TicketId, ack: Option<&Value>) -> Option<MutationTicket> {
        let now = Utc::now();
        let ticket = self.tickets.get_mut(ticket_id)?;
        ticket.status = TicketStatus::Confirmed;
        let ticket = ticket.clone();

        match ticket.operation {
            Operation::Update => self.confirm_fields(&ticket, ack, now),
            Operation::Create => self.confirm_create(&ticket, ack, now),
            Operation::Delete => {
                if let Some(removal) = self.removals.get_mut(&ticket.entity_id) {
                    if removal.ticket_id == ticket.ticket_id {
                        removal.confirmed_at = Some(now);
                    }
                }
            }
        }
        let confirmed = self.tickets.get(ticket_id).cloned();
        self.prune_tickets();
        confirmed
    }

    fn confirm_fields(&mut self, ticket: &MutationTicket, ack: Option<&Value>, now: DateTime<Utc>) {
        let Some(fields) = self.entries.get_mut(&ticket.entity_id) else {
            return;
        };
        let Some(payload) = ticket.payload.as_object() else {
            return;
        };
        for name in payload.keys() {
            let Some(entry) = fields.get_mut(name) else {
                continue;
            };
            let acked = ack.and_then(|a| a.get(name)).cloned();
            if entry.ticket_id == ticket.ticket_id {
                entry.status = OverlayStatus::Confirmed;
                entry.confirmed_at = Some(now);
                // Older writes on this lane have all resolved by now.
                entry.prior = None;
                if let Some(value) = acked {
                    entry.value = value;
                }
            } else if let Some(prior) = find_prior_mut(&mut entry.prior, &ticket.ticket_id) {
                // Superseded: record the outcome, never touch the newer entry.
                prior.confirmed_at = Some(now);
                if let Some(value) = acked {
                    prior.value = value;
                }
            }
        }
    }

    fn confirm_create(&mut self, ticket: &MutationTicket, ack: Option<&Value>, now: DateTime<Utc>) {
        let temp_id = ticket.entity_id.clone();
        let server_id = ack.and_then(|record| self.identities.id_of_record(record));
        if let Some(server_id) = server_id.filter(|server_id| *server_id != temp_id) {
            tracing::debug!(temp_id = %temp_id, server_id = %server_id, "Server assigned a new id to optimistic creation");
            self.identities.learn(temp_id.clone(), server_id.clone());
            self.rekey(&temp_id, &server_id);
        }

        if let Some(addition) = self
            .additions
            .iter_mut()
            .find(|a| a.ticket_id == ticket.ticket_id)
        {
            if let Some(Value::Object(fields)) = ack {
                for (name, value) in fields {
                    addition.entity.fields.insert(name.clone(), value.clone());
                }
            }
            addition.confirmed_at = Some(now);
        }
    }

    /// Move every piece of state keyed by `from` over to `to`.
    fn rekey(&mut self, from: &EntityId, to: &EntityId) {
        for addition in self.additions.iter_mut().filter(|a| &a.entity.id == from) {
            addition.entity.id = to.clone();
        }
        if let Some(mut fields) = self.entries.remove(from) {
            for entry in fields.values_mut() {
                entry.entity_id = to.clone();
            }
            self.entries.entry(to.clone()).or_default().extend(fields);
        }
        if let Some(removal) = self.removals.remove(from) {
            self.removals.insert(to.clone(), removal);
        }
        if let Some(settled) = self.settled.remove(from) {
            self.settled.entry(to.clone()).or_default().extend(settled);
        }
        for ticket in self.tickets.values_mut().filter(|t| &t.entity_id == from) {
            ticket.entity_id = to.clone();
        }
    }

    /// The write failed for good: restore what the user saw before the edit.
    pub(crate) fn roll_back(&mut self, ticket_id: &TicketId) -> Option<MutationTicket> {
        let ticket = self.tickets.get_mut(ticket_id)?;
        ticket.status = TicketStatus::Failed;
        let ticket = ticket.clone();

        match ticket.operation {
            Operation::Update => self.roll_back_fields(&ticket),
            Operation::Create => {
                self.additions.retain(|a| a.ticket_id != ticket.ticket_id);
                // Edits layered on a creation that never happened go with it.
                if let Some(fields) = self.entries.remove(&ticket.entity_id) {
                    for entry in fields.values() {
                        if let Some(dependent) = self.tickets.get_mut(&entry.ticket_id) {
                            if dependent.status == TicketStatus::Pending {
                                dependent.status = TicketStatus::RolledBack;
                            }
                        }
                    }
                }
            }
            Operation::Delete => {
                let matches = self
                    .removals
                    .get(&ticket.entity_id)
                    .is_some_and(|removal| removal.ticket_id == ticket.ticket_id);
                if matches {
                    self.removals.remove(&ticket.entity_id);
                }
            }
        }

        let ticket = self.tickets.get_mut(ticket_id)?;
        ticket.status = TicketStatus::RolledBack;
        let rolled_back = ticket.clone();
        self.prune_tickets();
        Some(rolled_back)
    }

    fn roll_back_fields(&mut self, ticket: &MutationTicket) {
        let now = Utc::now();
        let Some(payload) = ticket.payload.as_object() else {
            return;
        };
        let Some(fields) = self.entries.get_mut(&ticket.entity_id) else {
            return;
        };

        for name in payload.keys() {
            let Some(entry) = fields.get_mut(name) else {
                continue;
            };
            if entry.ticket_id != ticket.ticket_id {
                unlink_prior(&mut entry.prior, &ticket.ticket_id);
                continue;
            }

            match restore_prior(entry.prior.take(), &self.tickets) {
                Some(prior) => match prior.confirmed_at {
                    Some(confirmed_at) => {
                        fields.remove(name);
                        self.settled.entry(ticket.entity_id.clone()).or_default().insert(
                            name.clone(),
                            Settled {
                                value: prior.value,
                                as_of: confirmed_at,
                            },
                        );
                    }
                    None => {
                        *entry = OverlayEntry {
                            entity_id: ticket.entity_id.clone(),
                            field: name.clone(),
                            value: prior.value,
                            inserted_at: now,
                            status: OverlayStatus::Pending,
                            ticket_id: prior.ticket_id,
                            confirmed_at: None,
                            prior: prior.prior,
                        };
                    }
                },
                None => {
                    fields.remove(name);
                }
            }
        }

        if fields.is_empty() {
            self.entries.remove(&ticket.entity_id);
        }
    }

    /// The staleness window for a confirmed ticket elapsed. Returns true when
    /// a live entry or tombstone was retired.
    pub(crate) fn expire(&mut self, ticket_id: &TicketId) -> bool {
        let retired = self.retire(ticket_id);
        if retired {
            self.prune_tickets();
        }
        retired
    }

    fn retire(&mut self, ticket_id: &TicketId) -> bool {
        let Some(ticket) = self.tickets.get(ticket_id) else {
            return false;
        };
        let entity_id = ticket.entity_id.clone();

        match ticket.operation {
            Operation::Update => {
                let Some(fields) = self.entries.get_mut(&entity_id) else {
                    return false;
                };
                let expired: Vec<String> = fields
                    .iter()
                    .filter(|(_, entry)| {
                        &entry.ticket_id == ticket_id && entry.status == OverlayStatus::Confirmed
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in &expired {
                    if let Some(entry) = fields.remove(name) {
                        let as_of = entry.confirmed_at.unwrap_or(entry.inserted_at);
                        self.settled
                            .entry(entity_id.clone())
                            .or_default()
                            .insert(name.clone(), Settled { value: entry.value, as_of });
                    }
                }
                if fields.is_empty() {
                    self.entries.remove(&entity_id);
                }
                !expired.is_empty()
            }
            Operation::Delete => {
                let confirmed_at = match self.removals.get(&entity_id) {
                    Some(removal) if &removal.ticket_id == ticket_id => removal.confirmed_at,
                    _ => None,
                };
                match confirmed_at {
                    Some(confirmed_at) => {
                        self.removals.remove(&entity_id);
                        self.settled_removals.insert(entity_id, confirmed_at);
                        true
                    }
                    None => false,
                }
            }
            // Additions stay until a snapshot shows them.
            Operation::Create => false,
        }
    }
}

fn set_payload_field(payload: &mut Value, field: &str, value: Value) {
    match payload {
        Value::Object(map) => {
            map.insert(field.to_string(), value);
        }
        other => {
            let mut map = FieldMap::new();
            map.insert(field.to_string(), value);
            *other = Value::Object(map);
        }
    }
}

fn find_prior_mut<'a>(
    link: &'a mut Option<Box<PriorValue>>,
    ticket_id: &TicketId,
) -> Option<&'a mut PriorValue> {
    let prior = link.as_deref_mut()?;
    if prior.ticket_id == *ticket_id {
        return Some(prior);
    }
    find_prior_mut(&mut prior.prior, ticket_id)
}

/// Splice a failed superseded write out of the chain.
fn unlink_prior(link: &mut Option<Box<PriorValue>>, ticket_id: &TicketId) -> bool {
    let matches = link
        .as_ref()
        .is_some_and(|prior| prior.ticket_id == *ticket_id);
    if matches {
        if let Some(removed) = link.take() {
            *link = removed.prior;
        }
        return true;
    }
    match link {
        Some(prior) => unlink_prior(&mut prior.prior, ticket_id),
        None => false,
    }
}

/// Newest superseded value whose write has not failed.
fn restore_prior(
    mut link: Option<Box<PriorValue>>,
    tickets: &HashMap<TicketId, MutationTicket>,
) -> Option<PriorValue> {
    while let Some(prior) = link {
        match tickets.get(&prior.ticket_id).map(|t| t.status) {
            Some(TicketStatus::Confirmed) | Some(TicketStatus::Pending) => return Some(*prior),
            _ => link = prior.prior,
        }
    }
    None
}

// ============================================================================
// SharedStore
// ============================================================================

/// The store as owned by one view: a mutex for the lanes that complete on
/// other tasks, plus a revision counter bumped after every write so the view
/// knows to re-render.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<OverlayStore>>,
    revision: Arc<watch::Sender<u64>>,
}

impl SharedStore {
    pub fn new(store: OverlayStore) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(store)),
            revision: Arc::new(revision),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&OverlayStore) -> R) -> R {
        f(&self.lock())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut OverlayStore) -> R) -> R {
        let out = f(&mut self.lock());
        self.revision.send_modify(|rev| *rev += 1);
        out
    }

    /// Mutate without publishing a revision. Only for bookkeeping that leaves
    /// every rendered value unchanged.
    pub(crate) fn write_silent<R>(&self, f: impl FnOnce(&mut OverlayStore) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn lock(&self) -> MutexGuard<'_, OverlayStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
