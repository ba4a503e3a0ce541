//! Snapshot Reconciler
//!
//! Merges a server snapshot with the overlay store into the view the UI
//! renders. Precedence per field, highest first:
//!
//! 1. a pending local value
//! 2. a confirmed local value still inside the staleness window
//! 3. a settled watermark, when the snapshot was issued before it
//! 4. the snapshot
//!
//! Reconciling never clears a pending value. Applying the same snapshot twice
//! yields the same view.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use shared_types::{Entity, EntityId, ListPage, MergedView, OverlayStatus, ResourceScope, Snapshot};

use crate::store::{OverlayStore, PendingAddition, Settled};

/// Merge `snapshot` with everything the store holds for its scope.
pub fn reconcile(store: &mut OverlayStore, snapshot: &Snapshot) -> MergedView {
    let scope = &snapshot.scope;
    let fetched_at = snapshot.fetched_at;
    let mut entities = Vec::with_capacity(snapshot.entities.len());
    let mut pending = BTreeSet::new();
    let mut seen = HashSet::new();

    for base in &snapshot.entities {
        let id = store.identities.resolve(&base.id);
        if !seen.insert(id.clone()) {
            tracing::trace!(scope = %scope, entity_id = %id, "Duplicate entity in snapshot skipped");
            continue;
        }
        if hidden_by_removal(store, &id, fetched_at) {
            continue;
        }

        let mut entity = Entity::new(id, base.fields.clone());
        apply_settled(store, &mut entity, fetched_at);
        apply_entries(store, &mut entity, Some(fetched_at), &mut pending);
        entities.push(entity);
    }

    // Additions the server now reports are no longer ours to show.
    let before = store.additions.len();
    store.additions.retain(|a| !seen.contains(&a.entity.id));
    if store.additions.len() != before {
        tracing::debug!(
            scope = %scope,
            caught_up = before - store.additions.len(),
            "Pending additions reached the server snapshot"
        );
    }

    let staged: Vec<PendingAddition> = store
        .additions
        .iter()
        .filter(|a| &a.scope == scope && !store.removals.contains_key(&a.entity.id))
        .cloned()
        .collect();
    for addition in staged {
        let mut entity = addition.entity;
        apply_entries(store, &mut entity, None, &mut pending);
        if addition.confirmed_at.is_none() {
            pending.insert(entity.id.clone());
        }
        entities.push(entity);
    }

    store.prune_tickets();

    MergedView {
        scope: scope.clone(),
        entities,
        pending,
        fetched_at,
    }
}

/// Build a snapshot from one page of a remote list call. Records without an
/// id are dropped; alias ids are learned on the way.
pub fn snapshot_from_page(
    store: &mut OverlayStore,
    scope: &ResourceScope,
    page: ListPage,
    fetched_at: DateTime<Utc>,
) -> Snapshot {
    let entities = page
        .items
        .into_iter()
        .filter_map(|record| store.identities.entity_from_record(record))
        .collect();
    Snapshot::new(scope.clone(), entities, fetched_at)
}

fn hidden_by_removal(store: &mut OverlayStore, id: &EntityId, fetched_at: DateTime<Utc>) -> bool {
    if store.removals.contains_key(id) {
        return true;
    }
    match store.settled_removals.get(id) {
        Some(removed_at) if fetched_at < *removed_at => true,
        Some(_) => {
            // Issued after the delete and the server still lists it.
            store.settled_removals.remove(id);
            false
        }
        None => false,
    }
}

fn apply_settled(store: &mut OverlayStore, entity: &mut Entity, fetched_at: DateTime<Utc>) {
    let horizon = store.settle_horizon;
    let Some(settled) = store.settled.get_mut(&entity.id) else {
        return;
    };
    settled.retain(|field, mark| {
        if fetched_at < mark.as_of {
            entity.fields.insert(field.clone(), mark.value.clone());
            return true;
        }
        match entity.fields.get(field) {
            // The server has agreed for a full window; nothing left to guard.
            Some(value) if *value == mark.value && fetched_at - mark.as_of >= horizon => false,
            Some(value) => {
                *mark = Settled {
                    value: value.clone(),
                    as_of: fetched_at,
                };
                true
            }
            None => false,
        }
    });
    if settled.is_empty() {
        store.settled.remove(&entity.id);
    }
}

/// Overlay live entries onto `entity`. With a snapshot time, confirmed
/// entries the snapshot already reflects retire into watermarks.
fn apply_entries(
    store: &mut OverlayStore,
    entity: &mut Entity,
    fetched_at: Option<DateTime<Utc>>,
    pending: &mut BTreeSet<EntityId>,
) {
    let Some(fields) = store.entries.get_mut(&entity.id) else {
        return;
    };

    let mut caught_up: Vec<String> = Vec::new();
    for (name, entry) in fields.iter() {
        match entry.status {
            OverlayStatus::Pending => {
                entity.fields.insert(name.clone(), entry.value.clone());
                pending.insert(entity.id.clone());
            }
            OverlayStatus::Confirmed => {
                let reflected = match (fetched_at, entry.confirmed_at) {
                    (Some(fetched_at), Some(confirmed_at)) => {
                        fetched_at >= confirmed_at && entity.fields.get(name) == Some(&entry.value)
                    }
                    _ => false,
                };
                if reflected {
                    caught_up.push(name.clone());
                } else {
                    entity.fields.insert(name.clone(), entry.value.clone());
                }
            }
            OverlayStatus::RolledBack => {}
        }
    }

    if let Some(fetched_at) = fetched_at {
        for name in caught_up {
            if let Some(entry) = fields.remove(&name) {
                store.settled.entry(entity.id.clone()).or_default().insert(
                    name,
                    Settled {
                        value: entry.value,
                        as_of: fetched_at,
                    },
                );
            }
        }
    }
    if fields.is_empty() {
        store.entries.remove(&entity.id);
    }
}
