//! Shared types between the sync subsystem and view code
//!
//! These types are used by both:
//! - the overlay/reconciliation engine (`overlay-sync`)
//! - task board, settings, EOD report and notification views
//!
//! Serializable with serde for JSON over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Field values are carried as raw JSON; the engine never interprets them.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Identity
// ============================================================================

/// Canonical identifier of a domain object (task, project, report, notification)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Fresh client-side id for an optimistic creation
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Normalize any textual form of an id into the one used as a map key.
    ///
    /// UUIDs in simple, braced, URN or upper-case form collapse to the
    /// lowercase hyphenated form. Other ids are only trimmed.
    pub fn canonical(raw: &str) -> Self {
        let trimmed = raw.trim();
        match uuid::Uuid::parse_str(trimmed) {
            Ok(uuid) => Self(uuid.hyphenated().to_string()),
            Err(_) => Self(trimmed.to_string()),
        }
    }

    /// Read an id out of a JSON attribute. Numeric ids are accepted.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(Self::canonical(s)),
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self::canonical(raw)
    }
}

/// Identifier of one logical write (ULID, sortable by creation)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl TicketId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Entities and Snapshots
// ============================================================================

/// A resource plus the filter a view lists it with, e.g. `tasks?project=p1`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceScope {
    pub resource: String,
    #[serde(default)]
    pub filter: BTreeMap<String, String>,
}

impl ResourceScope {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filter: BTreeMap::new(),
        }
    }

    /// Add a filter term (builder pattern)
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.resource)?;
        let mut sep = '?';
        for (key, value) in &self.filter {
            write!(f, "{sep}{key}={value}")?;
            sep = '&';
        }
        Ok(())
    }
}

/// One domain object as a bag of named fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub fields: FieldMap,
}

impl Entity {
    pub fn new(id: EntityId, fields: FieldMap) -> Self {
        Self { id, fields }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// Server-reported list of entities for one scope. Total replacement, never a diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub scope: ResourceScope,
    pub entities: Vec<Entity>,
    /// When the fetch producing this snapshot was issued (not when it arrived),
    /// so out-of-order responses order correctly against confirmations.
    pub fetched_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(scope: ResourceScope, entities: Vec<Entity>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            scope,
            entities,
            fetched_at,
        }
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.iter().any(|e| &e.id == id)
    }
}

/// UI-visible result of reconciling a snapshot with live overlays
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergedView {
    pub scope: ResourceScope,
    pub entities: Vec<Entity>,
    /// Entities showing at least one unconfirmed local value
    pub pending: BTreeSet<EntityId>,
    pub fetched_at: DateTime<Utc>,
}

impl MergedView {
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.id == id)
    }

    pub fn field(&self, id: &EntityId, name: &str) -> Option<&serde_json::Value> {
        self.get(id).and_then(|e| e.field(name))
    }
}

// ============================================================================
// Mutations
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Ticket lifecycle: Pending -> Confirmed, or Pending -> Failed -> RolledBack
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Confirmed,
    Failed,
    RolledBack,
}

impl TicketStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TicketStatus::Confirmed | TicketStatus::RolledBack)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverlayStatus {
    Pending,
    Confirmed,
    RolledBack,
}

/// Whether a write came from a silent autosave or an explicit user submit.
/// Only `Submit` produces a success confirmation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteIntent {
    #[default]
    Autosave,
    Submit,
}

/// Tracking unit for a single logical write in flight to the remote service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationTicket {
    pub ticket_id: TicketId,
    pub entity_id: EntityId,
    pub resource: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub status: TicketStatus,
    pub intent: WriteIntent,
    /// Set once a lane has taken the payload; later edits get a new ticket.
    pub dispatched: bool,
    pub superseded_by: Option<TicketId>,
}

impl MutationTicket {
    pub fn new(
        entity_id: EntityId,
        resource: impl Into<String>,
        operation: Operation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            ticket_id: TicketId::new(),
            entity_id,
            resource: resource.into(),
            operation,
            payload,
            attempts: 0,
            created_at: Utc::now(),
            status: TicketStatus::Pending,
            intent: WriteIntent::Autosave,
            dispatched: false,
            superseded_by: None,
        }
    }
}

// ============================================================================
// Remote listing
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ListQuery {
    pub filter: BTreeMap<String, String>,
    pub pagination: Pagination,
}

impl From<&ResourceScope> for ListQuery {
    fn from(scope: &ResourceScope) -> Self {
        Self {
            filter: scope.filter.clone(),
            pagination: Pagination::default(),
        }
    }
}

/// One page of a remote list call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ListPage {
    pub items: Vec<serde_json::Value>,
    #[serde(default)]
    pub total: u64,
}

// ============================================================================
// Tests
// ============================================================================
