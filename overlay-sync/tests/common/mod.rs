//! Shared fixtures: an in-memory remote with scripted failures and a sink
//! that records what the user would have seen.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use overlay_sync::error::{FailureKind, RemoteError};
use overlay_sync::notify::NotificationSink;
use overlay_sync::remote::RemoteDataService;
use overlay_sync::{StaticToken, SyncConfig, SyncView};
use shared_types::{EntityId, ListPage, ListQuery, MutationTicket, ResourceScope, TicketId};

// ============================================================================
// Scripted remote
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub resource: String,
    pub id: Option<String>,
    pub body: Value,
}

#[derive(Default)]
struct RemoteState {
    records: BTreeMap<String, Vec<Value>>,
    write_failures: VecDeque<RemoteError>,
    list_failures: VecDeque<RemoteError>,
    calls: Vec<Call>,
    next_id: u64,
    assign_ids: bool,
    write_delay: Duration,
}

#[derive(Default)]
pub struct ScriptedRemote {
    state: Mutex<RemoteState>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, resource: &str, records: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(resource.to_string(), records);
    }

    /// A record appearing server-side, e.g. a new notification.
    pub fn insert(&self, resource: &str, record: Value) {
        self.state
            .lock()
            .unwrap()
            .records
            .entry(resource.to_string())
            .or_default()
            .push(record);
    }

    /// The next write call (create/update/delete) fails with `error`.
    pub fn fail_next_write(&self, error: RemoteError) {
        self.state.lock().unwrap().write_failures.push_back(error);
    }

    pub fn fail_next_list(&self, error: RemoteError) {
        self.state.lock().unwrap().list_failures.push_back(error);
    }

    /// Replace client ids with `srv-N` on create.
    pub fn assign_server_ids(&self) {
        self.state.lock().unwrap().assign_ids = true;
    }

    /// Writes take this long before the server applies them.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op != "list").collect()
    }

    pub fn record(&self, resource: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(resource)
            .and_then(|records| records.iter().find(|r| id_matches(r, id)).cloned())
    }

    /// Record the call and take any scripted failure, then wait out the delay.
    async fn begin_write(&self, call: Call) -> Result<(), RemoteError> {
        let (failure, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            (state.write_failures.pop_front(), state.write_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn id_matches(record: &Value, id: &str) -> bool {
    record
        .get("id")
        .and_then(EntityId::from_value)
        .is_some_and(|record_id| record_id == EntityId::canonical(id))
}

fn field_matches(record: &Value, key: &str, expected: &str) -> bool {
    match record.get(key) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

#[async_trait]
impl RemoteDataService for ScriptedRemote {
    async fn create(&self, resource: &str, fields: &Value, _token: &str) -> Result<Value, RemoteError> {
        self.begin_write(Call {
            op: "create",
            resource: resource.to_string(),
            id: fields.get("id").and_then(|v| v.as_str()).map(str::to_string),
            body: fields.clone(),
        })
        .await?;

        let mut state = self.state.lock().unwrap();
        let mut record = fields.clone();
        if state.assign_ids {
            state.next_id += 1;
            record["id"] = json!(format!("srv-{}", state.next_id));
        }
        state
            .records
            .entry(resource.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        resource: &str,
        id: &EntityId,
        patch: &Value,
        _token: &str,
    ) -> Result<Value, RemoteError> {
        self.begin_write(Call {
            op: "update",
            resource: resource.to_string(),
            id: Some(id.to_string()),
            body: patch.clone(),
        })
        .await?;

        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(resource)
            .and_then(|records| records.iter_mut().find(|r| id_matches(r, id.as_str())))
            .ok_or_else(|| RemoteError::from_status(404, "not found"))?;
        if let (Value::Object(target), Value::Object(patch)) = (&mut *record, patch) {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(record.clone())
    }

    async fn delete(&self, resource: &str, id: &EntityId, _token: &str) -> Result<(), RemoteError> {
        self.begin_write(Call {
            op: "delete",
            resource: resource.to_string(),
            id: Some(id.to_string()),
            body: Value::Null,
        })
        .await?;

        let mut state = self.state.lock().unwrap();
        if let Some(records) = state.records.get_mut(resource) {
            records.retain(|r| !id_matches(r, id.as_str()));
        }
        Ok(())
    }

    async fn list(&self, resource: &str, query: &ListQuery, _token: &str) -> Result<ListPage, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            op: "list",
            resource: resource.to_string(),
            id: None,
            body: json!(query.filter),
        });
        if let Some(error) = state.list_failures.pop_front() {
            return Err(error);
        }

        let matching: Vec<Value> = state
            .records
            .get(resource)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| query.filter.iter().all(|(k, v)| field_matches(r, k, v)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let per_page = query.pagination.per_page.max(1) as usize;
        let skip = (query.pagination.page.max(1) as usize - 1) * per_page;
        Ok(ListPage {
            total: matching.len() as u64,
            items: matching.into_iter().skip(skip).take(per_page).collect(),
        })
    }
}

// ============================================================================
// Recording sink
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Failed { ticket_id: TicketId, kind: FailureKind },
    Submitted { ticket_id: TicketId },
    NewItems { scope: ResourceScope, items: Vec<Value> },
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<SinkEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, SinkEvent::Failed { .. }))
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn mutation_failed(&self, ticket: &MutationTicket, error: &RemoteError) {
        self.events.lock().unwrap().push(SinkEvent::Failed {
            ticket_id: ticket.ticket_id.clone(),
            kind: error.kind(),
        });
    }

    fn submit_confirmed(&self, ticket: &MutationTicket) {
        self.events.lock().unwrap().push(SinkEvent::Submitted {
            ticket_id: ticket.ticket_id.clone(),
        });
    }

    fn new_items(&self, scope: &ResourceScope, items: &[Value]) {
        self.events.lock().unwrap().push(SinkEvent::NewItems {
            scope: scope.clone(),
            items: items.to_vec(),
        });
    }
}

// ============================================================================
// View setup
// ============================================================================

pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry_delay: Duration::from_millis(300),
        staleness_window: Duration::from_millis(1500),
        debounce_default: Duration::from_millis(1500),
        ..SyncConfig::default()
    }
}

pub fn setup_view(remote: &Arc<ScriptedRemote>, sink: &Arc<RecordingSink>) -> SyncView {
    setup_view_with(remote, sink, Some("secret"), test_config())
}

pub fn setup_view_with(
    remote: &Arc<ScriptedRemote>,
    sink: &Arc<RecordingSink>,
    token: Option<&str>,
    config: SyncConfig,
) -> SyncView {
    SyncView::new(
        remote.clone(),
        Arc::new(StaticToken::new(token.map(str::to_string))),
        sink.clone(),
        config,
    )
}

pub fn tasks() -> ResourceScope {
    ResourceScope::new("tasks")
}

pub fn task(id: &str, title: &str, status: &str) -> Value {
    json!({"id": id, "title": title, "status": status})
}
