//! PollActor - poll-driven invalidation for one resource scope.
//!
//! A spawned interval loop casts `Tick`; each tick lists the scope, hands the
//! page to the owning view for reconciliation, and compares the reported
//! count with the previous one. Only an increase notifies, once, with the
//! items not seen on the previous page. Failures are logged and the next tick
//! runs as usual.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use shared_types::{EntityId, ListPage, ListQuery, ResourceScope};
use tokio::task::JoinHandle;

use crate::error::{RemoteError, SyncError};
use crate::identity::IdentityMap;
use crate::remote::{AuthTokenProvider, RemoteDataService};

/// Floor for poll intervals.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives what a poll produced.
pub trait PollListener: Send + Sync + 'static {
    /// Every successful fetch, for reconciliation.
    fn page_fetched(&self, scope: &ResourceScope, page: &ListPage, fetched_at: DateTime<Utc>);

    /// The scope's count grew; `items` are the ones not on the previous page.
    fn new_items(&self, scope: &ResourceScope, items: &[Value]);
}

#[derive(Clone)]
pub struct PollArguments {
    pub scope: ResourceScope,
    pub remote: Arc<dyn RemoteDataService>,
    pub auth: Arc<dyn AuthTokenProvider>,
    pub listener: Arc<dyn PollListener>,
    pub interval: Duration,
}

pub struct PollState {
    scope: ResourceScope,
    remote: Arc<dyn RemoteDataService>,
    auth: Arc<dyn AuthTokenProvider>,
    listener: Arc<dyn PollListener>,
    baseline: Option<u64>,
    last_ids: HashSet<EntityId>,
    identities: IdentityMap,
    ticker: Option<JoinHandle<()>>,
}

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PollReport {
    /// Count reported by the server; `None` when the poll was skipped
    pub total: Option<u64>,
    pub new_items: usize,
    pub notified: bool,
}

#[derive(Debug)]
pub enum PollMsg {
    /// Internal trigger from the interval loop.
    Tick,
    /// Poll immediately and report.
    PollNow {
        reply: RpcReplyPort<Result<PollReport, String>>,
    },
    GetBaseline {
        reply: RpcReplyPort<Option<u64>>,
    },
}

#[derive(Debug, Default)]
pub struct PollActor;

#[async_trait]
impl Actor for PollActor {
    type Msg = PollMsg;
    type State = PollState;
    type Arguments = PollArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let interval = args.interval.max(MIN_POLL_INTERVAL);
        let tick_ref = myself.clone();
        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if tick_ref.cast(PollMsg::Tick).is_err() {
                    break;
                }
            }
        });

        tracing::debug!(scope = %args.scope, interval_ms = interval.as_millis() as u64, "Polling started");

        Ok(PollState {
            scope: args.scope,
            remote: args.remote,
            auth: args.auth,
            listener: args.listener,
            baseline: None,
            last_ids: HashSet::new(),
            identities: IdentityMap::default(),
            ticker: Some(ticker),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PollMsg::Tick => {
                if let Err(e) = self.poll_once(state).await {
                    tracing::warn!(scope = %state.scope, error = %e, "Poll tick failed");
                }
            }
            PollMsg::PollNow { reply } => {
                let result = self.poll_once(state).await.map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            PollMsg::GetBaseline { reply } => {
                let _ = reply.send(state.baseline);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        tracing::debug!(scope = %state.scope, "Polling stopped");
        Ok(())
    }
}

impl PollActor {
    async fn poll_once(&self, state: &mut PollState) -> Result<PollReport, RemoteError> {
        let Some(token) = state.auth.token() else {
            tracing::debug!(scope = %state.scope, "No credential available; poll skipped");
            return Ok(PollReport::default());
        };

        let fetched_at = Utc::now();
        let query = ListQuery::from(&state.scope);
        let page = state
            .remote
            .list(&state.scope.resource, &query, &token)
            .await?;

        state.listener.page_fetched(&state.scope, &page, fetched_at);

        let mut page_ids = HashSet::with_capacity(page.items.len());
        let mut unseen = Vec::new();
        for item in &page.items {
            let Some(id) = state.identities.id_of_record(item) else {
                continue;
            };
            if !state.last_ids.contains(&id) {
                unseen.push(item.clone());
            }
            page_ids.insert(id);
        }

        let total = page.total;
        let notified = match state.baseline {
            Some(previous) if total > previous => {
                tracing::debug!(scope = %state.scope, previous, total, "New items observed");
                state.listener.new_items(&state.scope, &unseen);
                true
            }
            _ => false,
        };
        state.baseline = Some(total);
        state.last_ids = page_ids;

        Ok(PollReport {
            total: Some(total),
            new_items: if notified { unseen.len() } else { 0 },
            notified,
        })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// At most one poller per scope; owned by a view.
#[derive(Default)]
pub struct PollRegistry {
    pollers: Mutex<HashMap<ResourceScope, ActorRef<PollMsg>>>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start polling `args.scope`, replacing any poller already running for it.
    pub async fn start(&self, args: PollArguments) -> Result<ActorRef<PollMsg>, SyncError> {
        let scope = args.scope.clone();
        let (actor, _handle) = Actor::spawn(None, PollActor, args)
            .await
            .map_err(|e| SyncError::Poller(e.to_string()))?;

        let previous = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope, actor.clone());
        if let Some(previous) = previous {
            previous.stop(None);
        }
        Ok(actor)
    }

    pub fn stop(&self, scope: &ResourceScope) -> bool {
        let removed = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope);
        match removed {
            Some(actor) => {
                actor.stop(None);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, actor) in pollers.drain() {
            actor.stop(None);
        }
    }

    pub fn get(&self, scope: &ResourceScope) -> Option<ActorRef<PollMsg>> {
        self.pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
    }

    pub fn scopes(&self) -> Vec<ResourceScope> {
        let mut scopes: Vec<ResourceScope> = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        scopes.sort();
        scopes
    }
}

/// Ask a poller to run now, outside its interval.
pub async fn poll_now(actor: &ActorRef<PollMsg>) -> Result<PollReport, SyncError> {
    ractor::call!(actor, |reply| PollMsg::PollNow { reply })
        .map_err(|e| SyncError::Poller(e.to_string()))?
        .map_err(SyncError::Poller)
}

pub async fn baseline(actor: &ActorRef<PollMsg>) -> Result<Option<u64>, SyncError> {
    ractor::call!(actor, |reply| PollMsg::GetBaseline { reply })
        .map_err(|e| SyncError::Poller(e.to_string()))
}
