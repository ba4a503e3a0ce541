//! Debounced Save Scheduler
//!
//! Coalesces bursts of edits under one key into a single remote write once
//! the key has been quiet for its configured period. Only the last producer
//! scheduled for a key ever runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use shared_types::{TicketId, WriteIntent};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::dispatcher::{DispatchOutcome, MutationDispatcher};

struct ScheduledSave {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    saves: HashMap<String, ScheduledSave>,
    finalized: HashSet<String>,
    next_generation: u64,
    closed: bool,
}

pub struct SaveScheduler {
    state: Arc<Mutex<SchedulerState>>,
    dispatcher: Weak<MutationDispatcher>,
    config: SyncConfig,
}

impl SaveScheduler {
    pub fn new(dispatcher: &Arc<MutationDispatcher>, config: SyncConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            dispatcher: Arc::downgrade(dispatcher),
            config,
        }
    }

    /// Restart the quiet period for `key`. When it elapses, `produce` builds
    /// the write (returning the ticket to send) and the ticket is dispatched.
    pub fn schedule<F>(&self, key: impl Into<String>, produce: F)
    where
        F: FnOnce() -> Option<TicketId> + Send + 'static,
    {
        let key = key.into();
        let mut state = lock(&self.state);
        if state.closed {
            tracing::debug!(key = %key, "Scheduler closed; save ignored");
            return;
        }
        if state.finalized.contains(&key) {
            tracing::debug!(key = %key, "Record is final; save ignored");
            return;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let quiet = self.config.debounce_for(&key);

        let timer = tokio::spawn(fire_after_quiet(
            Arc::clone(&self.state),
            self.dispatcher.clone(),
            key.clone(),
            generation,
            quiet,
            produce,
        ));

        if let Some(previous) = state.saves.insert(key, ScheduledSave { generation, timer }) {
            previous.timer.abort();
        }
    }

    /// Mark `key` terminal: its pending save is dropped and later calls are ignored.
    pub fn finalize(&self, key: &str) {
        let mut state = lock(&self.state);
        if let Some(save) = state.saves.remove(key) {
            save.timer.abort();
        }
        state.finalized.insert(key.to_string());
    }

    pub fn is_final(&self, key: &str) -> bool {
        lock(&self.state).finalized.contains(key)
    }

    /// Drop one pending save without writing it.
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.state).saves.remove(key) {
            Some(save) => {
                save.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Drop every pending save and refuse new ones. Called on view teardown.
    pub fn cancel_all(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        let count = state.saves.len();
        for (_, save) in state.saves.drain() {
            save.timer.abort();
        }
        if count > 0 {
            tracing::debug!(cancelled = count, "Pending saves cancelled");
        }
    }

    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.state).saves.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Drop for SaveScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn fire_after_quiet<F>(
    state: Arc<Mutex<SchedulerState>>,
    dispatcher: Weak<MutationDispatcher>,
    key: String,
    generation: u64,
    quiet: std::time::Duration,
    produce: F,
) where
    F: FnOnce() -> Option<TicketId> + Send + 'static,
{
    tokio::time::sleep(quiet).await;

    {
        let mut state = lock(&state);
        let current = state
            .saves
            .get(&key)
            .is_some_and(|save| save.generation == generation);
        if !current || state.closed {
            return;
        }
        state.saves.remove(&key);
    }

    let Some(ticket_id) = produce() else {
        tracing::trace!(key = %key, "Nothing to save");
        return;
    };
    let Some(dispatcher) = dispatcher.upgrade() else {
        return;
    };
    let pending = dispatcher.dispatch(&ticket_id, WriteIntent::Autosave);
    drop(dispatcher);

    match pending.await {
        Ok(DispatchOutcome::Confirmed) => {
            tracing::debug!(key = %key, ticket_id = %ticket_id, "Debounced save confirmed");
        }
        Ok(outcome) => {
            tracing::debug!(key = %key, ticket_id = %ticket_id, ?outcome, "Debounced save settled");
        }
        Err(e) => {
            tracing::warn!(key = %key, ticket_id = %ticket_id, error = %e, "Debounced save not dispatched");
        }
    }
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
