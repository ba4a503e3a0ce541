//! Mutation Dispatcher integration tests
//!
//! Ordering per entity, retry policy per failure kind, rollback, notification
//! rules and teardown, against the scripted in-memory remote.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use common::{setup_view, setup_view_with, task, tasks, test_config, RecordingSink, ScriptedRemote, SinkEvent};
use overlay_sync::error::{FailureKind, RemoteError, SyncError};
use overlay_sync::{DispatchOutcome, MutationDispatcher, OverlayStore, SharedStore, StaticToken};
use shared_types::{EntityId, TicketStatus, WriteIntent};

fn t1() -> EntityId {
    EntityId::canonical("t1")
}

// ============================================================================
// Success paths
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_autosave_confirms_without_notification() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let outcome = view
        .save("tasks", &t1(), "status", json!("IN_PROGRESS"), WriteIntent::Autosave)
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::Confirmed);
    assert_eq!(remote.record("tasks", "t1").unwrap()["status"], "IN_PROGRESS");
    assert!(!view.has_pending(&t1()));
    assert!(sink.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_submit_confirms_with_notification() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let ticket = view.set_overlay("tasks", &t1(), "status", json!("DONE"));
    let outcome = view.dispatch(&ticket, WriteIntent::Submit).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Confirmed);
    assert_eq!(sink.events(), vec![SinkEvent::Submitted { ticket_id: ticket }]);
}

#[tokio::test(start_paused = true)]
async fn test_same_entity_writes_leave_in_issue_order() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.set_write_delay(Duration::from_millis(100));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let first = view.save("tasks", &t1(), "title", json!("One"), WriteIntent::Autosave);
    let second = view.save("tasks", &t1(), "status", json!("DONE"), WriteIntent::Autosave);
    let third = view.save("tasks", &t1(), "owner", json!("ana"), WriteIntent::Autosave);

    // Polled in reverse: queueing order decides, not polling order.
    let (c, b, a) = tokio::join!(third, second, first);
    assert_eq!(a.unwrap(), DispatchOutcome::Confirmed);
    assert_eq!(b.unwrap(), DispatchOutcome::Confirmed);
    assert_eq!(c.unwrap(), DispatchOutcome::Confirmed);

    let bodies: Vec<_> = remote.writes().into_iter().map(|c| c.body).collect();
    assert_eq!(
        bodies,
        vec![json!({"title": "One"}), json!({"status": "DONE"}), json!({"owner": "ana"})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_different_entities_run_concurrently() {
    let remote = ScriptedRemote::new();
    remote.seed(
        "tasks",
        vec![task("t1", "A", "TODO"), task("t2", "B", "TODO")],
    );
    remote.set_write_delay(Duration::from_secs(1));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let started = Instant::now();
    let a = view.save("tasks", &t1(), "status", json!("DONE"), WriteIntent::Autosave);
    let b = view.save("tasks", &EntityId::canonical("t2"), "status", json!("DONE"), WriteIntent::Autosave);
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.unwrap(), DispatchOutcome::Confirmed);
    assert_eq!(b.unwrap(), DispatchOutcome::Confirmed);
    assert!(started.elapsed() < Duration::from_millis(1500));
}

// ============================================================================
// Failure policy
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_network_error_retried_once_then_confirmed() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.fail_next_write(RemoteError::Network("connection reset".to_string()));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let outcome = view
        .save("tasks", &t1(), "title", json!("Final"), WriteIntent::Autosave)
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::Confirmed);
    assert_eq!(remote.writes().len(), 2);
    assert!(sink.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_failure_rolls_back_with_single_notification() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.fail_next_write(RemoteError::Network("timeout".to_string()));
    remote.fail_next_write(RemoteError::Network("timeout".to_string()));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);
    view.refresh(&tasks()).await.unwrap();

    let ticket = view.set_overlay("tasks", &t1(), "title", json!("Final"));
    let outcome = view.dispatch(&ticket, WriteIntent::Submit).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::RolledBack(FailureKind::Network));
    assert_eq!(remote.writes().len(), 2);
    assert_eq!(
        sink.events(),
        vec![SinkEvent::Failed {
            ticket_id: ticket.clone(),
            kind: FailureKind::Network
        }]
    );
    assert_eq!(
        view.current_view(&tasks()).field(&t1(), "title"),
        Some(&json!("Draft"))
    );
    assert_eq!(
        view.store().read(|s| s.ticket_status(&ticket)),
        Some(TicketStatus::RolledBack)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_error_retried_like_network() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.fail_next_write(RemoteError::from_status(500, "boom"));
    remote.fail_next_write(RemoteError::from_status(500, "boom"));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let outcome = view
        .save("tasks", &t1(), "title", json!("Final"), WriteIntent::Autosave)
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::RolledBack(FailureKind::Unknown));
    assert_eq!(remote.writes().len(), 2);
    assert_eq!(sink.failures().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_validation_and_conflict_roll_back_without_retry() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.fail_next_write(RemoteError::from_status(422, "title is required"));
    remote.fail_next_write(RemoteError::from_status(409, "stale"));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);
    view.refresh(&tasks()).await.unwrap();

    let validation = view
        .save("tasks", &t1(), "title", json!(""), WriteIntent::Autosave)
        .await
        .unwrap();
    let conflict = view
        .save("tasks", &t1(), "status", json!("DONE"), WriteIntent::Autosave)
        .await
        .unwrap();

    assert_eq!(validation, DispatchOutcome::RolledBack(FailureKind::Validation));
    assert_eq!(conflict, DispatchOutcome::RolledBack(FailureKind::Conflict));
    assert_eq!(remote.writes().len(), 2);
    assert_eq!(sink.failures().len(), 2);

    let merged = view.current_view(&tasks());
    assert_eq!(merged.field(&t1(), "title"), Some(&json!("Draft")));
    assert_eq!(merged.field(&t1(), "status"), Some(&json!("TODO")));
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_rolls_back_silently() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.fail_next_write(RemoteError::from_status(401, ""));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let outcome = view
        .save("tasks", &t1(), "title", json!("Final"), WriteIntent::Submit)
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::RolledBack(FailureKind::Auth));
    assert_eq!(remote.writes().len(), 1);
    assert!(sink.events().is_empty());
    assert!(view.get_overlay(&t1()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_credential_skips_dispatch() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    let sink = RecordingSink::new();
    let view = setup_view_with(&remote, &sink, None, test_config());

    let outcome = view
        .save("tasks", &t1(), "title", json!("Final"), WriteIntent::Submit)
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::Skipped);
    assert!(remote.calls().is_empty());
    assert!(sink.events().is_empty());
    assert!(view.get_overlay(&t1()).is_empty());
}

// ============================================================================
// Supersession
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_late_completion_does_not_clear_newer_edit() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.set_write_delay(Duration::from_millis(200));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);
    view.refresh(&tasks()).await.unwrap();

    let first = view.save("tasks", &t1(), "status", json!("IN_PROGRESS"), WriteIntent::Autosave);
    // Let the lane take the first ticket before editing again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second_ticket = view.set_overlay("tasks", &t1(), "status", json!("DONE"));

    assert_eq!(first.await.unwrap(), DispatchOutcome::Confirmed);
    let entry = view.store().read(|s| s.entry(&t1(), "status").cloned()).unwrap();
    assert_eq!(entry.ticket_id, second_ticket);
    assert_eq!(entry.value, json!("DONE"));
    assert!(view.has_pending(&t1()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_edit_falls_back_to_confirmed_predecessor() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.set_write_delay(Duration::from_millis(200));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);
    view.refresh(&tasks()).await.unwrap();

    let first = view.save("tasks", &t1(), "status", json!("IN_PROGRESS"), WriteIntent::Autosave);
    tokio::time::sleep(Duration::from_millis(50)).await;
    remote.fail_next_write(RemoteError::from_status(422, "no such status"));
    let second = view.save("tasks", &t1(), "status", json!("BOGUS"), WriteIntent::Autosave);

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap(), DispatchOutcome::Confirmed);
    assert_eq!(second.unwrap(), DispatchOutcome::RolledBack(FailureKind::Validation));

    // The cached snapshot predates the first confirmation; the confirmed value shows.
    assert_eq!(
        view.current_view(&tasks()).field(&t1(), "status"),
        Some(&json!("IN_PROGRESS"))
    );
    assert_eq!(sink.failures().len(), 1);
}

// ============================================================================
// Creates and deletes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_adopts_server_id() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![]);
    remote.assign_server_ids();
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let mut fields = shared_types::FieldMap::new();
    fields.insert("title".to_string(), json!("Write EOD report"));
    let (temp_id, ticket) = view.stage_create(tasks(), fields);
    assert!(view.has_pending(&temp_id));

    let outcome = view.dispatch(&ticket, WriteIntent::Submit).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Confirmed);

    let resolved = view.store().read(|s| s.resolve(&temp_id));
    assert_eq!(resolved.as_str(), "srv-1");
    assert!(!view.has_pending(&temp_id));
}

#[tokio::test(start_paused = true)]
async fn test_failed_delete_restores_entity() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.fail_next_write(RemoteError::from_status(403, ""));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);
    view.refresh(&tasks()).await.unwrap();

    let ticket = view.stage_delete("tasks", &t1());
    assert!(view.current_view(&tasks()).get(&t1()).is_none());

    let outcome = view.dispatch(&ticket, WriteIntent::Submit).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::RolledBack(FailureKind::Auth));
    assert!(view.current_view(&tasks()).get(&t1()).is_some());
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_teardown_detaches_in_flight_writes() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    remote.set_write_delay(Duration::from_secs(1));
    remote.fail_next_write(RemoteError::from_status(422, "rejected"));
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let in_flight = view.save("tasks", &t1(), "title", json!("x"), WriteIntent::Submit);
    tokio::time::sleep(Duration::from_millis(10)).await;
    view.teardown();

    assert_eq!(in_flight.await.unwrap(), DispatchOutcome::Detached);
    // The request itself was not aborted.
    assert_eq!(remote.writes().len(), 1);
    assert!(sink.events().is_empty());

    let after = view.dispatch(&view.set_overlay("tasks", &t1(), "title", json!("y")), WriteIntent::Autosave);
    assert_eq!(after.await, Err(SyncError::Detached));
}

// ============================================================================
// Bookkeeping
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_queueing_does_not_publish_a_revision() {
    let remote = ScriptedRemote::new();
    remote.seed("tasks", vec![task("t1", "Draft", "TODO")]);
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let ticket = view.set_overlay("tasks", &t1(), "status", json!("DONE"));
    let before = view.store().revision();
    let pending = view.dispatch(&ticket, WriteIntent::Submit);
    assert_eq!(view.store().revision(), before);

    assert_eq!(pending.await.unwrap(), DispatchOutcome::Confirmed);
    assert!(view.store().revision() > before);
}

#[tokio::test(start_paused = true)]
async fn test_settled_writes_release_lanes_and_tickets() {
    let remote = ScriptedRemote::new();
    let records = (0..50).map(|i| task(&format!("t{i}"), "Draft", "TODO")).collect();
    remote.seed("tasks", records);
    let sink = RecordingSink::new();
    let store = SharedStore::new(OverlayStore::default());
    let dispatcher = MutationDispatcher::new(
        store.clone(),
        remote.clone(),
        Arc::new(StaticToken::new(Some("secret".to_string()))),
        sink.clone(),
        &test_config(),
    );

    let mut tickets = Vec::new();
    let mut pending = Vec::new();
    for i in 0..50 {
        let id = EntityId::canonical(&format!("t{i}"));
        let ticket = store.write(|s| s.set_overlay("tasks", &id, "status", json!("DONE")));
        pending.push(dispatcher.dispatch(&ticket, WriteIntent::Autosave));
        tickets.push(ticket);
    }
    assert_eq!(dispatcher.lane_count(), 50);

    for outcome in pending {
        assert_eq!(outcome.await.unwrap(), DispatchOutcome::Confirmed);
    }
    assert_eq!(dispatcher.lane_count(), 0);

    tokio::time::sleep(test_config().staleness_window + Duration::from_millis(10)).await;
    assert_eq!(store.read(|s| s.ticket_count()), 0);
    assert_eq!(
        store.read(|s| s.ticket_status(&tickets[0])),
        Some(TicketStatus::Confirmed)
    );

    // A later edit opens a fresh lane.
    let again = store.write(|s| s.set_overlay("tasks", &t1(), "status", json!("TODO")));
    assert_eq!(
        dispatcher.dispatch(&again, WriteIntent::Autosave).await.unwrap(),
        DispatchOutcome::Confirmed
    );
    assert_eq!(dispatcher.lane_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_ticket_rejected() {
    let remote = ScriptedRemote::new();
    let sink = RecordingSink::new();
    let view = setup_view(&remote, &sink);

    let missing = shared_types::TicketId::new();
    let result = view.dispatch(&missing, WriteIntent::Autosave).await;
    assert_eq!(result, Err(SyncError::UnknownTicket(missing)));
}
