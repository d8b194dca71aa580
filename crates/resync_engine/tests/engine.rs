//! Integration tests for the sync engine against a scripted backend.

use resync_engine::{
    strategy_names, BackendResponse, EngineConfig, FieldChoice, MockBackend, OperationPriority,
    OperationType, RetryConfig, ScheduleConfig, StaticAuth, SyncEngine, SyncError, SyncEvent,
    SyncOperation, TAG_CONTENT,
};
use resync_testkit::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

type TestEngine = SyncEngine<MockBackend, StaticAuth>;

fn config() -> EngineConfig {
    EngineConfig::new(ScheduleConfig::manual())
        .with_retry(RetryConfig::default().without_jitter())
}

fn engine_with(config: EngineConfig) -> TestEngine {
    SyncEngine::new(config, MockBackend::new(), StaticAuth::signed_in("user-1")).unwrap()
}

fn scenario_conflict() -> BackendResponse {
    BackendResponse::Conflict {
        local: status_count_local(),
        remote: status_count_remote(),
        local_version: 1,
        remote_version: 2,
    }
}

fn scenario_operation() -> SyncOperation {
    let mut payload = status_count_local();
    payload.insert("id".into(), json!("t1"));
    SyncOperation::update("tasks", payload).with_id("op-t1")
}

#[tokio::test]
async fn drain_sends_operations_in_priority_order() {
    let engine = engine_with(config().with_max_concurrent_operations(1));
    let ops = make_operations(&[
        OperationPriority::Low,
        OperationPriority::Normal,
        OperationPriority::Critical,
        OperationPriority::High,
        OperationPriority::Critical,
    ]);
    for op in ops {
        engine.enqueue(op).unwrap();
    }

    let report = engine.drain().await;
    assert_eq!(report.attempted, 5);
    assert_eq!(report.processed, 5);

    let order: Vec<_> = engine
        .backend()
        .calls()
        .into_iter()
        .map(|c| c.entity_id.unwrap())
        .collect();
    assert_eq!(order, vec!["t2", "t4", "t3", "t1", "t0"]);
}

#[tokio::test]
async fn conflict_is_merged_and_written_back() {
    let engine = engine_with(config());
    engine.backend().push_response("t1", Ok(scenario_conflict()));
    engine.enqueue(scenario_operation()).unwrap();

    let report = engine.drain().await;
    assert_eq!(report.conflicts_resolved, 1);
    assert!(engine.queue().is_empty());

    let calls = engine.backend().calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].op_type, OperationType::Update);
    assert_eq!(calls[1].entity_id.as_deref(), Some("t1"));

    let history = engine.history().entries();
    assert_eq!(history.len(), 1);
    let merged = &history[0].resolution.merged_data;
    assert_eq!(merged["status"], json!("inactive"));
    assert_eq!(merged["count"], json!(7));
    assert_eq!(history[0].strategy_used, strategy_names::INTELLIGENT_MERGE);
    assert!(history[0].conflict.tags.contains("user:user-1"));

    let events = engine.events().recent();
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::ConflictResolved { strategy, .. } if strategy == strategy_names::INTELLIGENT_MERGE
    )));

    let stats = engine.stats();
    assert_eq!(stats.conflicts_detected, 1);
    assert_eq!(stats.conflicts_resolved, 1);
}

#[tokio::test]
async fn collection_override_picks_the_strategy() {
    let engine = engine_with(config());
    engine.configure_resolvers(|registry| {
        let local = registry.strategy_by_name(strategy_names::LOCAL_WINS).unwrap();
        registry.override_collection("tasks", local);
    });
    engine.backend().push_response("t1", Ok(scenario_conflict()));
    engine.enqueue(scenario_operation()).unwrap();

    engine.drain().await;

    let history = engine.history().entries();
    assert_eq!(history[0].strategy_used, strategy_names::LOCAL_WINS);
    assert_eq!(history[0].resolution.merged_data["status"], json!("active"));
}

#[tokio::test]
async fn critical_field_conflict_waits_for_a_person() {
    let engine = engine_with(config().with_critical_field("status"));
    engine.backend().push_response("t1", Ok(scenario_conflict()));
    engine.enqueue(scenario_operation()).unwrap();

    let report = engine.drain().await;
    assert_eq!(report.pending_manual, 1);
    assert!(engine.queue().is_empty());
    assert_eq!(engine.backend().call_count(), 1);

    let pending = engine.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation.id, "op-t1");
    assert_eq!(pending[0].conflict.priority, OperationPriority::Critical);
    assert_eq!(engine.stats().pending_conflicts, 1);

    let conflict_id = pending[0].conflict.id.clone();

    // Every conflicting field needs a choice.
    let partial = BTreeMap::from([("status".to_string(), FieldChoice::Local)]);
    let err = engine.resolve_pending(&conflict_id, &partial).await.unwrap_err();
    assert!(matches!(err, SyncError::ResolutionFailure { .. }));
    assert_eq!(engine.pending_conflicts().len(), 1);

    let choices = BTreeMap::from([
        ("status".to_string(), FieldChoice::Local),
        ("count".to_string(), FieldChoice::Custom(json!(12))),
    ]);
    let resolution = engine.resolve_pending(&conflict_id, &choices).await.unwrap();
    assert_eq!(resolution.merged_data["status"], json!("active"));
    assert_eq!(resolution.merged_data["count"], json!(12));
    assert_eq!(resolution.resolved_by, "user-1");

    assert!(engine.pending_conflicts().is_empty());
    let history = engine.history().entries();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].strategy_used, strategy_names::MANUAL);
    assert!(history[0].interaction_time.is_some());
    assert_eq!(engine.history().statistics().manual_count, 1);
}

#[tokio::test]
async fn diverged_note_bodies_wait_for_a_person() {
    let engine = engine_with(config());
    engine.backend().push_response(
        "note-1",
        Ok(BackendResponse::Conflict {
            local: edited_note("milk", "2024-03-01T10:00:00Z"),
            remote: edited_note("eggs", "2024-03-01T11:00:00Z"),
            local_version: 3,
            remote_version: 4,
        }),
    );
    engine
        .enqueue(SyncOperation::update(
            "notes",
            edited_note("milk", "2024-03-01T10:00:00Z"),
        ))
        .unwrap();

    let report = engine.drain().await;
    assert_eq!(report.pending_manual, 1);
    assert_eq!(engine.backend().call_count(), 1);

    let pending = engine.pending_conflicts();
    let conflict = &pending[0].conflict;
    assert_eq!(conflict.entity_id, "note-1");
    assert_eq!(conflict.priority, OperationPriority::High);
    assert!(conflict.has_tag(TAG_CONTENT));
    assert_eq!(
        conflict.field_conflicts.keys().collect::<Vec<_>>(),
        vec!["body", "updatedAt"]
    );

    let choices = BTreeMap::from([
        ("body".to_string(), FieldChoice::Custom(json!("milk\neggs"))),
        ("updatedAt".to_string(), FieldChoice::Remote),
    ]);
    let resolution = engine
        .resolve_pending(&conflict.id, &choices)
        .await
        .unwrap();
    assert_eq!(resolution.merged_data["body"], json!("milk\neggs"));
    assert_eq!(resolution.merged_data["updatedAt"], json!("2024-03-01T11:00:00Z"));

    let calls = engine.backend().calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].entity_id.as_deref(), Some("note-1"));
}

#[tokio::test]
async fn conflict_without_an_entity_id_is_not_written_back() {
    let engine = engine_with(config());
    engine.backend().push_fallback(Ok(scenario_conflict()));
    engine
        .enqueue(SyncOperation::create("tasks", status_count_local()).with_id("op-new"))
        .unwrap();

    let report = engine.drain().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.conflicts_resolved, 0);
    assert_eq!(engine.backend().call_count(), 1);
    assert!(engine.pending_conflicts().is_empty());
    assert!(engine.history().entries().is_empty());

    let events = engine.events().recent();
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::OperationFailed { operation_id, fatal: true, error }
            if operation_id == "op-new" && error.contains("no entity id")
    )));
}

#[tokio::test]
async fn conflict_takes_its_entity_id_from_the_snapshots() {
    let engine = engine_with(config());
    let mut remote = status_count_remote();
    remote.insert("id".into(), json!("t7"));
    engine.backend().push_fallback(Ok(BackendResponse::Conflict {
        local: status_count_local(),
        remote,
        local_version: 1,
        remote_version: 2,
    }));
    engine
        .enqueue(SyncOperation::create("tasks", status_count_local()))
        .unwrap();

    let report = engine.drain().await;
    assert_eq!(report.conflicts_resolved, 1);
    let calls = engine.backend().calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].entity_id.as_deref(), Some("t7"));
    assert_eq!(engine.history().entries()[0].conflict.entity_id, "t7");
}

#[tokio::test]
async fn resolving_unknown_or_signed_out_is_rejected() {
    let engine = engine_with(config());
    let err = engine
        .resolve_pending("missing", &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConflictNotFound(_)));

    engine.auth().sign_out();
    let err = engine
        .resolve_pending("missing", &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotAuthenticated));
}

#[tokio::test]
async fn retries_exhaust_into_a_single_fatal_event() {
    let config = EngineConfig::new(
        ScheduleConfig::manual()
            .with_retry_delay(Duration::from_millis(5))
            .with_max_retries(2),
    )
    .with_retry(RetryConfig::new(Duration::from_millis(5)).without_jitter());
    let engine = engine_with(config);
    for _ in 0..3 {
        engine
            .backend()
            .push_response("n1", Err(SyncError::backend_retryable("unavailable")));
    }
    engine
        .enqueue(SyncOperation::delete("notes", "n1").with_id("op-n1"))
        .unwrap();

    let mut retried = 0;
    let mut dropped = 0;
    for _ in 0..3 {
        let report = engine.drain().await;
        retried += report.retried;
        dropped += report.dropped;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(retried, 2);
    assert_eq!(dropped, 1);
    assert!(engine.queue().is_empty());
    assert_eq!(engine.backend().call_count(), 3);

    let failures: Vec<bool> = engine
        .events()
        .recent()
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::OperationFailed {
                operation_id,
                fatal,
                ..
            } if operation_id == "op-n1" => Some(fatal),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![false, false, true]);

    // Nothing left to retry.
    let report = engine.drain().await;
    assert_eq!(report.attempted, 0);
    assert_eq!(engine.stats().dropped, 1);
}

#[tokio::test]
async fn requeued_operation_waits_for_its_backoff() {
    let engine = engine_with(config());
    engine
        .backend()
        .push_response("n1", Err(SyncError::backend_retryable("unavailable")));
    engine.enqueue(SyncOperation::delete("notes", "n1")).unwrap();

    assert_eq!(engine.drain().await.retried, 1);
    assert_eq!(engine.queue().size(), 1);
    assert!(engine.queue().next_ready_at().is_some());

    // Default base delay is five seconds; the operation is not ready yet.
    let report = engine.drain().await;
    assert_eq!(report.attempted, 0);
    assert_eq!(engine.queue().size(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_backend_calls_time_out_and_retry() {
    let engine = engine_with(config().with_operation_timeout(Duration::from_millis(50)));
    engine.backend().set_delay(Some(Duration::from_millis(500)));
    engine.enqueue(SyncOperation::delete("notes", "n1")).unwrap();

    let report = engine.drain().await;
    assert_eq!(report.retried, 1);
    assert_eq!(engine.stats().timeouts, 1);
    assert_eq!(engine.queue().size(), 1);

    let events = engine.events().recent();
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::OperationFailed { error, fatal: false, .. } if error.contains("timed out")
    )));
}

#[tokio::test]
async fn queue_survives_a_restart_through_a_snapshot_file() {
    let dir = SnapshotDir::new();
    {
        let engine = engine_with(config());
        for op in make_operations(&[OperationPriority::Low, OperationPriority::High]) {
            engine.enqueue(op).unwrap();
        }
        engine
            .enqueue(SyncOperation::delete("notes", "n9").with_id("op-n9"))
            .unwrap();
        dir.save(&engine.snapshot());
    }

    let engine = engine_with(config().with_max_concurrent_operations(1));
    let restored = engine.restore(dir.load()).unwrap();
    assert_eq!(restored, 3);
    assert!(engine.queue().contains("op-n9"));

    let report = engine.drain().await;
    assert_eq!(report.processed, 3);
    let order: Vec<_> = engine
        .backend()
        .calls()
        .into_iter()
        .map(|c| c.entity_id.unwrap())
        .collect();
    assert_eq!(order, vec!["t1", "n9", "t0"]);
}

#[tokio::test]
async fn signing_in_unblocks_the_queue() {
    let engine =
        SyncEngine::new(config(), MockBackend::new(), StaticAuth::anonymous()).unwrap();
    engine.enqueue(SyncOperation::delete("notes", "n1")).unwrap();

    assert!(engine.drain().await.skipped_unauthenticated);
    assert_eq!(engine.queue().size(), 1);

    engine.auth().sign_in("user-2", Some("acme".into()));
    let report = engine.drain().await;
    assert!(!report.skipped_unauthenticated);
    assert_eq!(report.processed, 1);
}
