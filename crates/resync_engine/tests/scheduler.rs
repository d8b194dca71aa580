//! Scheduler timing and the engine's run loop.

use resync_engine::{
    EngineConfig, EventBus, MockBackend, ScheduleConfig, ScheduleMode, SchedulerState, StaticAuth,
    SyncEngine, SyncEvent, SyncOperation, SyncScheduler, TriggerType,
};
use std::sync::Arc;
use std::time::Duration;

fn scheduler(interval: Duration) -> SyncScheduler {
    SyncScheduler::new(ScheduleConfig::new(interval), Arc::new(EventBus::new())).unwrap()
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn pausing_before_the_first_tick_suppresses_it() {
    let s = scheduler(Duration::from_secs(3));
    s.start().unwrap();
    settle().await;

    tokio::time::advance(Duration::from_secs(1)).await;
    s.pause().unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert!(s.try_next_trigger().is_none());

    // Resuming restarts the full interval.
    s.resume().unwrap();
    settle().await;
    tokio::time::advance(Duration::from_millis(2500)).await;
    settle().await;
    assert!(s.try_next_trigger().is_none());

    tokio::time::advance(Duration::from_millis(600)).await;
    settle().await;
    let trigger = s.try_next_trigger().unwrap();
    assert_eq!(trigger.trigger_type, TriggerType::Automatic);
}

#[tokio::test(start_paused = true)]
async fn stop_is_final() {
    let s = scheduler(Duration::from_secs(1));
    s.start().unwrap();
    settle().await;
    s.stop();

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert!(s.next_trigger().await.is_none());
    assert!(!s.trigger_now(TriggerType::Manual));
    assert!(s.start().is_err());

    s.reset().await;
    assert_eq!(s.state(), SchedulerState::Idle);
    s.start().unwrap();
    assert!(s.trigger_now(TriggerType::Manual));
    assert!(s.try_next_trigger().is_some());
}

#[tokio::test(start_paused = true)]
async fn interval_change_applies_at_the_next_tick() {
    let s = scheduler(Duration::from_secs(2));
    s.start().unwrap();
    settle().await;

    s.update_config(ScheduleConfig::new(Duration::from_secs(10)))
        .unwrap();
    tokio::time::advance(Duration::from_millis(2100)).await;
    settle().await;
    assert!(s.try_next_trigger().is_some());

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert!(s.try_next_trigger().is_none());

    tokio::time::advance(Duration::from_secs(6)).await;
    settle().await;
    assert!(s.try_next_trigger().is_some());
}

#[tokio::test]
async fn invalid_interval_is_rejected() {
    let s = scheduler(Duration::from_secs(2));
    assert!(s
        .update_config(ScheduleConfig::new(Duration::from_millis(1)))
        .is_err());
    assert_eq!(s.config().interval, Duration::from_secs(2));
}

#[tokio::test]
async fn realtime_enqueue_drives_the_run_loop() {
    let config = EngineConfig::new(
        ScheduleConfig::new(Duration::from_secs(3600)).with_mode(ScheduleMode::Realtime),
    );
    let engine = Arc::new(
        SyncEngine::new(config, MockBackend::new(), StaticAuth::signed_in("user-1")).unwrap(),
    );
    engine.scheduler().start().unwrap();

    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    engine
        .enqueue(SyncOperation::delete("notes", "n1"))
        .unwrap();

    for _ in 0..200 {
        if engine.backend().call_count() == 1 && engine.queue().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.backend().call_count(), 1);
    assert!(engine.queue().is_empty());

    engine.scheduler().stop();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();

    let events = engine.events().recent();
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::SchedulerTriggerFired {
            trigger: TriggerType::Realtime,
            ..
        }
    )));
}
