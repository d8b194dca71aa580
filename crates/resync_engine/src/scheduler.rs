//! Timer-driven trigger source.
//!
//! The scheduler decides *when* the queue is drained. It owns one tokio task
//! per running period; pausing or stopping cancels that task under the same
//! lock that changes the state, so a trigger can never fire afterwards.
//!
//! ```text
//! Idle ──start──▶ Running ──pause──▶ Paused
//!                   ▲  │               │
//!                   └──┼──start/resume─┘
//!                      ▼
//!                   Stopped ──reset──▶ Idle
//! ```

use crate::config::{ScheduleConfig, ScheduleMode};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Lifecycle state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Constructed or reset, never started.
    Idle,
    /// Emitting triggers.
    Running,
    /// Not emitting; configuration kept.
    Paused,
    /// Terminal until [`SyncScheduler::reset`].
    Stopped,
}

impl SchedulerState {
    /// Returns true if `start` is legal from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, SchedulerState::Idle | SchedulerState::Paused)
    }
}

/// Why a trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    /// Periodic timer.
    Automatic,
    /// Explicit request.
    Manual,
    /// Backoff delay elapsed.
    Retry,
    /// Local change in realtime mode.
    Realtime,
}

/// A request to drain the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTrigger {
    /// Why the trigger fired.
    pub trigger_type: TriggerType,
    /// Monotonic trigger number.
    pub sequence: u64,
    /// When the trigger fired.
    pub fired_at: DateTime<Utc>,
    generation: u64,
}

struct Control {
    state: SchedulerState,
    /// Bumped on every transition; triggers from older generations are void.
    generation: u64,
    config: ScheduleConfig,
    timer: Option<JoinHandle<()>>,
    retry_timers: Vec<JoinHandle<()>>,
    sender: Option<mpsc::Sender<SyncTrigger>>,
}

impl Control {
    fn cancel_timers(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        for timer in self.retry_timers.drain(..) {
            timer.abort();
        }
    }
}

struct Inner {
    control: Mutex<Control>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<SyncTrigger>>,
    sequence: AtomicU64,
    events: Arc<EventBus>,
}

impl Inner {
    fn transition(&self, control: &mut Control, to: SchedulerState) {
        let from = control.state;
        control.state = to;
        control.generation += 1;
        info!(?from, ?to, "scheduler state changed");
        self.events
            .emit(SyncEvent::SchedulerStateChanged { from, to });
    }

    /// Sends a trigger if the scheduler is running and `generation` is
    /// current. Returns false once the caller's timer should exit.
    fn fire(&self, generation: Option<u64>, trigger_type: TriggerType) -> bool {
        let control = self.control.lock();
        if control.state != SchedulerState::Running {
            return false;
        }
        if generation.is_some_and(|g| g != control.generation) {
            return false;
        }
        let Some(sender) = control.sender.as_ref() else {
            return false;
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let trigger = SyncTrigger {
            trigger_type,
            sequence,
            fired_at: Utc::now(),
            generation: control.generation,
        };

        match sender.try_send(trigger) {
            Ok(()) => {
                debug!(?trigger_type, sequence, "trigger fired");
                self.events.emit(SyncEvent::SchedulerTriggerFired {
                    trigger: trigger_type,
                    sequence,
                });
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!(?trigger_type, sequence, "consumer busy, trigger dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn is_live(&self, trigger: &SyncTrigger) -> bool {
        let control = self.control.lock();
        control.state == SchedulerState::Running && control.generation == trigger.generation
    }
}

async fn timer_loop(inner: Arc<Inner>, generation: u64) {
    loop {
        // The interval is read per tick so reconfiguration applies from the
        // next boundary without touching the sleep in progress.
        let interval = {
            let control = inner.control.lock();
            if control.state != SchedulerState::Running || control.generation != generation {
                return;
            }
            control.config.interval
        };
        tokio::time::sleep(interval).await;
        if !inner.fire(Some(generation), TriggerType::Automatic) {
            return;
        }
    }
}

/// Emits drain triggers on a configured cadence or on demand.
///
/// Triggers are delivered through a single-slot channel: a trigger that
/// finds the consumer busy is dropped and never retried, and the next
/// scheduled tick is unaffected.
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    /// Creates an idle scheduler.
    pub fn new(config: ScheduleConfig, events: Arc<EventBus>) -> SyncResult<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(1);
        Ok(Self {
            inner: Arc::new(Inner {
                control: Mutex::new(Control {
                    state: SchedulerState::Idle,
                    generation: 0,
                    config,
                    timer: None,
                    retry_timers: Vec::new(),
                    sender: Some(sender),
                }),
                receiver: tokio::sync::Mutex::new(receiver),
                sequence: AtomicU64::new(0),
                events,
            }),
        })
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        self.inner.control.lock().state
    }

    /// Current configuration.
    pub fn config(&self) -> ScheduleConfig {
        self.inner.control.lock().config.clone()
    }

    /// Starts or resumes emitting triggers.
    ///
    /// The first automatic trigger fires after one full interval. Calling
    /// `start` while running is a no-op.
    pub fn start(&self) -> SyncResult<()> {
        let mut control = self.inner.control.lock();
        match control.state {
            SchedulerState::Running => return Ok(()),
            SchedulerState::Stopped => {
                return Err(SyncError::InvalidStateTransition {
                    from: "Stopped".into(),
                    to: "Running".into(),
                })
            }
            SchedulerState::Idle | SchedulerState::Paused => {}
        }

        self.inner.transition(&mut control, SchedulerState::Running);
        if control.config.mode.uses_timer() {
            self.spawn_timer(&mut control);
        }
        Ok(())
    }

    /// Resumes a paused scheduler.
    pub fn resume(&self) -> SyncResult<()> {
        self.start()
    }

    /// Stops emitting triggers and releases the timer.
    pub fn pause(&self) -> SyncResult<()> {
        let mut control = self.inner.control.lock();
        match control.state {
            SchedulerState::Paused => Ok(()),
            SchedulerState::Running => {
                control.cancel_timers();
                self.inner.transition(&mut control, SchedulerState::Paused);
                Ok(())
            }
            other => Err(SyncError::InvalidStateTransition {
                from: format!("{other:?}"),
                to: "Paused".into(),
            }),
        }
    }

    /// Stops the scheduler for good.
    ///
    /// No trigger is observable after this returns: timers are aborted, the
    /// channel is closed, and buffered triggers are discarded on receipt.
    pub fn stop(&self) {
        let mut control = self.inner.control.lock();
        if control.state == SchedulerState::Stopped {
            return;
        }
        control.cancel_timers();
        control.sender = None;
        self.inner.transition(&mut control, SchedulerState::Stopped);
    }

    /// Returns a stopped scheduler to `Idle` with a fresh trigger channel.
    pub async fn reset(&self) {
        let (sender, receiver) = mpsc::channel(1);
        let mut slot = self.inner.receiver.lock().await;
        let mut control = self.inner.control.lock();
        control.cancel_timers();
        control.sender = Some(sender);
        *slot = receiver;
        if control.state != SchedulerState::Idle {
            self.inner.transition(&mut control, SchedulerState::Idle);
        }
    }

    /// Replaces the configuration.
    ///
    /// Invalid settings are rejected and the previous configuration is kept.
    /// A new interval takes effect at the next tick boundary.
    pub fn update_config(&self, config: ScheduleConfig) -> SyncResult<()> {
        config.validate()?;
        let mut control = self.inner.control.lock();
        let had_timer = control.config.mode.uses_timer();
        let wants_timer = config.mode.uses_timer();
        info!(mode = ?config.mode, interval = ?config.interval, "schedule updated");
        control.config = config;

        if control.state == SchedulerState::Running && had_timer != wants_timer {
            if wants_timer {
                self.spawn_timer(&mut control);
            } else if let Some(timer) = control.timer.take() {
                timer.abort();
            }
        }
        Ok(())
    }

    /// Fires a trigger immediately. Returns false unless running.
    pub fn trigger_now(&self, trigger_type: TriggerType) -> bool {
        self.inner.fire(None, trigger_type)
    }

    /// Fires a realtime trigger if the scheduler is in realtime mode.
    pub fn notify_change(&self) -> bool {
        if self.inner.control.lock().config.mode != ScheduleMode::Realtime {
            return false;
        }
        self.trigger_now(TriggerType::Realtime)
    }

    /// Fires a one-shot retry trigger after `delay`, unless paused or
    /// stopped first.
    pub fn schedule_retry(&self, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!("no tokio runtime, retry trigger not scheduled");
            return;
        };
        let mut control = self.inner.control.lock();
        if control.state != SchedulerState::Running {
            return;
        }
        control.retry_timers.retain(|t| !t.is_finished());

        let inner = Arc::clone(&self.inner);
        let generation = control.generation;
        control.retry_timers.push(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(Some(generation), TriggerType::Retry);
        }));
    }

    /// Waits for the next live trigger.
    ///
    /// Returns `None` once the scheduler is stopped.
    pub async fn next_trigger(&self) -> Option<SyncTrigger> {
        let mut receiver = self.inner.receiver.lock().await;
        loop {
            let trigger = receiver.recv().await?;
            if self.inner.is_live(&trigger) {
                return Some(trigger);
            }
        }
    }

    /// Returns a buffered live trigger without waiting.
    pub fn try_next_trigger(&self) -> Option<SyncTrigger> {
        let mut receiver = self.inner.receiver.try_lock().ok()?;
        while let Ok(trigger) = receiver.try_recv() {
            if self.inner.is_live(&trigger) {
                return Some(trigger);
            }
        }
        None
    }

    fn spawn_timer(&self, control: &mut Control) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!("no tokio runtime, automatic triggers disabled");
            return;
        };
        if let Some(timer) = control.timer.take() {
            timer.abort();
        }
        let inner = Arc::clone(&self.inner);
        control.timer = Some(handle.spawn(timer_loop(inner, control.generation)));
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.inner.control.lock().cancel_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(interval: Duration) -> SyncScheduler {
        SyncScheduler::new(ScheduleConfig::new(interval), Arc::new(EventBus::new())).unwrap()
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn state_checks() {
        assert!(SchedulerState::Idle.can_start());
        assert!(SchedulerState::Paused.can_start());
        assert!(!SchedulerState::Running.can_start());
        assert!(!SchedulerState::Stopped.can_start());
    }

    #[tokio::test(start_paused = true)]
    async fn first_trigger_after_full_interval() {
        let s = scheduler(Duration::from_secs(3));
        s.start().unwrap();
        settle().await;

        tokio::time::advance(Duration::from_millis(2900)).await;
        settle().await;
        assert!(s.try_next_trigger().is_none());

        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        let trigger = s.try_next_trigger().unwrap();
        assert_eq!(trigger.trigger_type, TriggerType::Automatic);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_suppresses_triggers() {
        let s = scheduler(Duration::from_secs(3));
        s.start().unwrap();
        settle().await;

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        s.pause().unwrap();
        assert!(s.try_next_trigger().is_none());

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(s.try_next_trigger().is_none());

        s.start().unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert!(s.try_next_trigger().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_terminal() {
        let s = scheduler(Duration::from_secs(1));
        s.start().unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        // A trigger may be buffered; stop must still hide it.
        s.stop();
        assert_eq!(s.state(), SchedulerState::Stopped);
        assert!(s.try_next_trigger().is_none());
        assert!(s.next_trigger().await.is_none());
        assert!(!s.trigger_now(TriggerType::Manual));
        assert!(matches!(
            s.start(),
            Err(SyncError::InvalidStateTransition { .. })
        ));

        s.reset().await;
        assert_eq!(s.state(), SchedulerState::Idle);
        s.start().unwrap();
        assert!(s.trigger_now(TriggerType::Manual));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_consumer_drops_triggers() {
        let s = scheduler(Duration::from_secs(1));
        s.start().unwrap();
        settle().await;

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }

        // Only one slot: the extra ticks were dropped.
        let first = s.try_next_trigger().unwrap();
        assert_eq!(first.sequence, 1);
        assert!(s.try_next_trigger().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn update_config_applies_at_next_tick() {
        let s = scheduler(Duration::from_secs(10));
        s.start().unwrap();
        settle().await;

        s.update_config(ScheduleConfig::new(Duration::from_secs(1)))
            .unwrap();

        // The in-flight 10s sleep is not rescheduled.
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(s.try_next_trigger().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(s.try_next_trigger().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(s.try_next_trigger().is_some());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let s = scheduler(Duration::from_secs(5));
        let bad = ScheduleConfig::new(Duration::from_millis(1));
        assert!(matches!(
            s.update_config(bad),
            Err(SyncError::SchedulerMisconfiguration(_))
        ));
        assert_eq!(s.config().interval, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_mode_only_fires_on_demand() {
        let s = SyncScheduler::new(ScheduleConfig::manual(), Arc::new(EventBus::new())).unwrap();
        assert!(!s.trigger_now(TriggerType::Manual));

        s.start().unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert!(s.try_next_trigger().is_none());
        assert!(!s.notify_change());

        assert!(s.trigger_now(TriggerType::Manual));
        assert_eq!(
            s.try_next_trigger().unwrap().trigger_type,
            TriggerType::Manual
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_trigger_cancelled_by_pause() {
        let s = scheduler(Duration::from_secs(3600));
        s.start().unwrap();
        s.schedule_retry(Duration::from_secs(2));
        s.pause().unwrap();
        s.start().unwrap();
        settle().await;

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert!(s.try_next_trigger().is_none());

        s.schedule_retry(Duration::from_secs(2));
        settle().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(
            s.try_next_trigger().unwrap().trigger_type,
            TriggerType::Retry
        );
    }

    #[tokio::test(start_paused = true)]
    async fn emits_events() {
        let events = Arc::new(EventBus::new());
        let rx = events.subscribe();
        let s = SyncScheduler::new(ScheduleConfig::new(Duration::from_secs(1)), events).unwrap();

        s.start().unwrap();
        s.trigger_now(TriggerType::Manual);
        s.stop();

        let received: Vec<_> = rx.try_iter().collect();
        assert!(received.contains(&SyncEvent::SchedulerStateChanged {
            from: SchedulerState::Idle,
            to: SchedulerState::Running,
        }));
        assert!(received.contains(&SyncEvent::SchedulerTriggerFired {
            trigger: TriggerType::Manual,
            sequence: 1,
        }));
        assert!(matches!(
            received.last(),
            Some(SyncEvent::SchedulerStateChanged {
                to: SchedulerState::Stopped,
                ..
            })
        ));
    }
}
