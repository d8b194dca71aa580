//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use rand::Rng;
use std::collections::BTreeSet;
use std::time::Duration;

/// Shortest interval accepted for timer-driven modes.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Largest accepted `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 100;

/// How the scheduler produces triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleMode {
    /// Only explicit `trigger_now` calls drain the queue.
    Manual,
    /// A timer fires every interval.
    #[default]
    Automatic,
    /// Timer plus an immediate trigger for every enqueue.
    Realtime,
}

impl ScheduleMode {
    /// Returns true if the mode runs a periodic timer.
    pub fn uses_timer(&self) -> bool {
        matches!(self, ScheduleMode::Automatic | ScheduleMode::Realtime)
    }
}

/// Scheduler cadence and retry limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Trigger mode.
    pub mode: ScheduleMode,
    /// Time between automatic triggers.
    pub interval: Duration,
    /// Base delay before the first retry.
    pub retry_delay: Duration,
    /// Retries allowed before an operation is dropped.
    pub max_retries: u32,
}

impl ScheduleConfig {
    /// Creates an automatic schedule with the given interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            mode: ScheduleMode::Automatic,
            interval,
            retry_delay: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    /// Creates a manual schedule.
    pub fn manual() -> Self {
        Self {
            mode: ScheduleMode::Manual,
            ..Self::default()
        }
    }

    /// Sets the mode.
    pub fn with_mode(mut self, mode: ScheduleMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the base retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Checks the settings, returning `SchedulerMisconfiguration` if invalid.
    pub fn validate(&self) -> SyncResult<()> {
        if self.mode.uses_timer() && self.interval < MIN_INTERVAL {
            return Err(SyncError::SchedulerMisconfiguration(format!(
                "interval {:?} is below the minimum of {:?}",
                self.interval, MIN_INTERVAL
            )));
        }
        if self.retry_delay.is_zero() {
            return Err(SyncError::SchedulerMisconfiguration(
                "retry delay must be non-zero".into(),
            ));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(SyncError::SchedulerMisconfiguration(format!(
                "max_retries {} exceeds the limit of {}",
                self.max_retries, MAX_RETRIES_LIMIT
            )));
        }
        Ok(())
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Exponential backoff shape.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a doubling backoff capped at `max_delay`.
    pub fn new(max_delay: Duration) -> Self {
        Self {
            max_delay,
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before retry number `retry_count` (0-indexed).
    ///
    /// `base * multiplier^retry_count`, capped by `max_delay`. Jitter adds up
    /// to 25% but never pushes past the cap.
    pub fn delay_for_attempt(&self, base: Duration, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let raw = base.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let secs = if self.add_jitter {
            let jitter = capped * 0.25 * rand::thread_rng().gen::<f64>();
            (capped + jitter).min(self.max_delay.as_secs_f64())
        } else {
            capped
        };

        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scheduler settings.
    pub schedule: ScheduleConfig,
    /// Backoff shape.
    pub retry: RetryConfig,
    /// Worker pool size for a drain.
    pub max_concurrent_operations: usize,
    /// Upper bound for one backend call.
    pub operation_timeout: Duration,
    /// Fields below this confidence force manual review.
    pub confidence_threshold: f64,
    /// Fields whose divergence always needs a person.
    pub critical_fields: BTreeSet<String>,
    /// Name of the fallback resolution strategy.
    pub default_strategy: String,
}

impl EngineConfig {
    /// Creates a configuration with the given schedule.
    pub fn new(schedule: ScheduleConfig) -> Self {
        Self {
            schedule,
            retry: RetryConfig::default(),
            max_concurrent_operations: 4,
            operation_timeout: Duration::from_secs(30),
            confidence_threshold: 0.5,
            critical_fields: BTreeSet::new(),
            default_strategy: "intelligent_merge".into(),
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the worker pool size.
    pub fn with_max_concurrent_operations(mut self, max: usize) -> Self {
        self.max_concurrent_operations = max;
        self
    }

    /// Sets the backend call timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the manual review threshold.
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Marks a field as critical.
    pub fn with_critical_field(mut self, field: impl Into<String>) -> Self {
        self.critical_fields.insert(field.into());
        self
    }

    /// Sets the fallback resolution strategy.
    pub fn with_default_strategy(mut self, name: impl Into<String>) -> Self {
        self.default_strategy = name.into();
        self
    }

    /// Checks every setting.
    pub fn validate(&self) -> SyncResult<()> {
        self.schedule.validate()?;
        if self.max_concurrent_operations == 0 {
            return Err(SyncError::SchedulerMisconfiguration(
                "max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(SyncError::SchedulerMisconfiguration(
                "operation timeout must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(SyncError::SchedulerMisconfiguration(format!(
                "confidence threshold {} is outside [0, 1]",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(ScheduleConfig::default())
    }
}
