//! Work queue and scheduler configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::work_item::WorkItemType;

/// Environment variable prefix read by [`WorkQueueConfig::from_env`].
pub const ENV_PREFIX: &str = "PACS_WQ_";

/// Per work-item-type retry and scheduling knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueTypeProperties {
    /// NonFatal failures tolerated before the item is Failed.
    pub max_failure_count: u32,
    /// Base retry delay after a NonFatal failure.
    pub failure_delay_secs: u64,
    /// Upper bound on the exponential retry delay.
    pub max_backoff_secs: u64,
    /// Default postponement when `can_start` declines without a delay.
    pub postpone_delay_secs: u64,
    /// Delay before an item that reported more ready work is picked up again.
    pub process_delay_secs: u64,
    /// Delay before an Idle item is checked again.
    pub idle_delay_secs: u64,
    /// Expiration window granted after each successful pass.
    pub expire_delay_secs: u64,
    /// Maximum sub-units handled per pass.
    pub max_batch_size: usize,
    /// Failures of one sub-unit before it is skipped for good.
    pub max_unit_failures: u32,
    /// Items of this type hold one of the scarce memory-limited worker slots
    /// while processing.
    pub memory_limited: bool,
}

impl Default for WorkQueueTypeProperties {
    fn default() -> Self {
        Self {
            max_failure_count: 3,
            failure_delay_secs: 180,
            max_backoff_secs: 3_600,
            postpone_delay_secs: 60,
            process_delay_secs: 0,
            idle_delay_secs: 60,
            expire_delay_secs: 90,
            max_batch_size: 1_000,
            max_unit_failures: 3,
            memory_limited: false,
        }
    }
}

impl WorkQueueTypeProperties {
    /// Validate values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than 0".into());
        }
        if self.max_unit_failures == 0 {
            return Err("max_unit_failures must be greater than 0".into());
        }
        if self.max_backoff_secs < self.failure_delay_secs {
            return Err("max_backoff_secs must be at least failure_delay_secs".into());
        }
        Ok(())
    }

    /// Retry delay for the `failure_count`-th failure: `failure_delay * 2^(n-1)`,
    /// capped at `max_backoff_secs`.
    #[must_use]
    pub fn backoff(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(20);
        let secs = self
            .failure_delay_secs
            .saturating_mul(1_u64 << exponent)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

/// Destination throttling for auto-route admission control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Concurrent associations allowed per destination.
    pub max_connections_per_destination: u32,
    /// How long an overloaded destination stays blacked out.
    pub blackout_secs: u64,
    /// Postponement applied to items declined by the throttle.
    pub postpone_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_connections_per_destination: 2,
            blackout_secs: 5,
            postpone_secs: 5,
        }
    }
}

/// Root configuration of the work queue service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
    /// Worker threads.
    pub worker_count: usize,
    /// Idle wait between queue polls when there is no work.
    pub query_delay_ms: u64,
    /// Delay before retrying an item whose study was locked.
    pub lock_retry_delay_ms: u64,
    /// Expiration grace added after a postponement.
    pub postpone_grace_secs: u64,
    /// Maximum Pending, Idle and InProgress items before enqueue is refused.
    pub max_queue_depth: usize,
    /// Workers kept free for High and Critical items: Normal and Low items
    /// never occupy more than `worker_count - priority_worker_count` passes
    /// at once.
    pub priority_worker_count: usize,
    /// Concurrent passes allowed for memory-limited item types; 0 means no
    /// cap.
    pub memory_limited_worker_count: usize,
    /// How long Complete and Failed items are kept before housekeeping
    /// deletes them.
    pub terminal_retention_secs: u64,
    /// Interval between housekeeping runs of the worker pool.
    pub housekeeping_interval_ms: u64,
    /// Root for processor backup directories.
    pub scratch_directory: PathBuf,
    /// Stack size for worker threads in bytes.
    pub thread_stack_size: usize,
    /// How long shutdown waits for each worker.
    pub shutdown_timeout_ms: u64,
    /// Destination throttling.
    pub throttle: ThrottleConfig,
    /// Properties for types without an override.
    pub default_properties: WorkQueueTypeProperties,
    /// Per-type overrides.
    pub types: HashMap<WorkItemType, WorkQueueTypeProperties>,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            query_delay_ms: 1_000,
            lock_retry_delay_ms: 5_000,
            postpone_grace_secs: 120,
            max_queue_depth: 100_000,
            priority_worker_count: 0,
            memory_limited_worker_count: 0,
            terminal_retention_secs: 86_400,
            housekeeping_interval_ms: 60_000,
            scratch_directory: std::env::temp_dir().join("pacs_workqueue"),
            thread_stack_size: 2 * 1024 * 1024,
            shutdown_timeout_ms: 2_000,
            throttle: ThrottleConfig::default(),
            default_properties: WorkQueueTypeProperties::default(),
            types: HashMap::new(),
        }
    }
}

impl WorkQueueConfig {
    /// Properties for `item_type`.
    #[must_use]
    pub fn properties(&self, item_type: WorkItemType) -> &WorkQueueTypeProperties {
        self.types.get(&item_type).unwrap_or(&self.default_properties)
    }

    /// Builder-style worker count.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Builder-style scratch directory.
    #[must_use]
    pub fn with_scratch_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_directory = dir.into();
        self
    }

    /// Builder-style per-type override.
    #[must_use]
    pub fn with_type_properties(mut self, item_type: WorkItemType, props: WorkQueueTypeProperties) -> Self {
        self.types.insert(item_type, props);
        self
    }

    /// Idle poll interval.
    #[must_use]
    pub const fn query_delay(&self) -> Duration {
        Duration::from_millis(self.query_delay_ms)
    }

    /// Retention window for finished items.
    #[must_use]
    pub const fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }

    /// Housekeeping interval.
    #[must_use]
    pub const fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    /// Passes Normal and Low items may occupy at once.
    #[must_use]
    pub const fn general_worker_count(&self) -> usize {
        self.worker_count.saturating_sub(self.priority_worker_count)
    }

    /// Validate all values.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.priority_worker_count >= self.worker_count {
            return Err("priority_worker_count must be less than worker_count".into());
        }
        if self.housekeeping_interval_ms == 0 {
            return Err("housekeeping_interval_ms must be greater than 0".into());
        }
        if self.query_delay_ms == 0 {
            return Err("query_delay_ms must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        if self.throttle.max_connections_per_destination == 0 {
            return Err("throttle.max_connections_per_destination must be greater than 0".into());
        }
        self.default_properties
            .validate()
            .map_err(|e| format!("default_properties invalid: {e}"))?;
        for (item_type, props) in &self.types {
            props
                .validate()
                .map_err(|e| format!("type `{item_type}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `PACS_WQ_*` environment variables, after
    /// loading a `.env` file when present.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by `PACS_WQ_*` entries of `vars`.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, String> {
        let mut cfg = Self::default();
        for (name, value) in vars {
            let Some(field) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "WORKER_COUNT" => cfg.worker_count = parse(&name, &value)?,
                "QUERY_DELAY_MS" => cfg.query_delay_ms = parse(&name, &value)?,
                "LOCK_RETRY_DELAY_MS" => cfg.lock_retry_delay_ms = parse(&name, &value)?,
                "POSTPONE_GRACE_SECS" => cfg.postpone_grace_secs = parse(&name, &value)?,
                "MAX_QUEUE_DEPTH" => cfg.max_queue_depth = parse(&name, &value)?,
                "PRIORITY_WORKER_COUNT" => cfg.priority_worker_count = parse(&name, &value)?,
                "MEMORY_LIMITED_WORKER_COUNT" => cfg.memory_limited_worker_count = parse(&name, &value)?,
                "TERMINAL_RETENTION_SECS" => cfg.terminal_retention_secs = parse(&name, &value)?,
                "HOUSEKEEPING_INTERVAL_MS" => cfg.housekeeping_interval_ms = parse(&name, &value)?,
                "SCRATCH_DIRECTORY" => cfg.scratch_directory = PathBuf::from(value),
                "MAX_FAILURE_COUNT" => cfg.default_properties.max_failure_count = parse(&name, &value)?,
                "FAILURE_DELAY_SECS" => cfg.default_properties.failure_delay_secs = parse(&name, &value)?,
                "MAX_BATCH_SIZE" => cfg.default_properties.max_batch_size = parse(&name, &value)?,
                "MAX_CONNECTIONS_PER_DESTINATION" => {
                    cfg.throttle.max_connections_per_destination = parse(&name, &value)?;
                }
                _ => tracing::debug!(variable = %name, "ignoring unknown work queue variable"),
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{name}: cannot parse `{value}`: {e}"))
}
