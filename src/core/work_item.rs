//! Persisted work queue item model.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::serde::{Priority, ResourceKey, WorkItemKey};

/// Lifecycle of a work item.
///
/// `Pending → InProgress → {Idle | Pending | Complete | Failed}`; Idle items
/// become eligible again once their scheduled time passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting for its scheduled time.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Processed; may receive more work before it expires.
    Idle,
    /// Gave up; `failure_description` says why.
    Failed,
    /// Done.
    Complete,
}

impl WorkItemStatus {
    /// Complete or Failed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Pending, Idle or InProgress.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Idle | Self::InProgress)
    }
}

/// Work item type tag, used to resolve the item processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemType {
    /// File newly received instances into their study folder.
    StudyProcess,
    /// Forward a study's instances to a remote destination.
    AutoRoute,
    /// Remove a study from disk and the catalogue.
    DeleteStudy,
    /// Move a study folder to another storage tier.
    TierMigrate,
}

impl WorkItemType {
    /// Every type, in declaration order.
    pub const ALL: [Self; 4] = [Self::StudyProcess, Self::AutoRoute, Self::DeleteStudy, Self::TierMigrate];

    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StudyProcess => "study_process",
            Self::AutoRoute => "auto_route",
            Self::DeleteStudy => "delete_study",
            Self::TierMigrate => "tier_migrate",
        }
    }
}

impl fmt::Display for WorkItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sub-unit of a work item (typically a single SOP instance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemUnit {
    /// Instance UID.
    pub uid: String,
    /// File path relative to the item's working folder.
    pub relative_path: String,
    /// Failed attempts for this unit.
    #[serde(default)]
    pub failure_count: u32,
    /// Permanently failed; skipped by batching.
    #[serde(default)]
    pub failed: bool,
}

impl WorkItemUnit {
    /// New unit.
    pub fn new(uid: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            relative_path: relative_path.into(),
            failure_count: 0,
            failed: false,
        }
    }
}

/// Persisted, schedulable description of a background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkQueueItem {
    /// Item key.
    pub key: WorkItemKey,
    /// Type tag.
    pub item_type: WorkItemType,
    /// Owning resource (study storage key).
    pub resource_key: ResourceKey,
    /// Lifecycle state.
    pub status: WorkItemStatus,
    /// Dispatch priority.
    pub priority: Priority,
    /// Earliest pickup time (ms since epoch).
    pub scheduled_ms: u64,
    /// After this instant an Idle item completes and retries stop (ms since epoch).
    pub expiration_ms: u64,
    /// Failed attempts so far.
    #[serde(default)]
    pub failure_count: u32,
    /// Why the item last failed.
    #[serde(default)]
    pub failure_description: Option<String>,
    /// Why the item was last postponed.
    #[serde(default)]
    pub postpone_reason: Option<String>,
    /// Worker holding the item while InProgress.
    #[serde(default)]
    pub processor_id: Option<String>,
    /// Operator requested cancellation.
    #[serde(default)]
    pub cancel_pending: bool,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Sub-units still to process.
    #[serde(default)]
    pub units: Vec<WorkItemUnit>,
    /// Creation time (ms since epoch).
    pub created_at_ms: u64,
    /// Last status change (ms since epoch).
    pub last_updated_ms: u64,
}

impl WorkQueueItem {
    /// New Pending item scheduled at `scheduled_ms`.
    #[must_use]
    pub fn new(
        item_type: WorkItemType,
        resource_key: ResourceKey,
        scheduled_ms: u64,
        expiration_ms: u64,
        priority: Priority,
        now_ms: u64,
    ) -> Self {
        Self {
            key: WorkItemKey::new(),
            item_type,
            resource_key,
            status: WorkItemStatus::Pending,
            priority,
            scheduled_ms,
            expiration_ms: expiration_ms.max(scheduled_ms),
            failure_count: 0,
            failure_description: None,
            postpone_reason: None,
            processor_id: None,
            cancel_pending: false,
            data: Value::Null,
            units: Vec::new(),
            created_at_ms: now_ms,
            last_updated_ms: now_ms,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attach sub-units.
    #[must_use]
    pub fn with_units(mut self, units: Vec<WorkItemUnit>) -> Self {
        self.units = units;
        self
    }

    /// Pending or Idle and scheduled at or before `now_ms`.
    #[must_use]
    pub const fn is_due(&self, now_ms: u64) -> bool {
        matches!(self.status, WorkItemStatus::Pending | WorkItemStatus::Idle) && self.scheduled_ms <= now_ms
    }

    /// Units not yet permanently failed.
    pub fn remaining_units(&self) -> impl Iterator<Item = &WorkItemUnit> {
        self.units.iter().filter(|u| !u.failed)
    }

    /// Up to `max` remaining units, in order.
    #[must_use]
    pub fn batch(&self, max: usize) -> Vec<WorkItemUnit> {
        self.remaining_units().take(max.max(1)).cloned().collect()
    }

    /// Drop a unit that was processed successfully.
    pub fn complete_unit(&mut self, uid: &str) {
        self.units.retain(|u| u.uid != uid);
    }

    /// Count a failure against a unit; marks it failed once `max_failures`
    /// is reached. Returns whether the unit is now permanently failed.
    pub fn fail_unit(&mut self, uid: &str, max_failures: u32) -> bool {
        self.units
            .iter_mut()
            .find(|u| u.uid == uid)
            .is_some_and(|unit| {
                unit.failure_count += 1;
                unit.failed = unit.failure_count >= max_failures;
                unit.failed
            })
    }
}
