//! Transport collaborator used by auto-routing.
//!
//! The DICOM stack is a black box here: a synchronous transfer of a list of
//! units that reports per-unit status through a callback and checks the
//! cancellation token between units.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::cancel::CancellationToken;
use crate::core::work_item::WorkItemUnit;

/// Transport failures affecting a whole transfer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Destination is not configured.
    #[error("unknown destination {0}")]
    UnknownDestination(String),
    /// Association could not be opened.
    #[error("cannot reach {destination}: {reason}")]
    Unreachable {
        /// Destination id.
        destination: String,
        /// Cause.
        reason: String,
    },
}

/// Outcome of a single unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    /// Delivered.
    Sent,
    /// Not delivered, with the reason.
    Failed(String),
}

/// Result of one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// UIDs delivered.
    pub sent: Vec<String>,
    /// UIDs that failed, with reasons.
    pub failed: Vec<(String, String)>,
    /// Transfer stopped early because cancellation was requested.
    pub cancelled: bool,
}

/// Callback invoked once per unit attempted.
pub type UnitCallback<'a> = &'a mut dyn FnMut(&WorkItemUnit, &UnitStatus);

/// Sends study instances to a destination.
pub trait Transport: Send + Sync {
    /// Send `units` (paths relative to `source_dir`) to `destination`.
    ///
    /// # Errors
    ///
    /// Whole-transfer failures only; per-unit failures land in the summary.
    fn send(
        &self,
        destination: &str,
        source_dir: &Path,
        units: &[WorkItemUnit],
        cancel: &CancellationToken,
        on_unit: UnitCallback<'_>,
    ) -> Result<TransferSummary, TransportError>;
}

/// Live association counts per destination.
pub trait ConnectionMonitor: Send + Sync {
    /// Associations currently open to `destination`.
    fn active_connections(&self, destination: &str) -> u32;
}

type Counts = Arc<Mutex<HashMap<String, u32>>>;

/// Open association; counted until dropped.
pub struct Association {
    counts: Counts,
    destination: String,
}

impl Drop for Association {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        if let Some(n) = counts.get_mut(&self.destination) {
            *n = n.saturating_sub(1);
        }
    }
}

/// Transport that "sends" by copying files into a per-destination folder.
#[derive(Debug, Default)]
pub struct DirectoryTransport {
    destinations: RwLock<HashMap<String, PathBuf>>,
    active: Counts,
}

impl DirectoryTransport {
    /// Transport without destinations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `destination` as the folder `root`.
    pub fn add_destination(&self, destination: impl Into<String>, root: impl Into<PathBuf>) {
        self.destinations.write().insert(destination.into(), root.into());
    }

    /// Open an association to `destination`.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnknownDestination`] if it is not registered.
    pub fn open_association(&self, destination: &str) -> Result<Association, TransportError> {
        if !self.destinations.read().contains_key(destination) {
            return Err(TransportError::UnknownDestination(destination.to_owned()));
        }
        *self.active.lock().entry(destination.to_owned()).or_insert(0) += 1;
        Ok(Association {
            counts: Arc::clone(&self.active),
            destination: destination.to_owned(),
        })
    }

    fn deliver(source: &Path, target: &Path) -> Result<(), String> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("create {}: {e}", parent.display()))?;
        }
        fs::copy(source, target)
            .map(|_| ())
            .map_err(|e| format!("copy {}: {e}", source.display()))
    }
}

impl Transport for DirectoryTransport {
    fn send(
        &self,
        destination: &str,
        source_dir: &Path,
        units: &[WorkItemUnit],
        cancel: &CancellationToken,
        on_unit: UnitCallback<'_>,
    ) -> Result<TransferSummary, TransportError> {
        let root = self
            .destinations
            .read()
            .get(destination)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDestination(destination.to_owned()))?;
        if !root.is_dir() {
            return Err(TransportError::Unreachable {
                destination: destination.to_owned(),
                reason: format!("{} is not a directory", root.display()),
            });
        }
        let _association = self.open_association(destination)?;

        let mut summary = TransferSummary::default();
        for unit in units {
            if cancel.is_cancelled() {
                debug!(destination, remaining = units.len() - summary.sent.len() - summary.failed.len(), "transfer cancelled");
                summary.cancelled = true;
                break;
            }
            let status = match Self::deliver(&source_dir.join(&unit.relative_path), &root.join(&unit.relative_path)) {
                Ok(()) => {
                    summary.sent.push(unit.uid.clone());
                    UnitStatus::Sent
                }
                Err(reason) => {
                    warn!(destination, uid = %unit.uid, %reason, "unit send failed");
                    summary.failed.push((unit.uid.clone(), reason.clone()));
                    UnitStatus::Failed(reason)
                }
            };
            on_unit(unit, &status);
        }
        Ok(summary)
    }
}

impl ConnectionMonitor for DirectoryTransport {
    fn active_connections(&self, destination: &str) -> u32 {
        self.active.lock().get(destination).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn sends_units_and_reports_each() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("1.dcm"), b"1").unwrap();
        let transport = DirectoryTransport::new();
        transport.add_destination("PACS_B", dst.path());

        let units = vec![WorkItemUnit::new("1", "1.dcm"), WorkItemUnit::new("2", "missing.dcm")];
        let mut seen = Vec::new();
        let summary = transport
            .send("PACS_B", src.path(), &units, &CancellationToken::new(), &mut |u: &WorkItemUnit, s: &UnitStatus| {
                seen.push((u.uid.clone(), s.clone()));
            })
            .unwrap();

        assert_eq!(summary.sent, ["1"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(seen.len(), 2);
        assert!(dst.path().join("1.dcm").exists());
        assert_eq!(transport.active_connections("PACS_B"), 0);
    }

    #[test]
    fn cancellation_stops_between_units() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("1.dcm"), b"1").unwrap();
        fs::write(src.path().join("2.dcm"), b"2").unwrap();
        let transport = DirectoryTransport::new();
        transport.add_destination("PACS_B", dst.path());
        let cancel = CancellationToken::new();

        let units = vec![WorkItemUnit::new("1", "1.dcm"), WorkItemUnit::new("2", "2.dcm")];
        let trip = cancel.clone();
        let summary = transport
            .send("PACS_B", src.path(), &units, &cancel, &mut |_: &WorkItemUnit, _: &UnitStatus| trip.cancel())
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.sent, ["1"]);
        assert!(!dst.path().join("2.dcm").exists());
    }

    #[test]
    fn associations_are_counted() {
        let dst = TempDir::new().unwrap();
        let transport = DirectoryTransport::new();
        transport.add_destination("PACS_B", dst.path());
        let a = transport.open_association("PACS_B").unwrap();
        let _b = transport.open_association("PACS_B").unwrap();
        assert_eq!(transport.active_connections("PACS_B"), 2);
        drop(a);
        assert_eq!(transport.active_connections("PACS_B"), 1);
        assert!(transport.open_association("nowhere").is_err());
    }
}
