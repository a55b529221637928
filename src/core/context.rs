//! Production processor context.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::command::{Command, ProcessorContext};
use crate::core::error::CommandError;
use crate::infra::persistence::UpdateContext;

/// Context used by item processors: owns a catalogue transaction and a
/// private backup directory under the scratch root.
///
/// The backup directory is created lazily by commands that need it and
/// removed when the context is dropped, if nothing is left in it.
pub struct ServerProcessorContext {
    name: String,
    update: Option<Box<dyn UpdateContext>>,
    backup_dir: PathBuf,
    executed: usize,
}

impl ServerProcessorContext {
    /// Context without a catalogue transaction.
    pub fn new(name: impl Into<String>, scratch_root: impl AsRef<Path>) -> Self {
        let name = name.into();
        let scratch = scratch_root.as_ref();
        let backup_dir = scratch
            .join("backup")
            .join(format!("{}-{}", sanitize(&name), Uuid::new_v4().simple()));
        Self {
            name,
            update: None,
            backup_dir,
            executed: 0,
        }
    }

    /// Attach a catalogue transaction committed/rolled back with the processor.
    #[must_use]
    pub fn with_update_context(mut self, update: Box<dyn UpdateContext>) -> Self {
        self.update = Some(update);
        self
    }

    /// Commands (including aggregate children) that reached `pre_execute`.
    #[must_use]
    pub const fn executed_commands(&self) -> usize {
        self.executed
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl ProcessorContext for ServerProcessorContext {
    fn pre_execute(&mut self, command: &dyn Command) {
        self.executed += 1;
        trace!(processor = %self.name, command = command.name(), count = self.executed, "pre-execute");
    }

    fn commit(&mut self) -> Result<(), CommandError> {
        if let Some(update) = self.update.as_mut() {
            update.commit()?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        if let Some(update) = self.update.as_mut() {
            update.rollback();
        }
        debug!(processor = %self.name, "processor context rolled back");
    }

    fn backup_directory(&self) -> &Path {
        &self.backup_dir
    }

    fn update_context(&mut self) -> Option<&mut dyn UpdateContext> {
        let update: &mut dyn UpdateContext = self.update.as_deref_mut()?;
        Some(update)
    }
}

impl Drop for ServerProcessorContext {
    fn drop(&mut self) {
        // remove_dir only succeeds on an empty directory
        if fs::remove_dir(&self.backup_dir).is_ok() {
            trace!(path = %self.backup_dir.display(), "removed backup directory");
        }
    }
}
