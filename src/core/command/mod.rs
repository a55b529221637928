//! Transactional command engine.
//!
//! A [`Command`] is one mutating step (save a file, delete a study folder,
//! update a catalogue row) with an `undo` that restores the prior state. A
//! [`CommandProcessor`] runs an ordered list of them as a single local saga:
//! FIFO execute, LIFO undo on the first failure, then `commit` or `rollback`
//! on its [`ProcessorContext`].
//!
//! ```rust,ignore
//! use pacs_workqueue::core::command::{CommandProcessor, Rollback};
//! use pacs_workqueue::core::command::fs::{CreateDirectoryCommand, SaveFileCommand};
//!
//! let mut processor = CommandProcessor::new("ingest", context);
//! processor.add_command(CreateDirectoryCommand::new(&study_dir, Rollback::Required));
//! processor.add_command(SaveFileCommand::from_bytes(&target, bytes, false, Rollback::Required));
//! if !processor.execute() {
//!     tracing::warn!(reason = ?processor.failure_reason(), "ingest rolled back");
//! }
//! ```

pub mod aggregate;
pub mod catalogue;
pub mod fs;
pub mod processor;

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use crate::core::error::{panic_message, CommandError};
use crate::infra::persistence::UpdateContext;

pub use aggregate::AggregateCommand;
pub use catalogue::{DeleteEntityCommand, InsertEntityCommand, ModifyEntityCommand};
pub use fs::{
    CopyDirectoryCommand, CreateDirectoryCommand, DeleteDirectoryCommand, DeleteFileCommand,
    MoveDirectoryCommand, RenameFileCommand, SaveFileCommand,
};
pub use processor::CommandProcessor;

/// Whether a mutating command must be able to undo itself.
///
/// Every mutating filesystem command takes this explicitly so an
/// irreversible operation is always a visible choice at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// Snapshot or stage state so `undo` can restore it.
    Required,
    /// Mutate in place; `undo` is a no-op.
    Skip,
}

impl Rollback {
    /// `true` for [`Rollback::Required`].
    #[must_use]
    pub const fn is_required(self) -> bool {
        matches!(self, Self::Required)
    }
}

/// One atomic unit of mutating work.
///
/// `execute` is called at most once. `undo` is called at most once, only
/// after `execute` was attempted, and must cope with a partially completed
/// `execute` when `requires_rollback` is true. `finalize` runs once after the
/// owning processor committed and is where staged deletes and backups go away.
pub trait Command: Send {
    /// Name used in logs and failure reasons.
    fn name(&self) -> &str;

    /// Whether `undo` must run for this command when it fails part-way.
    fn requires_rollback(&self) -> bool;

    /// Perform the effect.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] when a precondition is violated or IO fails.
    fn execute(&mut self, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError>;

    /// Reverse the effect of the last `execute`. Best effort.
    ///
    /// # Errors
    ///
    /// Errors are logged by the processor and never propagated further.
    fn undo(&mut self, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError>;

    /// Discard undo state after a successful commit.
    fn finalize(&mut self) {}
}

/// Environment a [`CommandProcessor`] runs its commands in.
///
/// Lives exactly as long as one processor; the processor owns it.
pub trait ProcessorContext {
    /// Called immediately before each command (including aggregate children)
    /// executes.
    fn pre_execute(&mut self, command: &dyn Command);

    /// Make every staged change durable.
    ///
    /// # Errors
    ///
    /// A failed commit is reported as the processor's failure.
    fn commit(&mut self) -> Result<(), CommandError>;

    /// Discard every staged change.
    fn rollback(&mut self);

    /// Where commands snapshot content they are about to overwrite.
    fn backup_directory(&self) -> &Path;

    /// Catalogue transaction, when one is attached.
    fn update_context(&mut self) -> Option<&mut dyn UpdateContext> {
        None
    }
}

/// Run `execute` with panics turned into [`CommandError::Panicked`], so a
/// misbehaving command still goes through undo and rollback.
pub(crate) fn execute_guarded(command: &mut dyn Command, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
    panic::catch_unwind(AssertUnwindSafe(|| command.execute(ctx))).unwrap_or_else(|payload| {
        Err(CommandError::Panicked {
            command: command.name().to_owned(),
            message: panic_message(&*payload),
        })
    })
}

/// Same as [`execute_guarded`] for `undo`.
pub(crate) fn undo_guarded(command: &mut dyn Command, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
    panic::catch_unwind(AssertUnwindSafe(|| command.undo(ctx))).unwrap_or_else(|payload| {
        Err(CommandError::Panicked {
            command: command.name().to_owned(),
            message: panic_message(&*payload),
        })
    })
}
