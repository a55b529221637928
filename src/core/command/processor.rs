//! Sequential all-or-nothing execution of commands.

use tracing::{debug, error, warn};

use crate::core::cancel::CancellationToken;
use crate::core::error::CommandError;

use super::{execute_guarded, undo_guarded, Command, ProcessorContext};

/// Local saga executor over an ordered list of commands.
///
/// Guarantees:
/// - commands execute in insertion order and undo in exactly reverse order,
/// - `commit` is called iff every command succeeded,
/// - `rollback` is called iff some command failed (zero commands is a trivial
///   success),
/// - a failure reason is recorded exactly when `execute` returns `false`.
pub struct CommandProcessor<C: ProcessorContext> {
    name: String,
    pending: Vec<Box<dyn Command>>,
    executed: Vec<Box<dyn Command>>,
    context: C,
    cancel: Option<CancellationToken>,
    failure: Option<CommandError>,
    failure_reason: Option<String>,
    executed_count: usize,
    ran: bool,
}

impl<C: ProcessorContext> CommandProcessor<C> {
    /// Create an empty processor owning `context`.
    pub fn new(name: impl Into<String>, context: C) -> Self {
        Self {
            name: name.into(),
            pending: Vec::new(),
            executed: Vec::new(),
            context,
            cancel: None,
            failure: None,
            failure_reason: None,
            executed_count: 0,
            ran: false,
        }
    }

    /// Check `token` before each command; a cancelled token fails the run
    /// with [`CommandError::Cancelled`] and rolls back what already ran.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Append a command. Has no effect once `execute` was called.
    pub fn add_command(&mut self, command: impl Command + 'static) {
        self.add_boxed(Box::new(command));
    }

    /// Append an already boxed command.
    pub fn add_boxed(&mut self, command: Box<dyn Command>) {
        if self.ran {
            warn!(processor = %self.name, command = command.name(), "command added after execute; ignored");
            return;
        }
        self.pending.push(command);
    }

    /// Processor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of commands queued and not yet run.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of commands whose `execute` returned success.
    #[must_use]
    pub const fn executed_count(&self) -> usize {
        self.executed_count
    }

    /// Human-readable reason of the last failure.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Typed failure, when the run failed.
    #[must_use]
    pub const fn failure(&self) -> Option<&CommandError> {
        self.failure.as_ref()
    }

    /// Borrow the context.
    pub const fn context(&self) -> &C {
        &self.context
    }

    /// Mutably borrow the context.
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Give the context back to the caller.
    pub fn into_context(self) -> C {
        self.context
    }

    /// Run every pending command as one unit. Call once; a second call
    /// returns `false` and leaves the recorded outcome untouched.
    #[must_use]
    pub fn execute(&mut self) -> bool {
        if self.ran {
            warn!(processor = %self.name, "{}", CommandError::AlreadyExecuted(self.name.clone()));
            return false;
        }
        self.ran = true;

        let pending = std::mem::take(&mut self.pending);
        let total = pending.len();
        let mut failure = None;

        for mut command in pending {
            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    failure = Some(CommandError::Cancelled(command.name().to_owned()));
                    break;
                }
            }

            self.context.pre_execute(command.as_ref());
            debug!(processor = %self.name, command = command.name(), "executing command");

            match execute_guarded(command.as_mut(), &mut self.context) {
                Ok(()) => {
                    self.executed_count += 1;
                    self.executed.push(command);
                }
                Err(err) => {
                    warn!(
                        processor = %self.name,
                        command = command.name(),
                        error = %err,
                        "command failed"
                    );
                    if command.requires_rollback() {
                        self.executed.push(command);
                    }
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            self.undo_executed();
            self.context.rollback();
            self.record_failure(err);
            return false;
        }

        if let Err(err) = self.context.commit() {
            error!(processor = %self.name, error = %err, "commit failed; undoing executed commands");
            self.undo_executed();
            self.record_failure(err);
            return false;
        }

        for command in &mut self.executed {
            command.finalize();
        }
        self.executed.clear();
        debug!(processor = %self.name, commands = total, "processor committed");
        true
    }

    fn undo_executed(&mut self) {
        while let Some(mut command) = self.executed.pop() {
            debug!(processor = %self.name, command = command.name(), "undoing command");
            if let Err(err) = undo_guarded(command.as_mut(), &mut self.context) {
                error!(
                    processor = %self.name,
                    command = command.name(),
                    error = %err,
                    "undo failed"
                );
            }
        }
    }

    fn record_failure(&mut self, err: CommandError) {
        self.failure_reason = Some(err.to_string());
        self.failure = Some(err);
    }
}
