//! A command made of child commands.

use tracing::{debug, error};

use crate::core::error::CommandError;

use super::{execute_guarded, undo_guarded, Command, ProcessorContext};

/// Runs children in order as one unit. When a child fails, already executed
/// siblings are undone here, before the failure reaches the parent processor.
pub struct AggregateCommand {
    name: String,
    children: Vec<Box<dyn Command>>,
    executed: Vec<Box<dyn Command>>,
    rolled_back: bool,
}

impl AggregateCommand {
    /// Empty aggregate.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            executed: Vec::new(),
            rolled_back: false,
        }
    }

    /// Append a child.
    pub fn add_command(&mut self, command: impl Command + 'static) {
        self.children.push(Box::new(command));
    }

    /// Builder form of [`add_command`](Self::add_command).
    #[must_use]
    pub fn with(mut self, command: impl Command + 'static) -> Self {
        self.add_command(command);
        self
    }

    /// Number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len() + self.executed.len()
    }

    /// Whether the aggregate has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn undo_children(&mut self, ctx: &mut dyn ProcessorContext) {
        while let Some(mut child) = self.executed.pop() {
            debug!(aggregate = %self.name, command = child.name(), "undoing child");
            if let Err(err) = undo_guarded(child.as_mut(), ctx) {
                error!(aggregate = %self.name, command = child.name(), error = %err, "child undo failed");
            }
        }
    }
}

impl Command for AggregateCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_rollback(&self) -> bool {
        self.children
            .iter()
            .chain(self.executed.iter())
            .any(|c| c.requires_rollback())
    }

    fn execute(&mut self, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        let children = std::mem::take(&mut self.children);
        for mut child in children {
            ctx.pre_execute(child.as_ref());
            match execute_guarded(child.as_mut(), ctx) {
                Ok(()) => self.executed.push(child),
                Err(err) => {
                    let command = child.name().to_owned();
                    if child.requires_rollback() {
                        self.executed.push(child);
                    }
                    self.undo_children(ctx);
                    self.rolled_back = true;
                    return Err(CommandError::SubCommand {
                        aggregate: self.name.clone(),
                        command,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn undo(&mut self, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if self.rolled_back {
            return Ok(());
        }
        self.undo_children(ctx);
        self.rolled_back = true;
        Ok(())
    }

    fn finalize(&mut self) {
        for child in &mut self.executed {
            child.finalize();
        }
    }
}
