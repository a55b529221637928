//! Commands that stage catalogue writes on the processor's update context.
//!
//! These never need their own undo: the context's rollback drops whatever
//! they staged.

use serde_json::Value;

use crate::core::error::CommandError;
use crate::infra::persistence::UpdateContext;

use super::{Command, ProcessorContext};

fn update_context<'a>(
    ctx: &'a mut dyn ProcessorContext,
    command: &str,
) -> Result<&'a mut dyn UpdateContext, CommandError> {
    ctx.update_context()
        .ok_or_else(|| CommandError::Invalid(format!("{command} needs a catalogue update context")))
}

/// Insert a new catalogue entity.
#[derive(Debug)]
pub struct InsertEntityCommand {
    table: String,
    key: String,
    entity: Option<Value>,
}

impl InsertEntityCommand {
    /// Insert `entity` under `(table, key)`.
    pub fn new(table: impl Into<String>, key: impl Into<String>, entity: Value) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            entity: Some(entity),
        }
    }
}

impl Command for InsertEntityCommand {
    fn name(&self) -> &str {
        "insert_entity"
    }

    fn requires_rollback(&self) -> bool {
        false
    }

    fn execute(&mut self, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        let entity = self
            .entity
            .take()
            .ok_or_else(|| CommandError::Invalid("insert_entity executed twice".into()))?;
        update_context(ctx, "insert_entity")?.insert(&self.table, &self.key, entity)?;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        Ok(())
    }
}

type Modifier = Box<dyn FnMut(&mut Value) -> Result<(), CommandError> + Send>;

/// Read-modify-write of an existing entity.
pub struct ModifyEntityCommand {
    table: String,
    key: String,
    modify: Modifier,
}

impl ModifyEntityCommand {
    /// Apply `modify` to the entity at `(table, key)`.
    pub fn new(
        table: impl Into<String>,
        key: impl Into<String>,
        modify: impl FnMut(&mut Value) -> Result<(), CommandError> + Send + 'static,
    ) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            modify: Box::new(modify),
        }
    }
}

impl Command for ModifyEntityCommand {
    fn name(&self) -> &str {
        "modify_entity"
    }

    fn requires_rollback(&self) -> bool {
        false
    }

    fn execute(&mut self, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        let update = update_context(ctx, "modify_entity")?;
        let mut entity = update.find(&self.table, &self.key).ok_or_else(|| {
            CommandError::Persistence(format!("{}/{} not found", self.table, self.key))
        })?;
        (self.modify)(&mut entity)?;
        update.update(&self.table, &self.key, entity)?;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        Ok(())
    }
}

/// Delete a catalogue entity. Deleting a missing entity succeeds.
#[derive(Debug)]
pub struct DeleteEntityCommand {
    table: String,
    key: String,
}

impl DeleteEntityCommand {
    /// Delete `(table, key)`.
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

impl Command for DeleteEntityCommand {
    fn name(&self) -> &str {
        "delete_entity"
    }

    fn requires_rollback(&self) -> bool {
        false
    }

    fn execute(&mut self, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        update_context(ctx, "delete_entity")?.delete(&self.table, &self.key)?;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        Ok(())
    }
}
