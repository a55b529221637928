//! Move received instances from the incoming folder into the study folder.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::core::command::{
    AggregateCommand, CommandProcessor, CreateDirectoryCommand, DeleteFileCommand, ModifyEntityCommand, Rollback,
    SaveFileCommand,
};
use crate::core::error::CommandError;
use crate::core::item_processor::{ItemContext, ItemFailure, ItemProcessor, ProcessResult};
use crate::infra::persistence::StudyStorage;

use super::{load_storage, not_initialized, payload};

/// `data` of a StudyProcess item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyProcessData {
    /// Folder the units' relative paths resolve against.
    pub incoming_dir: PathBuf,
}

/// Handler for `StudyProcess` items.
#[derive(Debug, Default)]
pub struct StudyProcessProcessor {
    storage: Option<StudyStorage>,
    data: Option<StudyProcessData>,
}

/// Add one stored instance to the study row.
pub(crate) fn count_instance(entity: &mut Value, size: u64) -> Result<(), CommandError> {
    let row = entity
        .as_object_mut()
        .ok_or_else(|| CommandError::Invalid("study row is not an object".into()))?;
    let count = row.get("instance_count").and_then(Value::as_u64).unwrap_or(0);
    let bytes = row.get("size_bytes").and_then(Value::as_u64).unwrap_or(0);
    row.insert("instance_count".into(), json!(count + 1));
    row.insert("size_bytes".into(), json!(bytes + size));
    Ok(())
}

impl ItemProcessor for StudyProcessProcessor {
    fn initialize(&mut self, ctx: &mut ItemContext<'_>) -> Result<(), ItemFailure> {
        self.storage = Some(load_storage(ctx)?);
        self.data = Some(payload(ctx)?);
        Ok(())
    }

    fn process_item(&mut self, ctx: &mut ItemContext<'_>) -> Result<ProcessResult, ItemFailure> {
        let (Some(storage), Some(data)) = (&self.storage, &self.data) else {
            return Err(not_initialized(ctx));
        };

        let batch = ctx.item.batch(ctx.properties.max_batch_size);
        if batch.is_empty() {
            return Ok(ProcessResult::Idle);
        }

        for unit in batch {
            if ctx.cancel.is_cancelled() {
                return Ok(ProcessResult::Cancelled);
            }
            let source = data.incoming_dir.join(&unit.relative_path);
            let target = storage.study_path.join(format!("{}.dcm", unit.uid));

            if target.exists() {
                warn!(item = %ctx.item.key, uid = %unit.uid, "duplicate instance, failing unit");
                ctx.item.fail_unit(&unit.uid, 1);
                continue;
            }

            let size = fs::metadata(&source).map(|m| m.len()).unwrap_or(0);
            let mut processor = CommandProcessor::new(
                format!("study-process {}", unit.uid),
                ctx.services.processor_context("study-process"),
            )
            .with_cancellation(ctx.cancel.clone());
            processor.add_command(CreateDirectoryCommand::new(&storage.study_path, Rollback::Required));
            processor.add_command(
                AggregateCommand::new("store-instance")
                    .with(SaveFileCommand::copy_from(&source, &target, false, Rollback::Required))
                    .with(DeleteFileCommand::new(&source, Rollback::Required)),
            );
            processor.add_command(ModifyEntityCommand::new(
                StudyStorage::TABLE,
                storage.key.clone(),
                move |entity| count_instance(entity, size),
            ));

            match ctx.run(&mut processor) {
                Ok(true) => {
                    debug!(item = %ctx.item.key, uid = %unit.uid, "instance stored");
                    ctx.item.complete_unit(&unit.uid);
                }
                Ok(false) => return Ok(ProcessResult::Cancelled),
                Err(failure) => {
                    if ctx.item.fail_unit(&unit.uid, ctx.properties.max_unit_failures) {
                        warn!(item = %ctx.item.key, uid = %unit.uid, reason = %failure.reason, "unit failed permanently");
                        continue;
                    }
                    return Err(failure);
                }
            }
        }

        if ctx.item.remaining_units().next().is_some() {
            Ok(ProcessResult::Pending)
        } else {
            Ok(ProcessResult::Idle)
        }
    }
}
