//! Move a study folder to another storage tier.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::command::{CommandProcessor, CreateDirectoryCommand, ModifyEntityCommand, MoveDirectoryCommand, Rollback};
use crate::core::error::CommandError;
use crate::core::item_processor::{ItemContext, ItemFailure, ItemProcessor, ProcessResult};
use crate::infra::persistence::StudyStorage;

use super::{load_storage, not_initialized, payload, run_outcome};

/// `data` of a TierMigrate item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMigrateData {
    /// Target tier label recorded in the catalogue.
    pub tier: String,
    /// Folder the study folder is moved into.
    pub tier_root: PathBuf,
}

/// Handler for `TierMigrate` items.
#[derive(Debug, Default)]
pub struct TierMigrateProcessor {
    storage: Option<StudyStorage>,
    data: Option<TierMigrateData>,
}

impl ItemProcessor for TierMigrateProcessor {
    fn initialize(&mut self, ctx: &mut ItemContext<'_>) -> Result<(), ItemFailure> {
        let storage = load_storage(ctx)?;
        let data: TierMigrateData = payload(ctx)?;
        if data.tier.is_empty() {
            return Err(ItemFailure::fatal("target tier is empty"));
        }
        self.storage = Some(storage);
        self.data = Some(data);
        Ok(())
    }

    fn process_item(&mut self, ctx: &mut ItemContext<'_>) -> Result<ProcessResult, ItemFailure> {
        let (Some(storage), Some(data)) = (&self.storage, &self.data) else {
            return Err(not_initialized(ctx));
        };
        if storage.tier == data.tier {
            return Ok(ProcessResult::Complete);
        }

        let folder = storage
            .study_path
            .file_name()
            .ok_or_else(|| ItemFailure::fatal(format!("study path {} has no folder name", storage.study_path.display())))?;
        let destination = data.tier_root.join(folder);

        let mut processor = CommandProcessor::new(
            format!("tier-migrate {}", storage.key),
            ctx.services.processor_context("tier-migrate"),
        )
        .with_cancellation(ctx.cancel.clone());
        processor.add_command(CreateDirectoryCommand::new(&data.tier_root, Rollback::Required));
        processor.add_command(MoveDirectoryCommand::new(&storage.study_path, &destination, Rollback::Required));

        let tier = data.tier.clone();
        let path = destination.to_string_lossy().into_owned();
        processor.add_command(ModifyEntityCommand::new(
            StudyStorage::TABLE,
            storage.key.clone(),
            move |entity: &mut Value| {
                let row = entity
                    .as_object_mut()
                    .ok_or_else(|| CommandError::Invalid("study row is not an object".into()))?;
                row.insert("study_path".into(), json!(path));
                row.insert("tier".into(), json!(tier));
                Ok(())
            },
        ));
        run_outcome(ctx.run(&mut processor))
    }
}
