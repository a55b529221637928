//! Remove a study folder and its catalogue row.

use crate::core::command::{CommandProcessor, DeleteDirectoryCommand, DeleteEntityCommand, Rollback};
use crate::core::item_processor::{Admission, ItemContext, ItemFailure, ItemProcessor, ProcessResult};
use crate::core::work_item::{WorkItemType, WorkQueueItem};
use crate::infra::persistence::StudyStorage;

use super::{load_storage, not_initialized, run_outcome};

/// Handler for `DeleteStudy` items.
#[derive(Debug, Default)]
pub struct DeleteStudyProcessor {
    storage: Option<StudyStorage>,
}

impl ItemProcessor for DeleteStudyProcessor {
    fn initialize(&mut self, ctx: &mut ItemContext<'_>) -> Result<(), ItemFailure> {
        self.storage = Some(load_storage(ctx)?);
        Ok(())
    }

    /// Waits for pending StudyProcess work on the same study to drain.
    fn can_start(&mut self, ctx: &mut ItemContext<'_>) -> Admission {
        let own = ctx.item.key;
        let resource = ctx.item.resource_key.clone();
        let busy = ctx.services.queue.list(&|other: &WorkQueueItem| {
            other.key != own
                && other.resource_key == resource
                && other.item_type == WorkItemType::StudyProcess
                && other.status.is_active()
        });
        match busy {
            Ok(items) if items.is_empty() => Admission::Go,
            Ok(items) => Admission::postpone(format!("{} StudyProcess item(s) still active for {resource}", items.len())),
            Err(e) => Admission::postpone(format!("cannot inspect work queue: {e}")),
        }
    }

    fn process_item(&mut self, ctx: &mut ItemContext<'_>) -> Result<ProcessResult, ItemFailure> {
        let Some(storage) = &self.storage else {
            return Err(not_initialized(ctx));
        };

        let mut processor = CommandProcessor::new(
            format!("delete-study {}", storage.key),
            ctx.services.processor_context("delete-study"),
        )
        .with_cancellation(ctx.cancel.clone());
        processor.add_command(DeleteDirectoryCommand::new(&storage.study_path, Rollback::Required));
        processor.add_command(DeleteEntityCommand::new(StudyStorage::TABLE, storage.key.clone()));
        run_outcome(ctx.run(&mut processor))
    }
}
