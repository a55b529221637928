//! Built-in item processors, one per [`WorkItemType`].
//!
//! Every processor loads the study's catalogue row in `initialize` and does its
//! filesystem and catalogue work through a [`CommandProcessor`](crate::core::command::CommandProcessor),
//! so a failed pass leaves the study as it found it.

pub mod auto_route;
pub mod delete_study;
pub mod study_process;
pub mod tier_migrate;

use serde::de::DeserializeOwned;

use crate::core::item_processor::{ItemContext, ItemFailure, ProcessResult, ProcessorRegistry};
use crate::core::work_item::WorkItemType;
use crate::infra::persistence::StudyStorage;

pub use auto_route::{AutoRouteData, AutoRouteProcessor};
pub use delete_study::DeleteStudyProcessor;
pub use study_process::{StudyProcessData, StudyProcessProcessor};
pub use tier_migrate::{TierMigrateData, TierMigrateProcessor};

/// Register a processor for every built-in item type.
pub fn register_default_processors(registry: &mut ProcessorRegistry) {
    registry.register(WorkItemType::StudyProcess, StudyProcessProcessor::default);
    registry.register(WorkItemType::AutoRoute, AutoRouteProcessor::default);
    registry.register(WorkItemType::DeleteStudy, DeleteStudyProcessor::default);
    registry.register(WorkItemType::TierMigrate, TierMigrateProcessor::default);
}

fn load_storage(ctx: &ItemContext<'_>) -> Result<StudyStorage, ItemFailure> {
    Ok(StudyStorage::load(ctx.services.catalogue.as_ref(), ctx.item.resource_key.as_str())?)
}

fn payload<T: DeserializeOwned>(ctx: &ItemContext<'_>) -> Result<T, ItemFailure> {
    serde_json::from_value(ctx.item.data.clone())
        .map_err(|e| ItemFailure::fatal(format!("invalid {} payload: {e}", ctx.item.item_type)))
}

fn not_initialized(ctx: &ItemContext<'_>) -> ItemFailure {
    ItemFailure::fatal(format!("{} processed before initialize", ctx.item.item_type))
}

/// Map a single-shot command run onto a result.
fn run_outcome(ran: Result<bool, ItemFailure>) -> Result<ProcessResult, ItemFailure> {
    match ran? {
        true => Ok(ProcessResult::Complete),
        false => Ok(ProcessResult::Cancelled),
    }
}
