//! Forward a study's instances to a remote destination.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::item_processor::{Admission, ItemContext, ItemFailure, ItemProcessor, ProcessResult};
use crate::core::work_item::WorkItemUnit;
use crate::infra::persistence::StudyStorage;
use crate::infra::transport::{TransportError, UnitStatus};

use super::{load_storage, not_initialized, payload};

/// `data` of an AutoRoute item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRouteData {
    /// Destination id known to the transport.
    pub destination: String,
}

/// Handler for `AutoRoute` items.
#[derive(Debug, Default)]
pub struct AutoRouteProcessor {
    storage: Option<StudyStorage>,
    data: Option<AutoRouteData>,
}

impl ItemProcessor for AutoRouteProcessor {
    fn initialize(&mut self, ctx: &mut ItemContext<'_>) -> Result<(), ItemFailure> {
        self.storage = Some(load_storage(ctx)?);
        self.data = Some(payload(ctx)?);
        Ok(())
    }

    fn can_start(&mut self, ctx: &mut ItemContext<'_>) -> Admission {
        let Some(data) = &self.data else {
            return Admission::Go;
        };
        let destination = data.destination.as_str();
        let throttle = &ctx.services.config.throttle;
        let delay = Some(Duration::from_secs(throttle.postpone_secs));

        if ctx.services.throttle.is_blacked_out(destination) {
            return Admission::Postpone {
                reason: format!("destination {destination} is blacked out"),
                delay,
            };
        }

        let active = ctx.services.connections.active_connections(destination);
        if active >= throttle.max_connections_per_destination {
            ctx.services
                .throttle
                .block(destination, Duration::from_secs(throttle.blackout_secs));
            info!(destination, active, "destination at connection limit, blacking out");
            return Admission::Postpone {
                reason: format!("destination {destination} has {active} active associations"),
                delay,
            };
        }
        Admission::Go
    }

    fn process_item(&mut self, ctx: &mut ItemContext<'_>) -> Result<ProcessResult, ItemFailure> {
        let (Some(storage), Some(data)) = (&self.storage, &self.data) else {
            return Err(not_initialized(ctx));
        };

        let units = ctx.item.batch(ctx.properties.max_batch_size);
        if units.is_empty() {
            return Ok(ProcessResult::Idle);
        }

        let mut results: Vec<(String, UnitStatus)> = Vec::with_capacity(units.len());
        let summary = ctx
            .services
            .transport
            .send(
                &data.destination,
                &storage.study_path,
                &units,
                ctx.cancel,
                &mut |unit: &WorkItemUnit, status: &UnitStatus| results.push((unit.uid.clone(), status.clone())),
            )
            .map_err(|e| match e {
                TransportError::UnknownDestination(_) => ItemFailure::fatal(e.to_string()),
                TransportError::Unreachable { .. } => ItemFailure::non_fatal(e.to_string()),
            })?;

        for (uid, status) in results {
            match status {
                UnitStatus::Sent => ctx.item.complete_unit(&uid),
                UnitStatus::Failed(_) => {
                    ctx.item.fail_unit(&uid, ctx.properties.max_unit_failures);
                }
            }
        }
        debug!(
            item = %ctx.item.key,
            destination = %data.destination,
            sent = summary.sent.len(),
            failed = summary.failed.len(),
            "transfer finished"
        );

        if summary.cancelled {
            return Ok(ProcessResult::Cancelled);
        }
        if summary.sent.is_empty() && !summary.failed.is_empty() {
            let (uid, reason) = &summary.failed[0];
            return Err(ItemFailure::fatal(format!(
                "every unit failed to reach {}, first {uid}: {reason}",
                data.destination
            )));
        }
        if ctx.item.remaining_units().next().is_some() {
            Ok(ProcessResult::Pending)
        } else {
            Ok(ProcessResult::Idle)
        }
    }
}
