use heureka_core::{Generations, RunId, UserId, disappeared, unique_patch_candidates};
use heureka_store::{ErrorClass, ReconcileStore, StoreError};
use serde::Serialize;

use crate::cascade::{CascadeReport, retire_instances};
use crate::TagReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutopatchTagReport {
    pub tag: String,
    pub latest_run_id: RunId,
    pub second_latest_run_id: RunId,
    pub disappeared_instances: usize,
    /// Disappeared instances whose service or version could not be resolved.
    pub unresolved_instances: usize,
    pub patches_created: usize,
    /// Pairs still backed by a live instance.
    pub patches_skipped_live: usize,
    pub patches_already_recorded: usize,
    pub cascade: CascadeReport,
}

impl TagReport for AutopatchTagReport {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn changed(&self) -> bool {
        self.disappeared_instances > 0
    }
}

/// Retires the instances that vanished between the two newest runs of `tag`
/// and records a patch for every (service, version) pair left without a live
/// instance.
pub(crate) fn autopatch_tag<S: ReconcileStore + ?Sized>(
    store: &S,
    tag: &str,
    generations: Generations,
    actor: UserId,
) -> Result<AutopatchTagReport, StoreError> {
    let mut report = AutopatchTagReport {
        tag: tag.to_owned(),
        latest_run_id: generations.latest,
        second_latest_run_id: generations.second_latest,
        disappeared_instances: 0,
        unresolved_instances: 0,
        patches_created: 0,
        patches_skipped_live: 0,
        patches_already_recorded: 0,
        cascade: CascadeReport::default(),
    };

    let previous = store.tracked_instance_ids(generations.second_latest)?;
    let current = store.tracked_instance_ids(generations.latest)?;
    let gone = disappeared(&previous, &current);
    report.disappeared_instances = gone.len();
    if gone.is_empty() {
        return Ok(report);
    }

    let mut candidates = Vec::with_capacity(gone.len());
    for &instance_id in &gone {
        store.check_deadline()?;
        match store.resolve_service_and_version(instance_id) {
            Ok(candidate) => candidates.push(candidate),
            Err(err) if err.class() == ErrorClass::NotFound => {
                tracing::warn!(
                    tag,
                    instance_id,
                    error = %err,
                    "skipping patch for instance without live service or version"
                );
                report.unresolved_instances += 1;
            }
            Err(err) => return Err(err),
        }
    }
    let candidates = unique_patch_candidates(candidates);

    // The vanished instances still count as live until the cascade has run.
    report.cascade = retire_instances(store, &gone, actor)?;

    for candidate in &candidates {
        store.check_deadline()?;
        match store.insert_patch_if_no_live_instance(candidate, generations.latest) {
            Ok(true) => report.patches_created += 1,
            Ok(false) => {
                tracing::debug!(
                    tag,
                    service_id = candidate.service_id,
                    component_version_id = candidate.component_version_id,
                    "pair still has a live instance, no patch recorded"
                );
                report.patches_skipped_live += 1;
            }
            Err(err)
                if err.class() == ErrorClass::ConstraintViolation
                    && store.patch_exists(candidate.pair(), generations.latest)? =>
            {
                report.patches_already_recorded += 1;
            }
            Err(err) => return Err(err),
        }
    }

    tracing::debug!(
        tag,
        disappeared = report.disappeared_instances,
        patches = report.patches_created,
        skipped_live = report.patches_skipped_live,
        unresolved = report.unresolved_instances,
        "autopatch processed tag"
    );
    Ok(report)
}
