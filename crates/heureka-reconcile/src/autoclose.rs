use heureka_core::{Generations, RunId, UserId, disappeared};
use heureka_store::{ReconcileStore, StoreError};
use serde::Serialize;

use crate::TagReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutocloseTagReport {
    pub tag: String,
    pub latest_run_id: RunId,
    pub second_latest_run_id: RunId,
    pub missing_issues: usize,
    pub issue_matches_mitigated: usize,
}

impl TagReport for AutocloseTagReport {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn changed(&self) -> bool {
        self.missing_issues > 0
    }
}

/// Mitigates the matches of every issue the newest run of `tag` stopped
/// reporting.
pub(crate) fn autoclose_tag<S: ReconcileStore + ?Sized>(
    store: &S,
    tag: &str,
    generations: Generations,
    actor: UserId,
) -> Result<AutocloseTagReport, StoreError> {
    let previous = store.tracked_issue_ids(generations.second_latest)?;
    let current = store.tracked_issue_ids(generations.latest)?;
    let missing = disappeared(&previous, &current);

    let mitigated = if missing.is_empty() {
        0
    } else {
        store.bulk_mitigate_issue_matches(&missing, actor)?
    };

    tracing::debug!(
        tag,
        missing = missing.len(),
        mitigated,
        "autoclose processed tag"
    );
    Ok(AutocloseTagReport {
        tag: tag.to_owned(),
        latest_run_id: generations.latest,
        second_latest_run_id: generations.second_latest,
        missing_issues: missing.len(),
        issue_matches_mitigated: mitigated,
    })
}
