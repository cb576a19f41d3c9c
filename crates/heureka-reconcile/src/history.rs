use std::collections::BTreeMap;

use heureka_core::{Generations, ReconcileOperation, comparable_generations};
use heureka_store::{ReconcileStore, SnapshotStore, StoreError};

/// Tags whose history holds at least two completed runs, with the two newest.
pub fn comparable_tags<S: SnapshotStore + ?Sized>(
    store: &S,
) -> Result<BTreeMap<String, Generations>, StoreError> {
    let runs = store.list_completed_runs_by_tag_descending()?;
    Ok(comparable_generations(&runs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagWindow {
    Ready(Generations),
    /// Fewer than two completed runs are visible inside the transaction.
    Insufficient,
    /// The newest pair was already reconciled by an earlier call.
    AlreadyProcessed(Generations),
}

/// Re-reads the two newest runs of `tag` inside the tag's transaction and
/// compares them with the last checkpoint of `operation`.
pub(crate) fn open_window<S: ReconcileStore + ?Sized>(
    store: &S,
    operation: ReconcileOperation,
    tag: &str,
) -> Result<TagWindow, StoreError> {
    let Some(generations) = store.latest_generations(tag)? else {
        return Ok(TagWindow::Insufficient);
    };

    if store.checkpoint(operation, tag)? == Some(generations) {
        return Ok(TagWindow::AlreadyProcessed(generations));
    }
    Ok(TagWindow::Ready(generations))
}
