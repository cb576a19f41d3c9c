use std::collections::{BTreeMap, BTreeSet};

use heureka_core::{ComponentInstanceId, Generations, IssueId, RunId};
use rusqlite::{Connection, params};

use crate::StoreError;

const COMPLETED_RUNS_SQL: &str = "SELECT tag, run_id FROM scanner_runs \
     WHERE is_completed = 1 AND deleted_at IS NULL \
     ORDER BY tag ASC, run_id DESC";

pub(crate) fn completed_runs_by_tag(
    conn: &Connection,
) -> Result<BTreeMap<String, Vec<RunId>>, StoreError> {
    let mut stmt = conn.prepare(COMPLETED_RUNS_SQL)?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, RunId>(1)?))
    })?;

    let mut by_tag: BTreeMap<String, Vec<RunId>> = BTreeMap::new();
    for row in rows {
        let (tag, run_id) = row?;
        by_tag.entry(tag).or_default().push(run_id);
    }
    Ok(by_tag)
}

pub(crate) fn latest_generations(
    conn: &Connection,
    tag: &str,
) -> Result<Option<Generations>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT run_id FROM scanner_runs \
         WHERE tag = ?1 AND is_completed = 1 AND deleted_at IS NULL \
         ORDER BY run_id DESC LIMIT 2",
    )?;
    let runs = stmt
        .query_map(params![tag], |row| row.get::<_, RunId>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Generations::from_newest_first(&runs))
}

pub(crate) fn tracked_instance_ids(
    conn: &Connection,
    run_id: RunId,
) -> Result<BTreeSet<ComponentInstanceId>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT component_instance_id FROM scanner_run_instances WHERE run_id = ?1",
    )?;
    let ids = stmt
        .query_map(params![run_id], |row| row.get::<_, ComponentInstanceId>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

pub(crate) fn tracked_issue_ids(
    conn: &Connection,
    run_id: RunId,
) -> Result<BTreeSet<IssueId>, StoreError> {
    let mut stmt = conn.prepare("SELECT issue_id FROM scanner_run_issues WHERE run_id = ?1")?;
    let ids = stmt
        .query_map(params![run_id], |row| row.get::<_, IssueId>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}
