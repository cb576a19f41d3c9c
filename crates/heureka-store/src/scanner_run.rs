use heureka_core::{ComponentInstanceId, IssueId, now_millis};
use rusqlite::{ErrorCode, OptionalExtension, Row, params};

use crate::{ScannerRunRecord, SqliteStore, StoreError};

const SCANNER_RUN_COLUMNS: &str =
    "run_id, uuid, tag, start_run, end_run, is_completed, failed_message, deleted_at";

fn map_scanner_run(row: &Row<'_>) -> rusqlite::Result<ScannerRunRecord> {
    Ok(ScannerRunRecord {
        run_id: row.get(0)?,
        uuid: row.get(1)?,
        tag: row.get(2)?,
        start_run: row.get(3)?,
        end_run: row.get(4)?,
        is_completed: row.get::<_, i64>(5)? != 0,
        failed_message: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

impl SqliteStore {
    /// Opens a new run. Run ids are assigned in creation order, which is the
    /// order generations are derived from.
    pub fn create_scanner_run(
        &self,
        uuid: &str,
        tag: &str,
        start_run: i64,
    ) -> Result<ScannerRunRecord, StoreError> {
        let inserted = self.conn.execute(
            "INSERT INTO scanner_runs (uuid, tag, start_run) VALUES (?1, ?2, ?3)",
            params![uuid, tag, start_run],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                return Err(StoreError::Conflict(format!(
                    "scanner run {uuid} already exists"
                )));
            }
            Err(err) => return Err(err.into()),
        }

        let record = self.require_scanner_run(uuid)?;
        tracing::debug!(run_id = record.run_id, uuid, tag, "created scanner run");
        Ok(record)
    }

    pub fn scanner_run_by_uuid(&self, uuid: &str) -> Result<Option<ScannerRunRecord>, StoreError> {
        let sql = format!("SELECT {SCANNER_RUN_COLUMNS} FROM scanner_runs WHERE uuid = ?1");
        let record = self
            .conn
            .query_row(&sql, params![uuid], map_scanner_run)
            .optional()?;
        Ok(record)
    }

    /// Records that the run observed the instance. Returns `false` when it was
    /// already tracked.
    pub fn track_component_instance(
        &self,
        uuid: &str,
        instance_id: ComponentInstanceId,
    ) -> Result<bool, StoreError> {
        let run = self.require_open_scanner_run(uuid)?;
        if self.component_instance(instance_id)?.is_none() {
            return Err(StoreError::not_found("component instance", instance_id));
        }

        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO scanner_run_instances (run_id, component_instance_id) \
             VALUES (?1, ?2)",
            params![run.run_id, instance_id],
        )?;
        Ok(changed > 0)
    }

    pub fn track_issue(&self, uuid: &str, issue_id: IssueId) -> Result<bool, StoreError> {
        let run = self.require_open_scanner_run(uuid)?;
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM issues WHERE id = ?1",
                params![issue_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::not_found("issue", issue_id));
        }

        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO scanner_run_issues (run_id, issue_id) VALUES (?1, ?2)",
            params![run.run_id, issue_id],
        )?;
        Ok(changed > 0)
    }

    /// Flips the run to completed. A run completes at most once and never
    /// after it failed.
    pub fn complete_scanner_run(&self, uuid: &str) -> Result<ScannerRunRecord, StoreError> {
        let run = self.require_open_scanner_run(uuid)?;
        self.conn.execute(
            "UPDATE scanner_runs SET is_completed = 1, end_run = ?2 \
             WHERE run_id = ?1 AND is_completed = 0",
            params![run.run_id, now_millis()],
        )?;

        let record = self.require_scanner_run(uuid)?;
        tracing::info!(run_id = record.run_id, uuid, tag = %record.tag, "scanner run completed");
        Ok(record)
    }

    pub fn fail_scanner_run(
        &self,
        uuid: &str,
        message: &str,
    ) -> Result<ScannerRunRecord, StoreError> {
        let run = self.require_open_scanner_run(uuid)?;
        self.conn.execute(
            "UPDATE scanner_runs SET failed_message = ?2, end_run = ?3 WHERE run_id = ?1",
            params![run.run_id, message, now_millis()],
        )?;

        let record = self.require_scanner_run(uuid)?;
        tracing::warn!(run_id = record.run_id, uuid, message, "scanner run failed");
        Ok(record)
    }

    /// Soft-deletes the run so it no longer counts as a generation.
    pub fn delete_scanner_run(&self, uuid: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE scanner_runs SET deleted_at = ?2 WHERE uuid = ?1 AND deleted_at IS NULL",
            params![uuid, now_millis()],
        )?;
        if changed == 0 && self.scanner_run_by_uuid(uuid)?.is_none() {
            return Err(StoreError::not_found("scanner run", uuid));
        }
        Ok(changed > 0)
    }

    pub fn scanner_run_tags(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT tag FROM scanner_runs WHERE deleted_at IS NULL ORDER BY tag ASC",
        )?;
        let tags = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    fn require_scanner_run(&self, uuid: &str) -> Result<ScannerRunRecord, StoreError> {
        self.scanner_run_by_uuid(uuid)?
            .ok_or_else(|| StoreError::not_found("scanner run", uuid))
    }

    fn require_open_scanner_run(&self, uuid: &str) -> Result<ScannerRunRecord, StoreError> {
        let run = self.require_scanner_run(uuid)?;
        if run.is_open() {
            return Ok(run);
        }

        let state = if run.deleted_at.is_some() {
            "deleted"
        } else if run.is_completed {
            "completed"
        } else {
            "failed"
        };
        Err(StoreError::Conflict(format!(
            "scanner run {uuid} is already {state}"
        )))
    }
}
