use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use heureka_config::DatabaseConfig;
use heureka_core::{
    ComponentId, ComponentInstanceId, ComponentVersionId, Generations, IssueId, IssueMatchId,
    IssueMatchStatus, PatchCandidate, ReconcileOperation, RunId, ServiceId, ServiceVersionPair,
    UserId,
};
use rusqlite::{Connection, ErrorCode};
use serde::Serialize;
use thiserror::Error;

mod inventory;
mod reconcile_tx;
mod scanner_run;
mod schema;
mod snapshot;

pub use inventory::PatchFilter;
pub use reconcile_tx::ReconcileTx;
pub use schema::run_migrations;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannerRunRecord {
    pub run_id: RunId,
    pub uuid: String,
    pub tag: String,
    pub start_run: i64,
    pub end_run: Option<i64>,
    pub is_completed: bool,
    pub failed_message: Option<String>,
    pub deleted_at: Option<i64>,
}

impl ScannerRunRecord {
    pub fn is_open(&self) -> bool {
        !self.is_completed && self.failed_message.is_none() && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentRecord {
    pub id: ComponentId,
    pub ccrn: String,
    pub component_type: String,
    pub deleted_at: Option<i64>,
    pub updated_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentVersionRecord {
    pub id: ComponentVersionId,
    pub component_id: ComponentId,
    pub version: String,
    pub deleted_at: Option<i64>,
    pub updated_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentInstanceRecord {
    pub id: ComponentInstanceId,
    pub ccrn: String,
    pub service_id: ServiceId,
    pub component_version_id: ComponentVersionId,
    pub deleted_at: Option<i64>,
    pub updated_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueMatchRecord {
    pub id: IssueMatchId,
    pub issue_id: IssueId,
    pub component_instance_id: ComponentInstanceId,
    pub status: IssueMatchStatus,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub updated_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchRecord {
    pub id: i64,
    pub service_id: ServiceId,
    pub service_name: String,
    pub component_version_id: ComponentVersionId,
    pub component_version_name: String,
    pub detected_in_run_id: RunId,
    pub created_at: i64,
}

/// Version and component an instance belongs to, whether or not any of them
/// is soft-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionLineage {
    pub component_version_id: ComponentVersionId,
    pub component_id: ComponentId,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("deadline exceeded while a statement was running")]
    DeadlineExceeded,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
            Self::DeadlineExceeded
        } else {
            Self::Sqlite(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Query,
    NotFound,
    ConstraintViolation,
    Conflict,
    DeadlineExceeded,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Query => "query",
            Self::NotFound => "not_found",
            Self::ConstraintViolation => "constraint_violation",
            Self::Conflict => "conflict",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::DeadlineExceeded)
    }
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) => ErrorClass::Transient,
            Self::Sqlite(err) => match err.sqlite_error_code() {
                Some(
                    ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
                    | ErrorCode::DiskFull
                    | ErrorCode::OutOfMemory,
                ) => ErrorClass::Transient,
                Some(ErrorCode::ConstraintViolation) => ErrorClass::ConstraintViolation,
                Some(ErrorCode::OperationInterrupted) => ErrorClass::DeadlineExceeded,
                _ => ErrorClass::Query,
            },
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::DeadlineExceeded => ErrorClass::DeadlineExceeded,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

/// Read side of the scanner-run snapshots.
pub trait SnapshotStore {
    /// Completed, non-deleted runs grouped by tag, each list newest first.
    fn list_completed_runs_by_tag_descending(
        &self,
    ) -> Result<BTreeMap<String, Vec<RunId>>, StoreError>;
    fn latest_generations(&self, tag: &str) -> Result<Option<Generations>, StoreError>;
    fn tracked_instance_ids(
        &self,
        run_id: RunId,
    ) -> Result<BTreeSet<ComponentInstanceId>, StoreError>;
    fn tracked_issue_ids(&self, run_id: RunId) -> Result<BTreeSet<IssueId>, StoreError>;
}

/// Everything one reconciliation pass reads and writes for a single tag.
pub trait ReconcileStore: SnapshotStore {
    /// Fails with `DeadlineExceeded` once the pass has run out of time.
    fn check_deadline(&self) -> Result<(), StoreError> {
        Ok(())
    }
    /// Fails with `NotFound` when the instance, its service or its version is
    /// soft-deleted.
    fn resolve_service_and_version(
        &self,
        instance_id: ComponentInstanceId,
    ) -> Result<PatchCandidate, StoreError>;
    /// Inserts only while no live instance backs the pair. Returns whether a
    /// row was written.
    fn insert_patch_if_no_live_instance(
        &self,
        candidate: &PatchCandidate,
        detected_in_run_id: RunId,
    ) -> Result<bool, StoreError>;
    fn patch_exists(
        &self,
        pair: ServiceVersionPair,
        detected_in_run_id: RunId,
    ) -> Result<bool, StoreError>;
    fn issue_match_ids_for_instance(
        &self,
        instance_id: ComponentInstanceId,
    ) -> Result<Vec<IssueMatchId>, StoreError>;
    fn soft_delete_issue_match(&self, id: IssueMatchId, actor: UserId) -> Result<bool, StoreError>;
    fn soft_delete_component_instance(
        &self,
        id: ComponentInstanceId,
        actor: UserId,
    ) -> Result<bool, StoreError>;
    fn version_lineage(
        &self,
        instance_id: ComponentInstanceId,
    ) -> Result<Option<VersionLineage>, StoreError>;
    /// Soft-deletes the version and drops its issue links once no live
    /// instance uses it.
    fn retire_version_if_orphaned(
        &self,
        version_id: ComponentVersionId,
        actor: UserId,
    ) -> Result<bool, StoreError>;
    fn retire_component_if_orphaned(
        &self,
        component_id: ComponentId,
        actor: UserId,
    ) -> Result<bool, StoreError>;
    /// Moves every live, not yet mitigated match of the given issues to
    /// `mitigated`. Returns the number of matches changed.
    fn bulk_mitigate_issue_matches(
        &self,
        issue_ids: &[IssueId],
        actor: UserId,
    ) -> Result<usize, StoreError>;
    fn checkpoint(
        &self,
        operation: ReconcileOperation,
        tag: &str,
    ) -> Result<Option<Generations>, StoreError>;
    fn record_checkpoint(
        &self,
        operation: ReconcileOperation,
        tag: &str,
        generations: Generations,
    ) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
    sqlite_path: PathBuf,
}

impl SqliteStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(workspace_root, &DatabaseConfig::default())
    }

    pub fn open_with_config(
        workspace_root: impl AsRef<Path>,
        config: &DatabaseConfig,
    ) -> Result<Self, StoreError> {
        let sqlite_path = config.resolve_path(workspace_root);
        if let Some(parent) = sqlite_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(config.busy_timeout())?;
        run_migrations(&conn)?;

        tracing::debug!(path = %sqlite_path.display(), "opened heureka store");
        Ok(Self { conn, sqlite_path })
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StoreError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }
}

impl SnapshotStore for SqliteStore {
    fn list_completed_runs_by_tag_descending(
        &self,
    ) -> Result<BTreeMap<String, Vec<RunId>>, StoreError> {
        snapshot::completed_runs_by_tag(&self.conn)
    }

    fn latest_generations(&self, tag: &str) -> Result<Option<Generations>, StoreError> {
        snapshot::latest_generations(&self.conn, tag)
    }

    fn tracked_instance_ids(
        &self,
        run_id: RunId,
    ) -> Result<BTreeSet<ComponentInstanceId>, StoreError> {
        snapshot::tracked_instance_ids(&self.conn, run_id)
    }

    fn tracked_issue_ids(&self, run_id: RunId) -> Result<BTreeSet<IssueId>, StoreError> {
        snapshot::tracked_issue_ids(&self.conn, run_id)
    }
}
