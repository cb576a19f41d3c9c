use heureka_core::{
    ComponentId, ComponentInstanceId, ComponentVersionId, IssueId, IssueMatchId, IssueMatchStatus,
    RunId, ServiceId, UserId, now_millis,
};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

use crate::{
    ComponentInstanceRecord, ComponentRecord, ComponentVersionRecord, IssueMatchRecord,
    PatchRecord, SqliteStore, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PatchFilter {
    pub service_id: Option<ServiceId>,
    pub component_version_id: Option<ComponentVersionId>,
    pub detected_in_run_id: Option<RunId>,
}

fn map_component(row: &Row<'_>) -> rusqlite::Result<ComponentRecord> {
    Ok(ComponentRecord {
        id: row.get(0)?,
        ccrn: row.get(1)?,
        component_type: row.get(2)?,
        deleted_at: row.get(3)?,
        updated_by: row.get(4)?,
    })
}

fn map_component_version(row: &Row<'_>) -> rusqlite::Result<ComponentVersionRecord> {
    Ok(ComponentVersionRecord {
        id: row.get(0)?,
        component_id: row.get(1)?,
        version: row.get(2)?,
        deleted_at: row.get(3)?,
        updated_by: row.get(4)?,
    })
}

fn map_component_instance(row: &Row<'_>) -> rusqlite::Result<ComponentInstanceRecord> {
    Ok(ComponentInstanceRecord {
        id: row.get(0)?,
        ccrn: row.get(1)?,
        service_id: row.get(2)?,
        component_version_id: row.get(3)?,
        deleted_at: row.get(4)?,
        updated_by: row.get(5)?,
    })
}

fn map_issue_match(row: &Row<'_>) -> rusqlite::Result<IssueMatchRecord> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<IssueMatchStatus>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;

    Ok(IssueMatchRecord {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        component_instance_id: row.get(2)?,
        status,
        updated_at: row.get(4)?,
        deleted_at: row.get(5)?,
        updated_by: row.get(6)?,
    })
}

fn map_patch(row: &Row<'_>) -> rusqlite::Result<PatchRecord> {
    Ok(PatchRecord {
        id: row.get(0)?,
        service_id: row.get(1)?,
        service_name: row.get(2)?,
        component_version_id: row.get(3)?,
        component_version_name: row.get(4)?,
        detected_in_run_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl SqliteStore {
    pub fn create_service(&self, ccrn: &str) -> Result<ServiceId, StoreError> {
        self.conn.execute(
            "INSERT INTO services (ccrn, created_at) VALUES (?1, ?2)",
            params![ccrn, now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Soft-deletes the service. Its instances stay live but can no longer be
    /// resolved into patches.
    pub fn delete_service(&self, id: ServiceId, actor: UserId) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE services SET deleted_at = ?2, updated_by = ?3 \
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id, now_millis(), actor],
        )?;
        Ok(changed > 0)
    }

    pub fn create_component(
        &self,
        ccrn: &str,
        component_type: &str,
    ) -> Result<ComponentId, StoreError> {
        self.conn.execute(
            "INSERT INTO components (ccrn, component_type, created_at) VALUES (?1, ?2, ?3)",
            params![ccrn, component_type, now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn component(&self, id: ComponentId) -> Result<Option<ComponentRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, ccrn, component_type, deleted_at, updated_by \
                 FROM components WHERE id = ?1",
                params![id],
                map_component,
            )
            .optional()?;
        Ok(record)
    }

    pub fn create_component_version(
        &self,
        component_id: ComponentId,
        version: &str,
    ) -> Result<ComponentVersionId, StoreError> {
        self.conn.execute(
            "INSERT INTO component_versions (component_id, version, created_at) \
             VALUES (?1, ?2, ?3)",
            params![component_id, version, now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn component_version(
        &self,
        id: ComponentVersionId,
    ) -> Result<Option<ComponentVersionRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, component_id, version, deleted_at, updated_by \
                 FROM component_versions WHERE id = ?1",
                params![id],
                map_component_version,
            )
            .optional()?;
        Ok(record)
    }

    pub fn create_component_instance(
        &self,
        ccrn: &str,
        service_id: ServiceId,
        component_version_id: ComponentVersionId,
    ) -> Result<ComponentInstanceId, StoreError> {
        self.conn.execute(
            "INSERT INTO component_instances (ccrn, service_id, component_version_id, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![ccrn, service_id, component_version_id, now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn component_instance(
        &self,
        id: ComponentInstanceId,
    ) -> Result<Option<ComponentInstanceRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, ccrn, service_id, component_version_id, deleted_at, updated_by \
                 FROM component_instances WHERE id = ?1",
                params![id],
                map_component_instance,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_active_component_instances(
        &self,
    ) -> Result<Vec<ComponentInstanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ccrn, service_id, component_version_id, deleted_at, updated_by \
             FROM component_instances WHERE deleted_at IS NULL ORDER BY id ASC",
        )?;
        let records = stmt
            .query_map([], map_component_instance)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn create_issue(&self, primary_name: &str) -> Result<IssueId, StoreError> {
        self.conn.execute(
            "INSERT INTO issues (primary_name, issue_type, created_at) \
             VALUES (?1, 'Vulnerability', ?2)",
            params![primary_name, now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_issue_to_component_version(
        &self,
        component_version_id: ComponentVersionId,
        issue_id: IssueId,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO component_version_issues (component_version_id, issue_id) \
             VALUES (?1, ?2)",
            params![component_version_id, issue_id],
        )?;
        Ok(changed > 0)
    }

    pub fn component_version_issue_ids(
        &self,
        component_version_id: ComponentVersionId,
    ) -> Result<Vec<IssueId>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id FROM component_version_issues \
             WHERE component_version_id = ?1 ORDER BY issue_id ASC",
        )?;
        let ids = stmt
            .query_map(params![component_version_id], |row| row.get::<_, IssueId>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn create_issue_match(
        &self,
        issue_id: IssueId,
        component_instance_id: ComponentInstanceId,
        status: IssueMatchStatus,
    ) -> Result<IssueMatchId, StoreError> {
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO issue_matches \
             (issue_id, component_instance_id, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![issue_id, component_instance_id, status.as_str(), now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn issue_match(&self, id: IssueMatchId) -> Result<Option<IssueMatchRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, issue_id, component_instance_id, status, updated_at, deleted_at, \
                 updated_by FROM issue_matches WHERE id = ?1",
                params![id],
                map_issue_match,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_patches(&self, filter: &PatchFilter) -> Result<Vec<PatchRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, service_id, service_name, component_version_id, component_version_name, \
             detected_in_run_id, created_at FROM patches \
             WHERE (?1 IS NULL OR service_id = ?1) \
             AND (?2 IS NULL OR component_version_id = ?2) \
             AND (?3 IS NULL OR detected_in_run_id = ?3) \
             ORDER BY id ASC",
        )?;
        let records = stmt
            .query_map(
                params![
                    filter.service_id,
                    filter.component_version_id,
                    filter.detected_in_run_id
                ],
                map_patch,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
