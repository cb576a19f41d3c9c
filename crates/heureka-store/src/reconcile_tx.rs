use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use heureka_core::{
    ComponentId, ComponentInstanceId, ComponentVersionId, Generations, IssueId, IssueMatchId,
    IssueMatchStatus, PatchCandidate, ReconcileOperation, RunId, ServiceVersionPair, UserId,
    now_millis,
};
use rusqlite::{
    Connection, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter,
};

use crate::{
    ReconcileStore, SnapshotStore, SqliteStore, StoreError, VersionLineage, snapshot,
};

/// Virtual machine instructions between two deadline checks.
const PROGRESS_INTERVAL_OPS: i32 = 1_000;
/// Upper bound on bound parameters per mitigation statement.
const MITIGATE_CHUNK_SIZE: usize = 500;

/// Clears the progress handler when dropped so the rollback that follows is
/// never interrupted.
struct DeadlineGuard<'conn> {
    conn: &'conn Connection,
    armed: bool,
}

impl<'conn> DeadlineGuard<'conn> {
    fn install(conn: &'conn Connection, deadline: Option<Instant>) -> Self {
        if let Some(deadline) = deadline {
            conn.progress_handler(
                PROGRESS_INTERVAL_OPS,
                Some(move || Instant::now() >= deadline),
            );
        }
        Self {
            conn,
            armed: deadline.is_some(),
        }
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.progress_handler(0, None::<fn() -> bool>);
        }
    }
}

/// Write transaction covering one tag of one reconciliation pass. Rolls back
/// on drop unless [`ReconcileTx::commit`] is called.
pub struct ReconcileTx<'conn> {
    deadline: Option<Instant>,
    // Declared before `tx`: the handler must be gone before the rollback runs.
    guard: DeadlineGuard<'conn>,
    tx: Transaction<'conn>,
}

impl SqliteStore {
    /// Takes the database write lock up front (`BEGIN IMMEDIATE`), waiting at
    /// most the configured busy timeout.
    pub fn begin_reconcile(&self, deadline: Option<Instant>) -> Result<ReconcileTx<'_>, StoreError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let guard = DeadlineGuard::install(&self.conn, deadline);
        Ok(ReconcileTx {
            deadline,
            guard,
            tx,
        })
    }
}

impl ReconcileTx<'_> {
    pub fn commit(self) -> Result<(), StoreError> {
        let Self { guard, tx, .. } = self;
        drop(guard);
        tx.commit()?;
        Ok(())
    }

    fn conn(&self) -> &Connection {
        &self.tx
    }

    fn has_live_instance_for_version(
        &self,
        version_id: ComponentVersionId,
    ) -> Result<bool, StoreError> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM component_instances \
             WHERE component_version_id = ?1 AND deleted_at IS NULL)",
            params![version_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn has_live_version_for_component(&self, component_id: ComponentId) -> Result<bool, StoreError> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM component_versions \
             WHERE component_id = ?1 AND deleted_at IS NULL)",
            params![component_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

impl SnapshotStore for ReconcileTx<'_> {
    fn list_completed_runs_by_tag_descending(
        &self,
    ) -> Result<BTreeMap<String, Vec<RunId>>, StoreError> {
        snapshot::completed_runs_by_tag(self.conn())
    }

    fn latest_generations(&self, tag: &str) -> Result<Option<Generations>, StoreError> {
        snapshot::latest_generations(self.conn(), tag)
    }

    fn tracked_instance_ids(
        &self,
        run_id: RunId,
    ) -> Result<BTreeSet<ComponentInstanceId>, StoreError> {
        snapshot::tracked_instance_ids(self.conn(), run_id)
    }

    fn tracked_issue_ids(&self, run_id: RunId) -> Result<BTreeSet<IssueId>, StoreError> {
        snapshot::tracked_issue_ids(self.conn(), run_id)
    }
}

impl ReconcileStore for ReconcileTx<'_> {
    fn check_deadline(&self) -> Result<(), StoreError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    fn resolve_service_and_version(
        &self,
        instance_id: ComponentInstanceId,
    ) -> Result<PatchCandidate, StoreError> {
        self.conn()
            .query_row(
                "SELECT s.id, s.ccrn, cv.id, cv.version \
                 FROM component_instances ci \
                 JOIN services s ON s.id = ci.service_id AND s.deleted_at IS NULL \
                 JOIN component_versions cv \
                   ON cv.id = ci.component_version_id AND cv.deleted_at IS NULL \
                 WHERE ci.id = ?1 AND ci.deleted_at IS NULL",
                params![instance_id],
                |row| {
                    Ok(PatchCandidate {
                        service_id: row.get(0)?,
                        service_name: row.get(1)?,
                        component_version_id: row.get(2)?,
                        component_version_name: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("component instance", instance_id))
    }

    fn insert_patch_if_no_live_instance(
        &self,
        candidate: &PatchCandidate,
        detected_in_run_id: RunId,
    ) -> Result<bool, StoreError> {
        let inserted = self.conn().execute(
            "INSERT INTO patches (service_id, service_name, component_version_id, \
             component_version_name, detected_in_run_id, created_at) \
             SELECT ?1, ?2, ?3, ?4, ?5, ?6 \
             WHERE NOT EXISTS (SELECT 1 FROM component_instances \
               WHERE service_id = ?1 AND component_version_id = ?3 AND deleted_at IS NULL)",
            params![
                candidate.service_id,
                candidate.service_name,
                candidate.component_version_id,
                candidate.component_version_name,
                detected_in_run_id,
                now_millis()
            ],
        )?;
        Ok(inserted > 0)
    }

    fn patch_exists(
        &self,
        pair: ServiceVersionPair,
        detected_in_run_id: RunId,
    ) -> Result<bool, StoreError> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM patches \
             WHERE service_id = ?1 AND component_version_id = ?2 AND detected_in_run_id = ?3)",
            params![pair.service_id, pair.component_version_id, detected_in_run_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn issue_match_ids_for_instance(
        &self,
        instance_id: ComponentInstanceId,
    ) -> Result<Vec<IssueMatchId>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM issue_matches \
             WHERE component_instance_id = ?1 AND deleted_at IS NULL ORDER BY id ASC",
        )?;
        let ids = stmt
            .query_map(params![instance_id], |row| row.get::<_, IssueMatchId>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn soft_delete_issue_match(&self, id: IssueMatchId, actor: UserId) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE issue_matches SET deleted_at = ?2, updated_at = ?2, updated_by = ?3 \
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id, now_millis(), actor],
        )?;
        Ok(changed > 0)
    }

    fn soft_delete_component_instance(
        &self,
        id: ComponentInstanceId,
        actor: UserId,
    ) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE component_instances SET deleted_at = ?2, updated_by = ?3 \
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id, now_millis(), actor],
        )?;
        Ok(changed > 0)
    }

    fn version_lineage(
        &self,
        instance_id: ComponentInstanceId,
    ) -> Result<Option<VersionLineage>, StoreError> {
        let lineage = self
            .conn()
            .query_row(
                "SELECT cv.id, cv.component_id FROM component_instances ci \
                 JOIN component_versions cv ON cv.id = ci.component_version_id \
                 WHERE ci.id = ?1",
                params![instance_id],
                |row| {
                    Ok(VersionLineage {
                        component_version_id: row.get(0)?,
                        component_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(lineage)
    }

    fn retire_version_if_orphaned(
        &self,
        version_id: ComponentVersionId,
        actor: UserId,
    ) -> Result<bool, StoreError> {
        if self.has_live_instance_for_version(version_id)? {
            return Ok(false);
        }

        self.conn().execute(
            "DELETE FROM component_version_issues WHERE component_version_id = ?1",
            params![version_id],
        )?;
        let changed = self.conn().execute(
            "UPDATE component_versions SET deleted_at = ?2, updated_by = ?3 \
             WHERE id = ?1 AND deleted_at IS NULL",
            params![version_id, now_millis(), actor],
        )?;
        Ok(changed > 0)
    }

    fn retire_component_if_orphaned(
        &self,
        component_id: ComponentId,
        actor: UserId,
    ) -> Result<bool, StoreError> {
        if self.has_live_version_for_component(component_id)? {
            return Ok(false);
        }

        let changed = self.conn().execute(
            "UPDATE components SET deleted_at = ?2, updated_by = ?3 \
             WHERE id = ?1 AND deleted_at IS NULL",
            params![component_id, now_millis(), actor],
        )?;
        Ok(changed > 0)
    }

    fn bulk_mitigate_issue_matches(
        &self,
        issue_ids: &[IssueId],
        actor: UserId,
    ) -> Result<usize, StoreError> {
        let now = now_millis();
        let mut changed = 0;

        for chunk in issue_ids.chunks(MITIGATE_CHUNK_SIZE) {
            self.check_deadline()?;

            let placeholders = (0..chunk.len())
                .map(|index| format!("?{}", index + 4))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE issue_matches SET status = ?1, updated_at = ?2, updated_by = ?3 \
                 WHERE deleted_at IS NULL AND status <> ?1 AND issue_id IN ({placeholders})"
            );

            let mut values: Vec<rusqlite::types::Value> = vec![
                IssueMatchStatus::Mitigated.as_str().to_owned().into(),
                now.into(),
                actor.into(),
            ];
            values.extend(chunk.iter().map(|id| rusqlite::types::Value::from(*id)));

            changed += self.conn().execute(&sql, params_from_iter(values))?;
        }

        Ok(changed)
    }

    fn checkpoint(
        &self,
        operation: ReconcileOperation,
        tag: &str,
    ) -> Result<Option<Generations>, StoreError> {
        let generations = self
            .conn()
            .query_row(
                "SELECT latest_run_id, second_latest_run_id FROM reconcile_checkpoints \
                 WHERE operation = ?1 AND tag = ?2",
                params![operation.as_str(), tag],
                |row| {
                    Ok(Generations {
                        latest: row.get(0)?,
                        second_latest: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(generations)
    }

    fn record_checkpoint(
        &self,
        operation: ReconcileOperation,
        tag: &str,
        generations: Generations,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO reconcile_checkpoints \
             (operation, tag, latest_run_id, second_latest_run_id, processed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(operation, tag) DO UPDATE SET \
               latest_run_id = excluded.latest_run_id, \
               second_latest_run_id = excluded.second_latest_run_id, \
               processed_at = excluded.processed_at",
            params![
                operation.as_str(),
                tag,
                generations.latest,
                generations.second_latest,
                now_millis()
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;

    struct Fixture {
        _temp: TempDir,
        store: SqliteStore,
        service: i64,
        component: i64,
        version: i64,
        instance: i64,
        issue: i64,
        run: i64,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        let service = store.create_service("svc").expect("service");
        let component = store
            .create_component("pkg:cargo/regex", "library")
            .expect("component");
        let version = store
            .create_component_version(component, "1.10.0")
            .expect("version");
        let instance = store
            .create_component_instance("ci-1", service, version)
            .expect("instance");
        let issue = store.create_issue("CVE-2024-1111").expect("issue");
        let run = store.create_scanner_run("u-1", "tag", 1).expect("run").run_id;
        Fixture {
            _temp: temp,
            store,
            service,
            component,
            version,
            instance,
            issue,
            run,
        }
    }

    fn candidate(f: &Fixture) -> PatchCandidate {
        PatchCandidate {
            service_id: f.service,
            service_name: "svc".to_owned(),
            component_version_id: f.version,
            component_version_name: "1.10.0".to_owned(),
        }
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let f = fixture();
        {
            let tx = f.store.begin_reconcile(None).expect("begin");
            assert!(
                tx.soft_delete_component_instance(f.instance, 1)
                    .expect("soft delete")
            );
        }

        let instance = f
            .store
            .component_instance(f.instance)
            .expect("load")
            .expect("exists");
        assert_eq!(instance.deleted_at, None);
    }

    #[test]
    fn committed_transaction_persists_and_stamps_actor() {
        let f = fixture();
        let tx = f.store.begin_reconcile(None).expect("begin");
        assert!(tx.soft_delete_component_instance(f.instance, 5).expect("soft delete"));
        assert!(
            !tx.soft_delete_component_instance(f.instance, 5)
                .expect("soft delete twice")
        );
        tx.commit().expect("commit");

        let instance = f
            .store
            .component_instance(f.instance)
            .expect("load")
            .expect("exists");
        assert!(instance.deleted_at.is_some());
        assert_eq!(instance.updated_by, Some(5));
    }

    #[test]
    fn resolve_fails_for_deleted_service() {
        let f = fixture();
        {
            let tx = f.store.begin_reconcile(None).expect("begin");
            let resolved = tx.resolve_service_and_version(f.instance).expect("resolve");
            assert_eq!(resolved, candidate(&f));
        }

        f.store.delete_service(f.service, 1).expect("delete service");
        let tx = f.store.begin_reconcile(None).expect("begin");
        let err = tx
            .resolve_service_and_version(f.instance)
            .expect_err("service is gone");
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn patch_insert_is_guarded_by_live_instances() {
        let f = fixture();
        let tx = f.store.begin_reconcile(None).expect("begin");

        assert!(
            !tx.insert_patch_if_no_live_instance(&candidate(&f), f.run)
                .expect("guarded insert")
        );
        assert!(!tx.patch_exists(candidate(&f).pair(), f.run).expect("exists"));

        tx.soft_delete_component_instance(f.instance, 1)
            .expect("soft delete");
        assert!(
            tx.insert_patch_if_no_live_instance(&candidate(&f), f.run)
                .expect("insert")
        );
        assert!(tx.patch_exists(candidate(&f).pair(), f.run).expect("exists"));

        let duplicate = tx
            .insert_patch_if_no_live_instance(&candidate(&f), f.run)
            .expect_err("unique patch per run");
        assert_eq!(duplicate.class(), crate::ErrorClass::ConstraintViolation);
    }

    #[test]
    fn orphan_retirement_walks_up_the_lineage() {
        let f = fixture();
        f.store
            .add_issue_to_component_version(f.version, f.issue)
            .expect("link issue");
        let tx = f.store.begin_reconcile(None).expect("begin");

        assert!(!tx.retire_version_if_orphaned(f.version, 1).expect("retire"));
        tx.soft_delete_component_instance(f.instance, 1)
            .expect("soft delete");

        let lineage = tx
            .version_lineage(f.instance)
            .expect("lineage")
            .expect("instance has lineage");
        assert_eq!(lineage.component_version_id, f.version);
        assert_eq!(lineage.component_id, f.component);

        assert!(
            !tx.retire_component_if_orphaned(f.component, 1)
                .expect("component still has a live version")
        );
        assert!(tx.retire_version_if_orphaned(f.version, 1).expect("retire"));
        assert!(tx.retire_component_if_orphaned(f.component, 1).expect("retire"));
        tx.commit().expect("commit");

        assert!(
            f.store
                .component_version_issue_ids(f.version)
                .expect("cvis")
                .is_empty()
        );
        assert!(
            f.store
                .component_version(f.version)
                .expect("version")
                .and_then(|v| v.deleted_at)
                .is_some()
        );
        assert!(
            f.store
                .component(f.component)
                .expect("component")
                .and_then(|c| c.deleted_at)
                .is_some()
        );
    }

    #[test]
    fn bulk_mitigate_skips_deleted_and_already_mitigated() {
        let f = fixture();
        let fresh = f
            .store
            .create_issue_match(f.issue, f.instance, IssueMatchStatus::New)
            .expect("match");
        let done = f
            .store
            .create_issue_match(f.issue, f.instance, IssueMatchStatus::Mitigated)
            .expect("match");
        let gone = f
            .store
            .create_issue_match(f.issue, f.instance, IssueMatchStatus::FalsePositive)
            .expect("match");

        let tx = f.store.begin_reconcile(None).expect("begin");
        tx.soft_delete_issue_match(gone, 1).expect("soft delete match");
        assert_eq!(
            tx.issue_match_ids_for_instance(f.instance).expect("ids"),
            vec![fresh, done]
        );
        assert_eq!(tx.bulk_mitigate_issue_matches(&[f.issue], 9).expect("mitigate"), 1);
        assert_eq!(tx.bulk_mitigate_issue_matches(&[f.issue], 9).expect("mitigate"), 0);
        assert_eq!(tx.bulk_mitigate_issue_matches(&[], 9).expect("mitigate"), 0);
        tx.commit().expect("commit");

        let fresh = f.store.issue_match(fresh).expect("load").expect("exists");
        assert_eq!(fresh.status, IssueMatchStatus::Mitigated);
        assert_eq!(fresh.updated_by, Some(9));
        let gone = f.store.issue_match(gone).expect("load").expect("exists");
        assert_eq!(gone.status, IssueMatchStatus::FalsePositive);
    }

    #[test]
    fn checkpoint_upserts_per_operation_and_tag() {
        let f = fixture();
        let tx = f.store.begin_reconcile(None).expect("begin");
        let first = Generations {
            latest: 2,
            second_latest: 1,
        };
        let second = Generations {
            latest: 3,
            second_latest: 2,
        };

        assert_eq!(tx.checkpoint(ReconcileOperation::Autopatch, "tag").expect("read"), None);
        tx.record_checkpoint(ReconcileOperation::Autopatch, "tag", first)
            .expect("record");
        tx.record_checkpoint(ReconcileOperation::Autopatch, "tag", second)
            .expect("record again");

        assert_eq!(
            tx.checkpoint(ReconcileOperation::Autopatch, "tag").expect("read"),
            Some(second)
        );
        assert_eq!(tx.checkpoint(ReconcileOperation::Autoclose, "tag").expect("read"), None);
    }

    #[test]
    fn expired_deadline_interrupts_statements() {
        let f = fixture();
        let tx = f
            .store
            .begin_reconcile(Some(Instant::now()))
            .expect("begin");
        assert!(matches!(tx.check_deadline(), Err(StoreError::DeadlineExceeded)));

        let heavy: Result<i64, StoreError> = tx
            .conn()
            .query_row(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n LIMIT 5000000) \
                 SELECT COUNT(*) FROM n",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::from);
        assert!(matches!(heavy, Err(StoreError::DeadlineExceeded)));
        drop(tx);

        let count: i64 = f
            .store
            .conn
            .query_row(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n LIMIT 50000) \
                 SELECT COUNT(*) FROM n",
                [],
                |row| row.get(0),
            )
            .expect("handler cleared after drop");
        assert_eq!(count, 50_000);
    }
}
