use std::collections::BTreeSet;

use heureka_core::{ComponentInstanceId, UserId};
use heureka_store::{ReconcileStore, StoreError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CascadeReport {
    pub issue_matches_retired: usize,
    pub instances_retired: usize,
    pub versions_retired: usize,
    pub components_retired: usize,
}

/// Soft-deletes the instances together with their issue matches, then retires
/// the versions and components nothing live refers to any more.
pub(crate) fn retire_instances<S: ReconcileStore + ?Sized>(
    store: &S,
    instances: &[ComponentInstanceId],
    actor: UserId,
) -> Result<CascadeReport, StoreError> {
    let mut report = CascadeReport::default();
    let mut versions = BTreeSet::new();
    let mut components = BTreeSet::new();

    for &instance_id in instances {
        store.check_deadline()?;

        if let Some(lineage) = store.version_lineage(instance_id)? {
            versions.insert(lineage.component_version_id);
            components.insert(lineage.component_id);
        }

        for match_id in store.issue_match_ids_for_instance(instance_id)? {
            if store.soft_delete_issue_match(match_id, actor)? {
                report.issue_matches_retired += 1;
            }
        }
        if store.soft_delete_component_instance(instance_id, actor)? {
            report.instances_retired += 1;
        }
    }

    for version_id in versions {
        store.check_deadline()?;
        if store.retire_version_if_orphaned(version_id, actor)? {
            report.versions_retired += 1;
        }
    }
    for component_id in components {
        store.check_deadline()?;
        if store.retire_component_if_orphaned(component_id, actor)? {
            report.components_retired += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use heureka_core::IssueMatchStatus;
    use heureka_store::SqliteStore;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn shared_version_survives_partial_retirement() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        let service = store.create_service("svc").expect("service");
        let component = store.create_component("pkg:npm/lodash", "library").expect("component");
        let version = store
            .create_component_version(component, "4.17.20")
            .expect("version");
        let gone = store
            .create_component_instance("ci-gone", service, version)
            .expect("instance");
        let kept = store
            .create_component_instance("ci-kept", service, version)
            .expect("instance");
        let issue = store.create_issue("CVE-2021-23337").expect("issue");
        let gone_match = store
            .create_issue_match(issue, gone, IssueMatchStatus::New)
            .expect("match");
        let kept_match = store
            .create_issue_match(issue, kept, IssueMatchStatus::New)
            .expect("match");

        let tx = store.begin_reconcile(None).expect("begin");
        let report = retire_instances(&tx, &[gone], 3).expect("cascade");
        tx.commit().expect("commit");

        assert_eq!(
            report,
            CascadeReport {
                issue_matches_retired: 1,
                instances_retired: 1,
                versions_retired: 0,
                components_retired: 0,
            }
        );
        let gone_match = store.issue_match(gone_match).expect("load").expect("exists");
        assert!(gone_match.deleted_at.is_some());
        assert_eq!(gone_match.updated_by, Some(3));
        let kept_match = store.issue_match(kept_match).expect("load").expect("exists");
        assert_eq!(kept_match.deleted_at, None);
    }

    #[test]
    fn last_instance_takes_version_and_component_along() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        let service = store.create_service("svc").expect("service");
        let component = store.create_component("pkg:npm/lodash", "library").expect("component");
        let version = store
            .create_component_version(component, "4.17.20")
            .expect("version");
        let instance = store
            .create_component_instance("ci-1", service, version)
            .expect("instance");

        let tx = store.begin_reconcile(None).expect("begin");
        let report = retire_instances(&tx, &[instance, instance], 1).expect("cascade");
        tx.commit().expect("commit");

        assert_eq!(report.instances_retired, 1);
        assert_eq!(report.versions_retired, 1);
        assert_eq!(report.components_retired, 1);
    }
}
