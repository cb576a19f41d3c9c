#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use heureka_config::HeurekaConfig;
use heureka_core::IssueMatchStatus;
use heureka_reconcile::Reconciler;
use heureka_store::{IssueMatchRecord, PatchFilter, PatchRecord, SqliteStore};
use tempfile::{TempDir, tempdir};

/// A reconciler over a throwaway workspace plus name-keyed seeding helpers.
/// Services, versions, instances and issues are created on first use.
pub struct TestWorkspace {
    reconciler: Reconciler,
    services: RefCell<BTreeMap<String, i64>>,
    versions: RefCell<BTreeMap<String, i64>>,
    instances: RefCell<BTreeMap<String, i64>>,
    issues: RefCell<BTreeMap<String, i64>>,
    run_counter: Cell<u32>,
    _temp: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Self::with_config(HeurekaConfig::default())
    }

    pub fn with_config(config: HeurekaConfig) -> Result<Self> {
        let temp = tempdir()?;
        let reconciler = Reconciler::with_config(temp.path(), config)?;
        Ok(Self {
            reconciler,
            services: RefCell::default(),
            versions: RefCell::default(),
            instances: RefCell::default(),
            issues: RefCell::default(),
            run_counter: Cell::new(0),
            _temp: temp,
        })
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn store(&self) -> &SqliteStore {
        self.reconciler.store()
    }

    pub fn service(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.services.borrow().get(name) {
            return Ok(*id);
        }
        let id = self.store().create_service(name)?;
        self.services.borrow_mut().insert(name.to_owned(), id);
        Ok(id)
    }

    /// Each version name gets its own component.
    pub fn version(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.versions.borrow().get(name) {
            return Ok(*id);
        }
        let component = self
            .store()
            .create_component(&format!("pkg:generic/{name}"), "library")?;
        let id = self.store().create_component_version(component, name)?;
        self.versions.borrow_mut().insert(name.to_owned(), id);
        Ok(id)
    }

    pub fn instance(&self, ccrn: &str, service: &str, version: &str) -> Result<i64> {
        if let Some(id) = self.instances.borrow().get(ccrn) {
            return Ok(*id);
        }
        let service_id = self.service(service)?;
        let version_id = self.version(version)?;
        let id = self
            .store()
            .create_component_instance(ccrn, service_id, version_id)?;
        self.instances.borrow_mut().insert(ccrn.to_owned(), id);
        Ok(id)
    }

    pub fn instance_id(&self, ccrn: &str) -> Result<i64> {
        self.instances
            .borrow()
            .get(ccrn)
            .copied()
            .with_context(|| format!("instance {ccrn} was never seeded"))
    }

    pub fn version_id(&self, name: &str) -> Result<i64> {
        self.versions
            .borrow()
            .get(name)
            .copied()
            .with_context(|| format!("version {name} was never seeded"))
    }

    pub fn issue(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.issues.borrow().get(name) {
            return Ok(*id);
        }
        let id = self.store().create_issue(name)?;
        self.issues.borrow_mut().insert(name.to_owned(), id);
        Ok(id)
    }

    pub fn issue_match(&self, issue: &str, ccrn: &str) -> Result<i64> {
        let issue_id = self.issue(issue)?;
        let instance_id = self.instance_id(ccrn)?;
        Ok(self
            .store()
            .create_issue_match(issue_id, instance_id, IssueMatchStatus::New)?)
    }

    /// Opens a run, tracks the given instances and issues, and completes it
    /// without triggering autopatch.
    pub fn completed_run(&self, tag: &str, instances: &[&str], issues: &[&str]) -> Result<i64> {
        let uuid = self.open_run(tag, instances, issues)?;
        Ok(self.store().complete_scanner_run(&uuid)?.run_id)
    }

    pub fn open_run(&self, tag: &str, instances: &[&str], issues: &[&str]) -> Result<String> {
        let counter = self.run_counter.get() + 1;
        self.run_counter.set(counter);
        let uuid = format!("{tag}-run-{counter}");

        self.store()
            .create_scanner_run(&uuid, tag, i64::from(counter))?;
        for ccrn in instances {
            let id = self.instance_id(ccrn)?;
            self.store().track_component_instance(&uuid, id)?;
        }
        for name in issues {
            let id = self.issue(name)?;
            self.store().track_issue(&uuid, id)?;
        }
        Ok(uuid)
    }

    /// Runs `work` while a second connection holds the database write lock
    /// for `hold`. Any reconcile transaction begun inside `work` waits out the
    /// hold before it starts.
    pub fn while_write_locked<T>(&self, hold: Duration, work: impl FnOnce() -> T) -> Result<T> {
        let workspace = self.reconciler.workspace().to_path_buf();
        let database = self.reconciler.config().database.clone();
        let (locked_tx, locked_rx) = mpsc::channel();

        thread::scope(|scope| {
            let holder = scope.spawn(move || -> Result<()> {
                let blocker = SqliteStore::open_with_config(&workspace, &database)?;
                let tx = blocker.begin_reconcile(None)?;
                locked_tx.send(()).context("notify write lock taken")?;
                thread::sleep(hold);
                drop(tx);
                Ok(())
            });

            locked_rx
                .recv()
                .context("write lock holder exited before locking")?;
            let output = work();
            holder
                .join()
                .map_err(|_| anyhow!("write lock holder panicked"))??;
            Ok(output)
        })
    }

    pub fn patches(&self) -> Result<Vec<PatchRecord>> {
        Ok(self.store().list_patches(&PatchFilter::default())?)
    }

    pub fn instance_deleted(&self, ccrn: &str) -> Result<bool> {
        let id = self.instance_id(ccrn)?;
        let record = self
            .store()
            .component_instance(id)?
            .with_context(|| format!("instance {ccrn} missing"))?;
        Ok(record.deleted_at.is_some())
    }

    pub fn version_deleted(&self, name: &str) -> Result<bool> {
        let id = self.version_id(name)?;
        let record = self
            .store()
            .component_version(id)?
            .with_context(|| format!("version {name} missing"))?;
        Ok(record.deleted_at.is_some())
    }

    pub fn match_record(&self, id: i64) -> Result<IssueMatchRecord> {
        self.store()
            .issue_match(id)?
            .with_context(|| format!("issue match {id} missing"))
    }
}
