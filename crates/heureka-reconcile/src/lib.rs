use std::path::{Path, PathBuf};
use std::time::Instant;

use heureka_config::{ConfigError, HeurekaConfig, load_workspace_config};
use heureka_core::{Generations, ReconcileOperation};
use heureka_store::{
    ErrorClass, ReconcileStore, ReconcileTx, ScannerRunRecord, SqliteStore, StoreError,
};
use serde::Serialize;
use thiserror::Error;

mod autoclose;
mod autopatch;
mod cascade;
mod history;
mod lock;

pub use autoclose::AutocloseTagReport;
pub use autopatch::AutopatchTagReport;
pub use cascade::CascadeReport;
pub use history::comparable_tags;
pub use lock::{OperationLock, lock_path};

use history::TagWindow;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{operation} is already running (lock held at {})", .path.display())]
    AlreadyRunning {
        operation: ReconcileOperation,
        path: PathBuf,
    },
    #[error("{operation} failed for tag '{tag}': {source}")]
    Tag {
        operation: ReconcileOperation,
        tag: String,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) => ErrorClass::Query,
            Self::Store(err) | Self::Tag { source: err, .. } => err.class(),
            Self::Io(_) | Self::AlreadyRunning { .. } => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

/// Per-tag outcome of one reconciliation operation.
pub trait TagReport {
    fn tag(&self) -> &str;
    fn changed(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagFailure {
    pub tag: String,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport<T> {
    pub operation: ReconcileOperation,
    /// True iff some processed tag saw a disappearance.
    pub changed: bool,
    pub tags: Vec<T>,
    /// Tags whose newest pair of runs was reconciled by an earlier call.
    pub unchanged_tags: Vec<String>,
    /// Tags skipped after a retryable failure when failures are isolated.
    pub failed_tags: Vec<TagFailure>,
}

impl<T> PassReport<T> {
    fn empty(operation: ReconcileOperation) -> Self {
        Self {
            operation,
            changed: false,
            tags: Vec::new(),
            unchanged_tags: Vec::new(),
            failed_tags: Vec::new(),
        }
    }
}

pub type AutopatchReport = PassReport<AutopatchTagReport>;
pub type AutocloseReport = PassReport<AutocloseTagReport>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub autopatch: AutopatchReport,
    pub autoclose: AutocloseReport,
}

impl ReconcileSummary {
    pub fn changed(&self) -> bool {
        self.autopatch.changed || self.autoclose.changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunCompletion {
    pub run: ScannerRunRecord,
    /// Present when completing the run triggered autopatch.
    pub autopatch: Option<AutopatchReport>,
}

/// Drives autopatch and autoclose over every tag of a workspace's store.
pub struct Reconciler {
    workspace: PathBuf,
    config: HeurekaConfig,
    store: SqliteStore,
}

impl Reconciler {
    pub fn new(workspace: impl AsRef<Path>) -> Result<Self, ReconcileError> {
        let workspace = workspace.as_ref().to_path_buf();
        let config = load_workspace_config(&workspace)?;
        Self::with_config(workspace, config)
    }

    pub fn with_config(
        workspace: impl AsRef<Path>,
        config: HeurekaConfig,
    ) -> Result<Self, ReconcileError> {
        let workspace = workspace.as_ref().to_path_buf();
        let store = SqliteStore::open_with_config(&workspace, &config.database)?;
        Ok(Self {
            workspace,
            config,
            store,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &HeurekaConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Returns whether any tag lost component instances since its previous
    /// completed run.
    pub fn autopatch(&self) -> Result<bool, ReconcileError> {
        Ok(self.autopatch_report()?.changed)
    }

    pub fn autopatch_report(&self) -> Result<AutopatchReport, ReconcileError> {
        let actor = self.config.reconcile.system_user_id;
        self.run_pass(ReconcileOperation::Autopatch, |tx, tag, generations| {
            autopatch::autopatch_tag(tx, tag, generations, actor)
        })
    }

    /// Returns whether any tag stopped reporting an issue since its previous
    /// completed run.
    pub fn autoclose(&self) -> Result<bool, ReconcileError> {
        Ok(self.autoclose_report()?.changed)
    }

    pub fn autoclose_report(&self) -> Result<AutocloseReport, ReconcileError> {
        let actor = self.config.reconcile.system_user_id;
        self.run_pass(ReconcileOperation::Autoclose, |tx, tag, generations| {
            autoclose::autoclose_tag(tx, tag, generations, actor)
        })
    }

    pub fn reconcile(&self) -> Result<ReconcileSummary, ReconcileError> {
        let autopatch = self.autopatch_report()?;
        let autoclose = self.autoclose_report()?;
        Ok(ReconcileSummary {
            autopatch,
            autoclose,
        })
    }

    /// Completes the run and, unless disabled in config, runs autopatch right
    /// after. An autopatch failure is returned even though the run stays
    /// completed.
    pub fn complete_scanner_run(&self, uuid: &str) -> Result<RunCompletion, ReconcileError> {
        let run = self.store.complete_scanner_run(uuid)?;
        let autopatch = if self.config.reconcile.autopatch_on_complete {
            Some(self.autopatch_report()?)
        } else {
            None
        };
        Ok(RunCompletion { run, autopatch })
    }

    fn run_pass<T, F>(
        &self,
        operation: ReconcileOperation,
        process: F,
    ) -> Result<PassReport<T>, ReconcileError>
    where
        T: TagReport,
        F: Fn(&ReconcileTx<'_>, &str, Generations) -> Result<T, StoreError>,
    {
        let started = Instant::now();
        let _lock = OperationLock::acquire(&self.workspace, operation)?;
        let mut report = PassReport::empty(operation);

        let tags = comparable_tags(&self.store)?;
        if tags.is_empty() {
            tracing::info!(%operation, "no tag has two completed runs, nothing to reconcile");
            return Ok(report);
        }

        for tag in tags.keys() {
            match self.process_tag(operation, tag, &process) {
                Ok(Some(tag_report)) => {
                    tracing::debug!(
                        %operation,
                        tag = tag_report.tag(),
                        changed = tag_report.changed(),
                        "tag committed"
                    );
                    report.changed |= tag_report.changed();
                    report.tags.push(tag_report);
                }
                Ok(None) => report.unchanged_tags.push(tag.clone()),
                Err(err) if self.config.reconcile.isolate_tag_failures && err.is_retryable() => {
                    tracing::warn!(
                        %operation,
                        tag = %tag,
                        error = %err,
                        "skipping tag after retryable failure"
                    );
                    report.failed_tags.push(TagFailure {
                        tag: tag.clone(),
                        class: err.class(),
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    tracing::error!(%operation, tag = %tag, error = %err, "reconciliation aborted");
                    return Err(ReconcileError::Tag {
                        operation,
                        tag: tag.clone(),
                        source: err,
                    });
                }
            }
        }

        tracing::info!(
            %operation,
            changed = report.changed,
            processed = report.tags.len(),
            unchanged = report.unchanged_tags.len(),
            failed = report.failed_tags.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconciliation finished"
        );
        Ok(report)
    }

    /// One transaction per tag. Nothing is written unless every step of the
    /// tag succeeds before the deadline.
    fn process_tag<T, F>(
        &self,
        operation: ReconcileOperation,
        tag: &str,
        process: &F,
    ) -> Result<Option<T>, StoreError>
    where
        F: Fn(&ReconcileTx<'_>, &str, Generations) -> Result<T, StoreError>,
    {
        let deadline = self
            .config
            .reconcile
            .tag_timeout()
            .map(|timeout| Instant::now() + timeout);
        let tx = self.store.begin_reconcile(deadline)?;

        let generations = match history::open_window(&tx, operation, tag)? {
            TagWindow::Ready(generations) => generations,
            TagWindow::Insufficient => return Ok(None),
            TagWindow::AlreadyProcessed(generations) => {
                tracing::debug!(
                    %operation,
                    tag,
                    latest_run_id = generations.latest,
                    "runs already reconciled"
                );
                return Ok(None);
            }
        };

        let tag_report = process(&tx, tag, generations)?;
        tx.record_checkpoint(operation, tag, generations)?;
        tx.check_deadline()?;
        tx.commit()?;
        Ok(Some(tag_report))
    }
}
