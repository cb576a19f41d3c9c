use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use heureka_config::HeurekaConfig;
use heureka_core::now_millis;
use heureka_reconcile::{ReconcileError, Reconciler};
use heureka_store::{PatchFilter, StoreError};
use serde::Serialize;
use serde_json::json;

use crate::cli::{Commands, PatchesArgs, RunCommand};

/// Runs one subcommand against the workspace and writes its result as pretty
/// JSON to `out`.
pub fn execute(
    workspace: &Path,
    config: HeurekaConfig,
    command: Commands,
    out: &mut dyn Write,
) -> Result<()> {
    let reconciler = Reconciler::with_config(workspace, config).with_context(|| {
        format!("failed to open heureka store under {}", workspace.display())
    })?;

    match command {
        Commands::Init => write_json(
            out,
            &json!({
                "workspace": workspace,
                "database": reconciler.store().sqlite_path(),
            }),
        ),
        Commands::Autopatch => {
            let report = reconciler.autopatch_report().context("autopatch failed")?;
            write_json(out, &report)
        }
        Commands::Autoclose => {
            let report = reconciler.autoclose_report().context("autoclose failed")?;
            write_json(out, &report)
        }
        Commands::Reconcile => {
            let summary = reconciler.reconcile().context("reconcile failed")?;
            write_json(out, &summary)
        }
        Commands::Run(command) => run_command(&reconciler, command, out),
        Commands::Tags => {
            let tags = reconciler
                .store()
                .scanner_run_tags()
                .context("failed to list scanner run tags")?;
            write_json(out, &json!({ "tags": tags }))
        }
        Commands::Patches(args) => list_patches(&reconciler, &args, out),
    }
}

fn run_command(reconciler: &Reconciler, command: RunCommand, out: &mut dyn Write) -> Result<()> {
    let store = reconciler.store();
    match command {
        RunCommand::Create(args) => {
            let start = args.start.unwrap_or_else(now_millis);
            let run = store
                .create_scanner_run(&args.uuid, &args.tag, start)
                .with_context(|| format!("failed to create scanner run {}", args.uuid))?;
            write_json(out, &run)
        }
        RunCommand::Track(args) => {
            let mut instances_added = 0;
            for instance_id in &args.instances {
                if store
                    .track_component_instance(&args.uuid, *instance_id)
                    .with_context(|| format!("failed to track instance {instance_id}"))?
                {
                    instances_added += 1;
                }
            }
            let mut issues_added = 0;
            for issue_id in &args.issues {
                if store
                    .track_issue(&args.uuid, *issue_id)
                    .with_context(|| format!("failed to track issue {issue_id}"))?
                {
                    issues_added += 1;
                }
            }
            write_json(
                out,
                &json!({
                    "uuid": args.uuid,
                    "instances_added": instances_added,
                    "issues_added": issues_added,
                }),
            )
        }
        RunCommand::Complete(args) => {
            let completion = reconciler
                .complete_scanner_run(&args.uuid)
                .with_context(|| format!("failed to complete scanner run {}", args.uuid))?;
            write_json(out, &completion)
        }
        RunCommand::Fail(args) => {
            let run = store
                .fail_scanner_run(&args.uuid, &args.message)
                .with_context(|| format!("failed to mark scanner run {} as failed", args.uuid))?;
            write_json(out, &run)
        }
        RunCommand::Delete(args) => {
            let deleted = store
                .delete_scanner_run(&args.uuid)
                .with_context(|| format!("failed to delete scanner run {}", args.uuid))?;
            write_json(out, &json!({ "uuid": args.uuid, "deleted": deleted }))
        }
    }
}

fn list_patches(reconciler: &Reconciler, args: &PatchesArgs, out: &mut dyn Write) -> Result<()> {
    let filter = PatchFilter {
        service_id: args.service_id,
        component_version_id: args.component_version_id,
        detected_in_run_id: args.run_id,
    };
    let patches = reconciler
        .store()
        .list_patches(&filter)
        .context("failed to list patches")?;
    write_json(out, &json!({ "filter": filter, "patches": patches }))
}

/// Whether a scheduler should simply try again later.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(err) = err.downcast_ref::<ReconcileError>() {
        return err.is_retryable();
    }
    err.downcast_ref::<StoreError>()
        .is_some_and(StoreError::is_retryable)
}

fn write_json<T: Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value).context("failed to serialize JSON output")?;
    writeln!(out).context("failed to write trailing newline")?;
    Ok(())
}
