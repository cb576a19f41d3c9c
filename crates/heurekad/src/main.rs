use anyhow::{Context, Result};
use heureka_config::{config_path, ensure_workspace_config, validate_config};
use heurekad::cli::{Cli, parse_cli};
use heurekad::commands::{execute, is_retryable};
use heurekad::logging::init_logging;

/// `EX_TEMPFAIL`: lock contention, busy database or an exceeded deadline.
const EXIT_RETRYABLE: i32 = 75;

fn main() {
    let cli = parse_cli();
    if let Err(err) = run(cli) {
        eprintln!("heurekad: {err:#}");
        let code = if is_retryable(&err) { EXIT_RETRYABLE } else { 1 };
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            config_path(&workspace).display()
        )
    })?;
    init_logging(&config.logging, cli.verbose, cli.log_format);
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "{}", warning.message);
    }

    let mut out = std::io::stdout().lock();
    execute(&workspace, config, cli.command, &mut out)
}
