use heureka_config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber writing to stderr. `RUST_LOG` wins over the
/// configured level, `--verbose` forces debug.
pub fn init_logging(config: &LoggingConfig, verbose: bool, format_override: Option<LogFormat>) {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format_override.unwrap_or(config.format) {
        LogFormat::Human => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
