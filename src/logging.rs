use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Installs a stderr subscriber. `RUST_LOG` takes precedence over `level`. Returns `false` when
/// a global subscriber was already installed.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(parse_level(level).into()));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .try_init()
        .is_ok()
}
