pub mod binder;
pub mod cli;
pub mod config;
pub mod content;
pub mod events;
pub mod ffi;
pub mod guard;
pub mod headless;
pub mod logging;
pub mod native;
pub mod runtime;
pub mod scheduler;
pub mod script_harness;
pub mod scripts;
pub mod time;
pub mod watch;

use std::path::Path;

use anyhow::Result;

use crate::cli::CliOverrides;
use crate::config::RuntimeConfig;
use crate::script_harness::HarnessOutput;

pub use runtime::{EngineContext, RuntimeError, ScriptRuntime};

/// Resolves the configuration for a command line, runs the requested fixture (or the configured
/// roots) headlessly and returns the report.
pub fn run_with_overrides(cli: &CliOverrides) -> Result<HarnessOutput> {
    let mut config = match cli.config_path() {
        Some(path) => {
            let mut config = RuntimeConfig::load(path)?;
            config.resolve_roots(path.parent().unwrap_or_else(|| Path::new(".")));
            config
        }
        None => RuntimeConfig::default(),
    };
    let overrides = cli.config_overrides();
    config.apply_overrides(&overrides);
    logging::init(&config.log_level);
    if !overrides.is_empty() {
        tracing::info!(target: "runtime", fields = ?overrides.applied_fields(), "applied command line overrides");
    }

    match cli.fixture_path() {
        Some(path) => {
            let mut fixture = script_harness::load_fixture(path)?;
            if let Some(ticks) = cli.ticks() {
                fixture.ticks = ticks;
            }
            let fixture_config = RuntimeConfig {
                script_extension: config.script_extension.clone(),
                max_bind_entities: config.max_bind_entities,
                ..script_harness::fixture_config(&fixture)
            };
            script_harness::run_fixture_with_config(&fixture, fixture_config)
        }
        None => {
            config.hot_reload = false;
            script_harness::run_roots(config, cli.ticks().unwrap_or(1))
        }
    }
}
