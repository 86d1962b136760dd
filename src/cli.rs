use crate::config::RuntimeConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    fixture: Option<PathBuf>,
    ticks: Option<u64>,
    script_root: Option<PathBuf>,
    hot_reload: Option<bool>,
    log_level: Option<String>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name value.");
            };
            let value = iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config = Some(PathBuf::from(value)),
                "fixture" => overrides.fixture = Some(PathBuf::from(value)),
                "ticks" => {
                    overrides.ticks = Some(value.parse::<u64>().with_context(|| format!("Invalid ticks '{value}'"))?);
                }
                "scripts" => overrides.script_root = Some(PathBuf::from(value)),
                "hot-reload" => overrides.hot_reload = Some(parse_bool_flag("hot-reload", &value)?),
                "log" => overrides.log_level = Some(value),
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --config, --fixture, --ticks, --scripts, \
                     --hot-reload, --log."
                ),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn fixture_path(&self) -> Option<&PathBuf> {
        self.fixture.as_ref()
    }

    pub fn ticks(&self) -> Option<u64> {
        self.ticks
    }

    pub fn config_overrides(&self) -> RuntimeConfigOverrides {
        RuntimeConfigOverrides {
            script_root: self.script_root.clone(),
            behaviour_root: None,
            hot_reload: self.hot_reload,
            log_level: self.log_level.clone(),
        }
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}
