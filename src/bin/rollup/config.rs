//! Configuration discovery for the command-line tool

use std::path::{Path, PathBuf};

use vitals_rollup::config::ApplicationConfig;
use vitals_rollup::error::{Error, Result};

/// File looked for in the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "rollup.toml";

/// Where the active configuration came from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// `--config` flag or `ROLLUP_CONFIG`
    Explicit(PathBuf),

    /// `./rollup.toml`
    WorkingDirectory(PathBuf),

    /// Built-in defaults
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Explicit(path) | ConfigSource::WorkingDirectory(path) => {
                write!(f, "{}", path.display())
            },
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

/// Load configuration
///
/// Priority:
/// 1. `--config` flag
/// 2. `ROLLUP_CONFIG` environment variable
/// 3. `./rollup.toml`
/// 4. Default configuration
///
/// Environment overrides apply on top of whichever source wins, and the
/// result is validated before it is returned. A file that exists but fails
/// to parse is an error rather than a silent fallback.
pub fn load_config(flag: Option<&Path>) -> Result<(ApplicationConfig, ConfigSource)> {
    let explicit = flag
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("ROLLUP_CONFIG").map(PathBuf::from));

    let (mut config, source) = match explicit {
        Some(path) => {
            let config = ApplicationConfig::load(&path)?;
            eprintln!("[config] Loaded configuration from: {}", path.display());
            (config, ConfigSource::Explicit(path))
        },
        None => {
            let local = Path::new(DEFAULT_CONFIG_FILE);
            if local.exists() {
                let config = ApplicationConfig::load(local)?;
                eprintln!("[config] Loaded configuration from {}", DEFAULT_CONFIG_FILE);
                (config, ConfigSource::WorkingDirectory(local.to_path_buf()))
            } else {
                eprintln!("[config] {} not found, using default configuration", DEFAULT_CONFIG_FILE);
                (ApplicationConfig::default(), ConfigSource::Defaults)
            }
        },
    };

    config.apply_env_overrides();
    config.validate().map_err(|e| match e {
        Error::Configuration(msg) => Error::Configuration(format!("{} ({})", msg, source)),
        other => other,
    })?;
    Ok((config, source))
}
