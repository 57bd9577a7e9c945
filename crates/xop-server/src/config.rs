//! Configuration loading.
//!
//! Sources, later ones overriding earlier ones:
//! - built-in defaults
//! - TOML file (`config/xop.toml` unless `--config` is given)
//! - environment variables prefixed with `XOP__`, e.g. `XOP__ROUTER__IQ_TIMEOUT_MS=500`
//!   or `XOP__COMPONENTS__ENABLED=ping,console`

use std::path::Path;

use anyhow::{Context, Result};
use ::config::{Config, Environment, File, FileFormat};
use xop_router::XopConfig;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/xop.toml";

/// Load the configuration.
///
/// The file is optional unless `required` is set (an explicit `--config`).
pub fn load(path: &Path, required: bool) -> Result<XopConfig> {
    let builder = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(required))
        .add_source(environment());

    let config: XopConfig = builder
        .build()
        .with_context(|| format!("Failed to read configuration from {}", path.display()))?
        .try_deserialize()
        .context("Invalid configuration")?;

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn environment() -> Environment {
    Environment::with_prefix("XOP")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("components.enabled")
}
