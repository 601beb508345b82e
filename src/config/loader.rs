//! Configuration file loading

use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::settings::EngineSettings;
use super::types::ClusterConfig;
use crate::error::{Error, Result};

/// On-disk configuration: desired cluster plus engine tunables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigFile {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from a file extension; anything but `.toml` is YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// Parse and validate configuration text
pub fn parse_config(text: &str, format: ConfigFormat) -> Result<ConfigFile> {
    let file: ConfigFile = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(text)?,
        ConfigFormat::Toml => toml::from_str(text)?,
    };

    file.cluster.ensure_valid()?;

    if file.engine.max_parallel_pools == 0 {
        return Err(Error::configuration(
            "engine.maxParallelPools",
            "must be at least 1",
        ));
    }
    if file.engine.timeouts.poll_interval.is_zero() {
        return Err(Error::configuration(
            "engine.timeouts.pollInterval",
            "must be at least 1 second",
        ));
    }

    Ok(file)
}

/// Read, parse and validate a configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    debug!("Loading configuration from {}", path.display());

    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::ConfigError(format!("cannot read {}: {e}", path.display())))?;
    let file = parse_config(&text, ConfigFormat::from_path(path))?;

    info!(
        cluster = %file.cluster.name,
        region = %file.cluster.region,
        pools = file.cluster.node_pools.len(),
        "Loaded configuration"
    );
    Ok(file)
}
