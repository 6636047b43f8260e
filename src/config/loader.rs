//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::Configuration;
use crate::config::ConfigError;

/// Load a transport configuration document from a TOML file.
///
/// Only syntax is checked here; each protocol validates its own namespace
/// when it reads it.
pub fn load_config(path: &Path) -> Result<Configuration, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Configuration, ConfigError> {
    let table: toml::Table = toml::from_str(content)?;
    Ok(Configuration::from_table(table))
}
