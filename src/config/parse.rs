use super::types::{Config, StoreBackend};
use super::{expand_env_vars, expand_tilde, resolve_config_path, unexpanded_env_vars};
use regex::Regex;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("required setting {0} is not configured")]
    Missing(&'static str),
}

/// Returns the value of an optional setting, or `ConfigError::Missing` naming
/// the environment variable that supplies it.
pub fn require<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

/// Loads the effective configuration: the config file (if one is found),
/// overlaid with recognised environment variables.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match resolve_config_path(explicit) {
        Some(path) => {
            tracing::info!(config_path = %path.display(), "Loading configuration");
            parse_file(&path)?
        }
        None => {
            tracing::info!("No config file found, using defaults and environment");
            Config::default()
        }
    };

    config.apply_env_overrides();
    validate_config(&config)?;
    Ok(config)
}

/// Loads and validates a config file without consulting the environment
/// overrides.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let config = parse_file(path)?;
    validate_config(&config)?;
    Ok(config)
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let yaml_string = expand_env_vars(&yaml_string);

    let unexpanded = unexpanded_env_vars(&yaml_string);
    if !unexpanded.is_empty() {
        return Err(ConfigError::Validation(format!(
            "environment variables referenced in '{}' are not set: {}",
            path.display(),
            unexpanded.join(", ")
        )));
    }

    let mut config: Config = serde_yaml::from_str(&yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        ))
    })?;

    expand_paths(&mut config);
    Ok(config)
}

fn expand_paths(config: &mut Config) {
    config.store.path = expand_tilde(&config.store.path);
    config.stage.local_root = expand_tilde(&config.stage.local_root);
    config.staging.dir = expand_tilde(&config.staging.dir);
}

/// Azure table names: alphanumeric, 3 to 63 characters, leading letter.
pub fn is_table_storage_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    let identifier = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").map_err(|e| {
        ConfigError::Validation(format!("identifier pattern failed to compile: {}", e))
    })?;
    if !identifier.is_match(&config.store.table_name) {
        errors.push(format!(
            "store.table_name '{}' must be a plain SQL identifier",
            config.store.table_name
        ));
    }

    if config.store.backend == StoreBackend::Table && !is_table_storage_name(&config.store.table_name) {
        errors.push(format!(
            "store.table_name '{}' must be 3-63 letters or digits starting with a letter for the table backend",
            config.store.table_name
        ));
    }

    if config.web.listen.trim().is_empty() {
        errors.push("web.listen must not be empty".to_string());
    }

    if config.web.max_upload_bytes == 0 {
        errors.push("web.max_upload_bytes must be greater than zero".to_string());
    }

    if config.stage.container.trim().is_empty() {
        errors.push("stage.container must not be empty".to_string());
    }

    if config.stage.sas_expiry.is_zero() {
        errors.push("stage.sas_expiry must be greater than zero".to_string());
    }

    if config.extraction.poll_interval.is_zero() {
        errors.push("extraction.poll_interval must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}
