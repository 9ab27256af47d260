use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub web: WebConfig,
    pub store: StoreConfig,
    pub stage: StageConfig,
    pub staging: StagingConfig,
    pub extraction: ExtractionConfig,
    pub completion: CompletionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub listen: String,
    /// Upper bound on a multipart request body
    pub max_upload_bytes: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[serde(rename = "duckdb")]
    DuckDb,
    /// Azure Table Storage
    Table,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file for the relational backend
    pub path: PathBuf,
    pub table_name: String,
    /// Storage account for the table backend
    pub connection_string: Option<String>,
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::DuckDb,
            path: PathBuf::from("docproc.duckdb"),
            table_name: "BatchRequest".to_string(),
            connection_string: None,
            account_name: None,
            account_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageBackend {
    Azure,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub backend: StageBackend,
    /// Container that queued uploads land in
    pub container: String,
    pub connection_string: Option<String>,
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub local_root: PathBuf,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Lifetime of the read links handed to the batch service
    #[serde(with = "humantime_serde")]
    pub sas_expiry: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            backend: StageBackend::Azure,
            container: "documents".to_string(),
            connection_string: None,
            account_name: None,
            account_key: None,
            local_root: PathBuf::from("objects"),
            timeout: Duration::from_secs(60),
            sas_expiry: Duration::from_secs(48 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Parent directory for per-request scratch directories
    pub dir: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("document_processing"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub api_version: String,
    pub model: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            api_version: "2024-11-30".to_string(),
            model: "prebuilt-layout".to_string(),
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub api_version: Option<String>,
    pub batch_api_version: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            api_version: None,
            batch_api_version: "2024-02-15-preview".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Overlays recognised environment variables onto the loaded settings.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with an injectable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DOCPROC_LISTEN") {
            self.web.listen = v;
        }
        if let Some(v) = get("TABLE_NAME") {
            self.store.table_name = v;
        }
        if let Some(v) = get("SQL_DATABASE") {
            self.store.path = PathBuf::from(v);
        }
        // One storage account serves both blobs and tables
        if let Some(v) = get("STORAGE_CONNECTION_STRING") {
            self.stage.connection_string = Some(v.clone());
            self.store.connection_string = Some(v);
        }
        if let Some(v) = get("AZURE_STORAGE_ACCOUNT_NAME") {
            self.stage.account_name = Some(v.clone());
            self.store.account_name = Some(v);
        }
        if let Some(v) = get("AZURE_STORAGE_ACCOUNT_KEY") {
            self.stage.account_key = Some(v.clone());
            self.store.account_key = Some(v);
        }
        if let Some(v) = get("DOCUMENT_INTELLIGENCE_ENDPOINT") {
            self.extraction.endpoint = Some(v);
        }
        if let Some(v) = get("DOCUMENT_INTELLIGENCE_API_KEY") {
            self.extraction.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_ENDPOINT") {
            self.completion.endpoint = Some(v);
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.completion.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_API_VERSION") {
            self.completion.api_version = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.web.listen, "0.0.0.0:8000");
        assert_eq!(config.store.backend, StoreBackend::DuckDb);
        assert_eq!(config.store.table_name, "BatchRequest");
        assert_eq!(config.stage.container, "documents");
        assert_eq!(config.completion.batch_api_version, "2024-02-15-preview");
        assert!(config.completion.endpoint.is_none());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("OPENAI_ENDPOINT", "https://example.openai.azure.com"),
            ("OPENAI_API_KEY", "secret"),
            ("TABLE_NAME", "Requests"),
            ("STORAGE_CONNECTION_STRING", "AccountName=a;AccountKey=a2V5"),
            ("SQL_DATABASE", "/var/lib/docproc/requests.duckdb"),
            ("DOCUMENT_INTELLIGENCE_API_KEY", "   "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(
            config.completion.endpoint.as_deref(),
            Some("https://example.openai.azure.com")
        );
        assert_eq!(config.completion.api_key.as_deref(), Some("secret"));
        assert_eq!(config.store.table_name, "Requests");
        assert_eq!(
            config.store.path,
            PathBuf::from("/var/lib/docproc/requests.duckdb")
        );
        assert_eq!(
            config.store.connection_string,
            config.stage.connection_string
        );
        assert!(config.store.connection_string.is_some());
        // Blank values do not count as set
        assert!(config.extraction.api_key.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
store:
  backend: table
stage:
  backend: local
  local_root: /srv/objects
extraction:
  poll_interval: 250ms
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Table);
        assert_eq!(config.store.table_name, "BatchRequest");
        assert_eq!(config.stage.backend, StageBackend::Local);
        assert_eq!(config.stage.sas_expiry, Duration::from_secs(48 * 3600));
        assert_eq!(config.stage.local_root, PathBuf::from("/srv/objects"));
        assert_eq!(config.stage.container, "documents");
        assert_eq!(config.extraction.poll_interval, Duration::from_millis(250));
        assert_eq!(config.extraction.timeout, Duration::from_secs(120));
    }
}
