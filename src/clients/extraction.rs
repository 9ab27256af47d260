use crate::config::{require, ConfigError, ExtractionConfig};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const OPERATION_LOCATION_HEADER: &str = "Operation-Location";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("text extraction request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("text extraction service returned error status {status}: {message}")]
    Service { status: u16, message: String },

    #[error("text extraction service did not return an operation location")]
    MissingOperation,

    #[error("document analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("document analysis did not finish within {0:?}")]
    Timeout(Duration),

    #[error("text extraction configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Turns a document into text the completion model can read.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, document: Vec<u8>) -> Result<String, ExtractionError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum AnalyzeStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOperation {
    status: AnalyzeStatus,
    #[serde(default)]
    analyze_result: Option<AnalyzeResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResult {
    #[serde(default)]
    content: String,
}

/// Azure Document Intelligence layout analysis with markdown output.
#[derive(Debug)]
pub struct DocumentIntelligenceClient {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    api_version: String,
    model: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl DocumentIntelligenceClient {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            model: config.model.clone(),
            poll_interval: config.poll_interval,
            timeout: config.timeout,
        })
    }

    fn analyze_url(&self) -> Result<String, ExtractionError> {
        let endpoint = require(&self.endpoint, "DOCUMENT_INTELLIGENCE_ENDPOINT")?;
        Ok(format!(
            "{}/documentintelligence/documentModels/{}:analyze?api-version={}&outputContentFormat=markdown",
            endpoint.trim_end_matches('/'),
            self.model,
            self.api_version
        ))
    }

    async fn service_error(response: reqwest::Response) -> ExtractionError {
        ExtractionError::Service {
            status: response.status().as_u16(),
            message: response.text().await.unwrap_or_default(),
        }
    }

    async fn begin_analyze(&self, api_key: &str, document: Vec<u8>) -> Result<String, ExtractionError> {
        let response = self
            .client
            .post(self.analyze_url()?)
            .header(SUBSCRIPTION_KEY_HEADER, api_key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(document)
            .send()
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(Self::service_error(response).await);
        }

        response
            .headers()
            .get(OPERATION_LOCATION_HEADER)
            .or_else(|| response.headers().get(LOCATION))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(ExtractionError::MissingOperation)
    }

    async fn poll(&self, api_key: &str, operation: &str) -> Result<String, ExtractionError> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let response = self
                .client
                .get(operation)
                .header(SUBSCRIPTION_KEY_HEADER, api_key)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(Self::service_error(response).await);
            }

            let op: AnalyzeOperation = response.json().await?;
            match op.status {
                AnalyzeStatus::Succeeded => {
                    return Ok(op.analyze_result.map(|r| r.content).unwrap_or_default());
                }
                AnalyzeStatus::Failed | AnalyzeStatus::Canceled => {
                    let detail = op
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no error details".to_string());
                    return Err(ExtractionError::AnalysisFailed(detail));
                }
                AnalyzeStatus::NotStarted | AnalyzeStatus::Running | AnalyzeStatus::Unknown => {
                    debug!(operation, "Document analysis still running");
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(ExtractionError::Timeout(self.timeout));
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl TextExtractor for DocumentIntelligenceClient {
    async fn extract(&self, document: Vec<u8>) -> Result<String, ExtractionError> {
        let api_key = require(&self.api_key, "DOCUMENT_INTELLIGENCE_API_KEY")?;
        let size = document.len();

        let operation = self.begin_analyze(api_key, document).await?;
        let text = self.poll(api_key, &operation).await?;

        info!(size, chars = text.len(), "Extracted document text");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: Option<&str>) -> ExtractionConfig {
        ExtractionConfig {
            endpoint: endpoint.map(str::to_string),
            api_key: Some("key".to_string()),
            ..ExtractionConfig::default()
        }
    }

    #[test]
    fn test_analyze_url() {
        let client = DocumentIntelligenceClient::new(&config(Some("https://di.example.com/"))).unwrap();
        assert_eq!(
            client.analyze_url().unwrap(),
            "https://di.example.com/documentintelligence/documentModels/prebuilt-layout:analyze?api-version=2024-11-30&outputContentFormat=markdown"
        );
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_reported() {
        let client = DocumentIntelligenceClient::new(&config(None)).unwrap();
        let err = client.extract(b"%PDF".to_vec()).await.unwrap_err();
        assert!(err.to_string().contains("DOCUMENT_INTELLIGENCE_ENDPOINT"));
    }

    #[test]
    fn test_operation_status_parsing() {
        let op: AnalyzeOperation = serde_json::from_str(
            r##"{"status":"succeeded","analyzeResult":{"content":"# Title"}}"##,
        )
        .unwrap();
        assert!(matches!(op.status, AnalyzeStatus::Succeeded));
        assert_eq!(op.analyze_result.unwrap().content, "# Title");

        let op: AnalyzeOperation = serde_json::from_str(r#"{"status":"somethingNew"}"#).unwrap();
        assert!(matches!(op.status, AnalyzeStatus::Unknown));
    }
}
