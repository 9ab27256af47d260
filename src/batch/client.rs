use crate::config::{require, CompletionConfig, ConfigError};
use crate::storage::BatchRequest;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("nothing to submit")]
    Empty,

    #[error("batch mixes model deployments '{first}' and '{other}'")]
    MixedDeployments { first: String, other: String },

    #[error("batch request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("batch endpoint returned error status {status}: {message}")]
    Service { status: u16, message: String },

    #[error("batch endpoint response had no job id")]
    MissingJobId,

    #[error("failed to serialize batch payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("batch configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Submits queued requests to a bulk completion endpoint as one job.
#[async_trait]
pub trait BatchSubmitter: Send + Sync {
    /// Either the whole batch is accepted and its job id returned, or
    /// nothing is submitted.
    async fn submit(&self, requests: &[BatchRequest]) -> Result<String, SubmissionError>;
}

#[derive(Debug, Serialize)]
struct BatchLine<'a> {
    custom_id: Uuid,
    instructions: &'a str,
    response_json: &'a Value,
    file_names: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BatchJob {
    #[serde(default)]
    id: Option<String>,
}

/// Checks that `requests` is non-empty and targets one deployment, which is
/// returned.
pub fn common_deployment(requests: &[BatchRequest]) -> Result<&str, SubmissionError> {
    let first = requests.first().ok_or(SubmissionError::Empty)?;
    let name = first.model_deployment_name.as_str();

    if let Some(other) = requests.iter().find(|r| r.model_deployment_name != name) {
        return Err(SubmissionError::MixedDeployments {
            first: name.to_string(),
            other: other.model_deployment_name.clone(),
        });
    }
    Ok(name)
}

/// Serializes requests into the JSONL job payload, one line each.
pub fn build_payload(requests: &[BatchRequest]) -> Result<String, SubmissionError> {
    let mut payload = String::new();
    for request in requests {
        let line = BatchLine {
            custom_id: request.id,
            instructions: &request.instructions,
            response_json: &request.response_schema,
            file_names: &request.file_locators,
        };
        payload.push_str(&serde_json::to_string(&line)?);
        payload.push('\n');
    }
    Ok(payload)
}

/// Azure OpenAI batch jobs endpoint.
#[derive(Debug)]
pub struct AzureBatchClient {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    api_version: String,
}

impl AzureBatchClient {
    pub fn new(config: &CompletionConfig) -> Result<Self, SubmissionError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            api_version: config.batch_api_version.clone(),
        })
    }

    fn jobs_url(&self, deployment: &str) -> Result<String, SubmissionError> {
        let endpoint = require(&self.endpoint, "OPENAI_ENDPOINT")?;
        Ok(format!(
            "{}/openai/deployments/{}/batch/jobs?api-version={}",
            endpoint.trim_end_matches('/'),
            deployment,
            self.api_version
        ))
    }
}

#[async_trait]
impl BatchSubmitter for AzureBatchClient {
    async fn submit(&self, requests: &[BatchRequest]) -> Result<String, SubmissionError> {
        let deployment = common_deployment(requests)?;
        let url = self.jobs_url(deployment)?;
        let api_key = require(&self.api_key, "OPENAI_API_KEY")?;
        let payload = build_payload(requests)?;

        let response = self
            .client
            .post(&url)
            .header("api-key", api_key)
            .header(CONTENT_TYPE, "application/jsonl")
            .body(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SubmissionError::Service {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let job: BatchJob = response.json().await?;
        let batch_id = job
            .id
            .filter(|id| !id.is_empty())
            .ok_or(SubmissionError::MissingJobId)?;

        info!(deployment, batch_id, count = requests.len(), "Submitted batch job");
        Ok(batch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewBatchRequest;
    use serde_json::json;

    fn request(model: &str) -> BatchRequest {
        NewBatchRequest {
            model_deployment_name: model.to_string(),
            instructions: "extract name".to_string(),
            response_schema: json!({"name": "person"}),
            file_locators: vec!["a.png".to_string(), "b.png".to_string()],
        }
        .into_record()
        .unwrap()
    }

    #[test]
    fn test_build_payload_one_line_per_request() {
        let requests = vec![request("m"), request("m")];
        let payload = build_payload(&requests).unwrap();

        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["custom_id"], json!(requests[0].id.to_string()));
        assert_eq!(first["instructions"], "extract name");
        assert_eq!(first["response_json"], json!({"name": "person"}));
        assert_eq!(first["file_names"], json!(["a.png", "b.png"]));
    }

    #[test]
    fn test_common_deployment() {
        assert!(matches!(common_deployment(&[]), Err(SubmissionError::Empty)));
        assert_eq!(common_deployment(&[request("m"), request("m")]).unwrap(), "m");
        assert!(matches!(
            common_deployment(&[request("m"), request("n")]),
            Err(SubmissionError::MixedDeployments { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_submit_fails_before_network() {
        let client = AzureBatchClient::new(&CompletionConfig::default()).unwrap();
        assert!(matches!(client.submit(&[]).await, Err(SubmissionError::Empty)));
    }
}
