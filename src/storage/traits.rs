use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a batch request. Transitions only move forward:
/// queued -> processing -> done | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Done => "done",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Done | RequestStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Queued, RequestStatus::Processing)
                | (RequestStatus::Processing, RequestStatus::Done)
                | (RequestStatus::Processing, RequestStatus::Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RequestStatus::Queued),
            "processing" => Ok(RequestStatus::Processing),
            "done" => Ok(RequestStatus::Done),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown status '{}'", other))),
        }
    }
}

/// The statuses `mark_terminal` may move a record into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Done,
    Failed,
}

impl From<TerminalStatus> for RequestStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Done => RequestStatus::Done,
            TerminalStatus::Failed => RequestStatus::Failed,
        }
    }
}

impl FromStr for TerminalStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(TerminalStatus::Done),
            "failed" => Ok(TerminalStatus::Failed),
            other => Err(StoreError::Validation(format!(
                "'{}' is not a terminal status (expected done or failed)",
                other
            ))),
        }
    }
}

/// A deferred document-processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub id: Uuid,
    /// Partition key: requests are submitted in bulk per deployment
    pub model_deployment_name: String,
    pub instructions: String,
    pub response_schema: serde_json::Value,
    pub file_locators: Vec<String>,
    pub status: RequestStatus,
    pub batch_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied fields of a new batch request.
#[derive(Debug, Clone)]
pub struct NewBatchRequest {
    pub model_deployment_name: String,
    pub instructions: String,
    pub response_schema: serde_json::Value,
    pub file_locators: Vec<String>,
}

impl NewBatchRequest {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.file_locators.is_empty() {
            return Err(StoreError::Validation(
                "a batch request needs at least one file locator".to_string(),
            ));
        }
        if self.model_deployment_name.trim().is_empty() {
            return Err(StoreError::Validation(
                "model deployment name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates and turns the input into a fresh `queued` record.
    pub fn into_record(self) -> Result<BatchRequest, StoreError> {
        self.validate()?;
        Ok(BatchRequest {
            id: Uuid::new_v4(),
            model_deployment_name: self.model_deployment_name,
            instructions: self.instructions,
            response_schema: self.response_schema,
            file_locators: self.file_locators,
            status: RequestStatus::Queued,
            batch_id: None,
            result: None,
            created_at: Utc::now(),
        })
    }
}

/// Checks a single-record transition.
pub fn check_transition(
    id: Uuid,
    current: RequestStatus,
    requested: RequestStatus,
) -> Result<(), StoreError> {
    if current.can_transition_to(requested) {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            id,
            current,
            requested,
        })
    }
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid batch request: {0}")]
    Validation(String),

    #[error("batch request not found: {}", join_ids(.0))]
    NotFound(Vec<Uuid>),

    #[error("batch request {id} is {current} and cannot move to {requested}")]
    Conflict {
        id: Uuid,
        current: RequestStatus,
        requested: RequestStatus,
    },

    #[error("request store unavailable: {0}")]
    Unavailable(String),

    #[error("stored batch request is corrupt: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("request store configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Persistence for batch requests.
///
/// Implementations must make each status transition atomic: two callers
/// racing on the same id can never both succeed.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Prepares backing structures. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Persists a new `queued` record and returns its id.
    async fn create(&self, request: NewBatchRequest) -> Result<Uuid, StoreError>;

    async fn get(&self, id: Uuid) -> Result<BatchRequest, StoreError>;

    /// All `queued` records for one deployment, in no particular order.
    async fn list_queued(&self, model_deployment_name: &str)
        -> Result<Vec<BatchRequest>, StoreError>;

    /// Moves every named record from `queued` to `processing` under a shared
    /// batch id. All-or-nothing: if any id is unknown (`NotFound`) or not
    /// queued (`Conflict`), no record changes.
    async fn mark_processing(&self, ids: &[Uuid], batch_id: &str) -> Result<(), StoreError>;

    /// Moves one `processing` record to a terminal status, optionally
    /// attaching the result payload.
    async fn mark_terminal(
        &self,
        id: Uuid,
        status: TerminalStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_only() {
        use RequestStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Done));
        assert!(!Processing.can_transition_to(Queued));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Done));
        assert!(!Done.can_transition_to(Done));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RequestStatus::Queued,
            RequestStatus::Processing,
            RequestStatus::Done,
            RequestStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_terminal_status_parse() {
        assert_eq!("done".parse::<TerminalStatus>().unwrap(), TerminalStatus::Done);
        assert!(matches!(
            "processing".parse::<TerminalStatus>(),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_into_record_rejects_empty_locators() {
        let request = NewBatchRequest {
            model_deployment_name: "gpt-4.1-batch".to_string(),
            instructions: "extract name".to_string(),
            response_schema: serde_json::json!({}),
            file_locators: vec![],
        };
        assert!(matches!(
            request.into_record(),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_into_record_starts_queued() {
        let record = NewBatchRequest {
            model_deployment_name: "gpt-4.1-batch".to_string(),
            instructions: "extract name".to_string(),
            response_schema: serde_json::json!({"type": "object"}),
            file_locators: vec!["documents/a.png".to_string()],
        }
        .into_record()
        .unwrap();

        assert_eq!(record.status, RequestStatus::Queued);
        assert!(record.batch_id.is_none());
        assert!(record.result.is_none());
    }

    #[test]
    fn test_not_found_lists_ids() {
        let a = Uuid::nil();
        let err = StoreError::NotFound(vec![a]);
        assert_eq!(
            err.to_string(),
            "batch request not found: 00000000-0000-0000-0000-000000000000"
        );
    }
}
