use super::client::{BatchSubmitter, SubmissionError};
use crate::stage::{ObjectStage, StageError};
use crate::storage::{BatchRequest, RequestStore, StoreError};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error("failed to share stored documents: {0}")]
    Sharing(#[from] StageError),
}

/// A job accepted by the batch endpoint and the requests it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedBatch {
    pub batch_id: String,
    pub request_ids: Vec<Uuid>,
}

/// Replaces stored locators with time-limited read links before they
/// leave for the batch service. Records in the store keep the plain
/// locators.
pub struct LinkSharing<'a> {
    pub stage: &'a dyn ObjectStage,
    pub container: &'a str,
    pub expiry: Duration,
}

impl LinkSharing<'_> {
    pub fn share(&self, request: &BatchRequest) -> Result<BatchRequest, StageError> {
        let mut shared = request.clone();
        for locator in &mut shared.file_locators {
            match self.stage.object_name(self.container, locator) {
                Some(name) => *locator = self.stage.sas_url(self.container, &name, self.expiry)?,
                None => {
                    warn!(request_id = %request.id, locator = %locator, "Locator is not in the object stage; passing it through unsigned")
                }
            }
        }
        Ok(shared)
    }
}

/// Submits every queued request for `deployment` as one batch job and
/// moves them to `processing`. Returns `None` when nothing is queued.
///
/// A rejected submission leaves every request queued. If the job is
/// accepted but the store update fails, the batch id is logged so the
/// records can be reconciled by hand.
pub async fn submit_queued(
    store: &dyn RequestStore,
    submitter: &dyn BatchSubmitter,
    deployment: &str,
    sharing: Option<&LinkSharing<'_>>,
) -> Result<Option<SubmittedBatch>, DriverError> {
    let queued = store.list_queued(deployment).await?;
    if queued.is_empty() {
        info!(deployment, "No queued requests");
        return Ok(None);
    }

    let outgoing = match sharing {
        Some(sharing) => queued
            .iter()
            .map(|request| sharing.share(request))
            .collect::<Result<Vec<_>, _>>()?,
        None => queued,
    };

    let batch_id = submitter.submit(&outgoing).await?;
    let request_ids: Vec<Uuid> = outgoing.iter().map(|r| r.id).collect();

    if let Err(e) = store.mark_processing(&request_ids, &batch_id).await {
        error!(deployment, batch_id, error = %e, "Batch submitted but requests could not be marked processing");
        return Err(e.into());
    }

    info!(deployment, batch_id, count = request_ids.len(), "Queued requests moved to processing");
    Ok(Some(SubmittedBatch {
        batch_id,
        request_ids,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::LocalObjectStage;
    use crate::storage::{MemoryRequestStore, NewBatchRequest, RequestStatus};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingSubmitter {
        seen: Mutex<Vec<usize>>,
        locators: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingSubmitter {
        fn new(fail: bool) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                locators: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl BatchSubmitter for RecordingSubmitter {
        async fn submit(&self, requests: &[BatchRequest]) -> Result<String, SubmissionError> {
            self.seen.lock().unwrap().push(requests.len());
            for request in requests {
                self.locators
                    .lock()
                    .unwrap()
                    .extend(request.file_locators.iter().cloned());
            }
            if self.fail {
                Err(SubmissionError::Service {
                    status: 500,
                    message: "boom".to_string(),
                })
            } else {
                Ok("batch-42".to_string())
            }
        }
    }

    fn new_request(model: &str) -> NewBatchRequest {
        NewBatchRequest {
            model_deployment_name: model.to_string(),
            instructions: "extract".to_string(),
            response_schema: json!({}),
            file_locators: vec!["x.png".to_string()],
        }
    }

    #[tokio::test]
    async fn test_submit_queued_marks_processing() {
        let store = MemoryRequestStore::new();
        let a = store.create(new_request("m")).await.unwrap();
        let b = store.create(new_request("m")).await.unwrap();
        let other = store.create(new_request("n")).await.unwrap();

        let submitter = RecordingSubmitter::new(false);
        let submitted = submit_queued(&store, &submitter, "m", None).await.unwrap().unwrap();

        assert_eq!(submitted.batch_id, "batch-42");
        assert_eq!(submitted.request_ids.len(), 2);
        for id in [a, b] {
            let record = store.get(id).await.unwrap();
            assert_eq!(record.status, RequestStatus::Processing);
            assert_eq!(record.batch_id.as_deref(), Some("batch-42"));
        }
        assert_eq!(store.get(other).await.unwrap().status, RequestStatus::Queued);
        assert_eq!(*submitter.seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_nothing_queued_skips_submission() {
        let store = MemoryRequestStore::new();
        let submitter = RecordingSubmitter::new(false);

        assert_eq!(submit_queued(&store, &submitter, "m", None).await.unwrap(), None);
        assert!(submitter.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_submission_leaves_requests_queued() {
        let store = MemoryRequestStore::new();
        let id = store.create(new_request("m")).await.unwrap();
        let submitter = RecordingSubmitter::new(true);

        let err = submit_queued(&store, &submitter, "m", None).await.unwrap_err();
        assert!(matches!(err, DriverError::Submission(_)));
        assert_eq!(store.get(id).await.unwrap().status, RequestStatus::Queued);
    }

    /// Signs every locator it recognises as `<locator>?signed=<secs>`.
    struct SigningStage;

    #[async_trait]
    impl ObjectStage for SigningStage {
        async fn put(&self, _: &str, _: Vec<u8>, name: &str) -> Result<String, StageError> {
            Ok(name.to_string())
        }

        async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>, StageError> {
            Err(StageError::NotFound {
                container: container.to_string(),
                name: name.to_string(),
            })
        }

        async fn delete(&self, _: &str, _: &str) -> Result<(), StageError> {
            Ok(())
        }

        async fn list(&self, _: &str, _: Option<&str>) -> Result<Vec<String>, StageError> {
            Ok(Vec::new())
        }

        fn sas_url(&self, container: &str, name: &str, expiry: Duration) -> Result<String, StageError> {
            Ok(format!("{}/{}?signed={}", container, name, expiry.as_secs()))
        }

        fn object_name(&self, container: &str, locator: &str) -> Option<String> {
            LocalObjectStage::new("unused").object_name(container, locator)
        }
    }

    #[tokio::test]
    async fn test_submission_carries_signed_links() {
        let store = MemoryRequestStore::new();
        let id = store
            .create(NewBatchRequest {
                file_locators: vec![
                    "documents/r/0/a.png".to_string(),
                    "https://elsewhere.example/b.png".to_string(),
                ],
                ..new_request("m")
            })
            .await
            .unwrap();

        let submitter = RecordingSubmitter::new(false);
        let sharing = LinkSharing {
            stage: &SigningStage,
            container: "documents",
            expiry: Duration::from_secs(7200),
        };
        submit_queued(&store, &submitter, "m", Some(&sharing))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            *submitter.locators.lock().unwrap(),
            vec![
                "documents/r/0/a.png?signed=7200".to_string(),
                "https://elsewhere.example/b.png".to_string(),
            ]
        );
        // The stored record keeps the unsigned locators
        assert_eq!(
            store.get(id).await.unwrap().file_locators[0],
            "documents/r/0/a.png"
        );
    }
}
