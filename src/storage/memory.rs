use super::traits::{
    check_transition, BatchRequest, NewBatchRequest, RequestStatus, RequestStore, StoreError,
    TerminalStatus,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

type Partitions = HashMap<String, HashMap<Uuid, BatchRequest>>;

/// Process-local backend laid out like the table store: records are grouped
/// into partitions by deployment name and keyed by id within a partition.
/// Nothing outlives the process, so out-of-process tools cannot see it.
#[derive(Default)]
pub struct MemoryRequestStore {
    partitions: Mutex<Partitions>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Partitions>, StoreError> {
        self.partitions
            .lock()
            .map_err(|_| StoreError::Unavailable("partition lock poisoned".to_string()))
    }
}

/// Lookup by row key alone has to scan every partition.
fn find_mut(partitions: &mut Partitions, id: Uuid) -> Option<&mut BatchRequest> {
    partitions
        .values_mut()
        .find_map(|partition| partition.get_mut(&id))
}

fn find(partitions: &Partitions, id: Uuid) -> Option<&BatchRequest> {
    partitions.values().find_map(|partition| partition.get(&id))
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn create(&self, request: NewBatchRequest) -> Result<Uuid, StoreError> {
        let record = request.into_record()?;
        let id = record.id;

        let mut partitions = self.lock()?;
        partitions
            .entry(record.model_deployment_name.clone())
            .or_default()
            .insert(id, record);

        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<BatchRequest, StoreError> {
        let partitions = self.lock()?;
        find(&partitions, id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(vec![id]))
    }

    async fn list_queued(
        &self,
        model_deployment_name: &str,
    ) -> Result<Vec<BatchRequest>, StoreError> {
        let partitions = self.lock()?;
        Ok(partitions
            .get(model_deployment_name)
            .map(|partition| {
                partition
                    .values()
                    .filter(|r| r.status == RequestStatus::Queued)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_processing(&self, ids: &[Uuid], batch_id: &str) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut partitions = self.lock()?;

        // Validate everything before touching anything.
        let mut missing = Vec::new();
        for id in ids {
            match find(&partitions, *id) {
                Some(record) => check_transition(*id, record.status, RequestStatus::Processing)?,
                None => {
                    if !missing.contains(id) {
                        missing.push(*id);
                    }
                }
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::NotFound(missing));
        }

        for id in ids {
            if let Some(record) = find_mut(&mut partitions, *id) {
                record.status = RequestStatus::Processing;
                record.batch_id = Some(batch_id.to_string());
            }
        }

        Ok(())
    }

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: TerminalStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let next = RequestStatus::from(status);
        let mut partitions = self.lock()?;

        let record = find_mut(&mut partitions, id).ok_or_else(|| StoreError::NotFound(vec![id]))?;
        check_transition(id, record.status, next)?;

        record.status = next;
        record.result = result;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_request(model: &str) -> NewBatchRequest {
        NewBatchRequest {
            model_deployment_name: model.to_string(),
            instructions: "extract name".to_string(),
            response_schema: json!({"type": "object"}),
            file_locators: vec!["documents/a.png".to_string()],
        }
    }

    #[tokio::test]
    async fn test_records_are_partitioned_by_model() {
        let store = MemoryRequestStore::new();
        store.create(new_request("a")).await.unwrap();
        store.create(new_request("a")).await.unwrap();
        store.create(new_request("b")).await.unwrap();

        let partitions = store.partitions.lock().unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions["a"].len(), 2);
        assert_eq!(partitions["b"].len(), 1);
    }

    #[tokio::test]
    async fn test_list_queued_unknown_model_is_empty() {
        let store = MemoryRequestStore::new();
        assert!(store.list_queued("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_processing_conflict_leaves_others_untouched() {
        let store = MemoryRequestStore::new();
        let a = store.create(new_request("m")).await.unwrap();
        let b = store.create(new_request("m")).await.unwrap();
        store.mark_processing(&[a], "batch-1").await.unwrap();

        let err = store.mark_processing(&[b, a], "batch-2").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { id, .. } if id == a));

        assert_eq!(store.get(b).await.unwrap().status, RequestStatus::Queued);
        assert_eq!(
            store.get(a).await.unwrap().batch_id.as_deref(),
            Some("batch-1")
        );
    }

    #[tokio::test]
    async fn test_mark_terminal_from_queued_conflicts() {
        let store = MemoryRequestStore::new();
        let id = store.create(new_request("m")).await.unwrap();

        let err = store
            .mark_terminal(id, TerminalStatus::Done, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }
}
