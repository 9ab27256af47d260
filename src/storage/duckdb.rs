use super::traits::{
    check_transition, BatchRequest, NewBatchRequest, RequestStatus, RequestStore, StoreError,
    TerminalStatus,
};
use async_trait::async_trait;
use chrono::DateTime;
use duckdb::{params, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "id, model_deployment_name, instructions, response_schema, \
     file_locators, status, batch_id, result, epoch_us(created_at)";

/// Row as stored: JSON columns are kept as text.
struct RawRow {
    id: String,
    model_deployment_name: String,
    instructions: String,
    response_schema: String,
    file_locators: String,
    status: String,
    batch_id: Option<String>,
    result: Option<String>,
    created_at_us: i64,
}

impl RawRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            model_deployment_name: row.get(1)?,
            instructions: row.get(2)?,
            response_schema: row.get(3)?,
            file_locators: row.get(4)?,
            status: row.get(5)?,
            batch_id: row.get(6)?,
            result: row.get(7)?,
            created_at_us: row.get(8)?,
        })
    }

    fn into_request(self) -> Result<BatchRequest, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("invalid id '{}': {}", self.id, e)))?;
        let created_at = DateTime::from_timestamp_micros(self.created_at_us)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid created_at for {}", id)))?;

        Ok(BatchRequest {
            id,
            model_deployment_name: self.model_deployment_name,
            instructions: self.instructions,
            response_schema: serde_json::from_str(&self.response_schema)?,
            file_locators: serde_json::from_str(&self.file_locators)?,
            status: self.status.parse()?,
            batch_id: self.batch_id,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            created_at,
        })
    }
}

/// Relational backend: one DuckDB table of batch requests.
pub struct DuckDbRequestStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl DuckDbRequestStore {
    /// Open (or create) a database file. `table` must already be a validated
    /// SQL identifier.
    pub fn new<P: AsRef<Path>>(path: P, table: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
        })
    }

    /// Create an in-memory DuckDB store (for testing)
    pub fn in_memory(table: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
        })
    }

    /// Runs blocking database work off the async runtime while holding the
    /// connection lock.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let table = self.table.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&mut conn, &table)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("task join error: {}", e)))?
    }
}

fn current_status(
    conn: &Connection,
    table: &str,
    id: Uuid,
) -> Result<Option<RequestStatus>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT status FROM \"{}\" WHERE id = ?", table))?;
    let mut rows = stmt.query(params![id.to_string()])?;

    match rows.next()? {
        Some(row) => {
            let status: String = row.get(0)?;
            Ok(Some(status.parse()?))
        }
        None => Ok(None),
    }
}

#[async_trait]
impl RequestStore for DuckDbRequestStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn, table| {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\" (
                        id VARCHAR PRIMARY KEY,
                        model_deployment_name VARCHAR NOT NULL,
                        instructions VARCHAR NOT NULL,
                        response_schema VARCHAR NOT NULL,
                        file_locators VARCHAR NOT NULL,
                        status VARCHAR NOT NULL,
                        batch_id VARCHAR,
                        result VARCHAR,
                        created_at TIMESTAMPTZ NOT NULL
                    )",
                    table
                ),
                [],
            )?;

            // Only immutable columns are indexed; status changes are row updates.
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{0}_model\" ON \"{0}\"(model_deployment_name)",
                    table
                ),
                [],
            )?;

            Ok(())
        })
        .await
    }

    async fn create(&self, request: NewBatchRequest) -> Result<Uuid, StoreError> {
        let record = request.into_record()?;
        let response_schema = serde_json::to_string(&record.response_schema)?;
        let file_locators = serde_json::to_string(&record.file_locators)?;
        let id = record.id;

        self.with_conn(move |conn, table| {
            conn.execute(
                &format!(
                    "INSERT INTO \"{}\" (id, model_deployment_name, instructions, response_schema,
                        file_locators, status, batch_id, result, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, to_timestamp(? / 1000000.0))",
                    table
                ),
                params![
                    record.id.to_string(),
                    record.model_deployment_name,
                    record.instructions,
                    response_schema,
                    file_locators,
                    record.status.as_str(),
                    record.created_at.timestamp_micros(),
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(request_id = %id, "Inserted batch request");
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<BatchRequest, StoreError> {
        let raw = self
            .with_conn(move |conn, table| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM \"{}\" WHERE id = ?",
                    SELECT_COLUMNS, table
                ))?;
                let mut rows = stmt.query(params![id.to_string()])?;
                match rows.next()? {
                    Some(row) => Ok(Some(RawRow::from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await?;

        raw.ok_or_else(|| StoreError::NotFound(vec![id]))?
            .into_request()
    }

    async fn list_queued(
        &self,
        model_deployment_name: &str,
    ) -> Result<Vec<BatchRequest>, StoreError> {
        let model = model_deployment_name.to_string();

        let raws = self
            .with_conn(move |conn, table| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM \"{}\" WHERE model_deployment_name = ? AND status = ?",
                    SELECT_COLUMNS, table
                ))?;
                let rows = stmt.query_map(
                    params![model, RequestStatus::Queued.as_str()],
                    RawRow::from_row,
                )?;

                let mut raws = Vec::new();
                for row in rows {
                    raws.push(row?);
                }
                Ok(raws)
            })
            .await?;

        raws.into_iter().map(RawRow::into_request).collect()
    }

    async fn mark_processing(&self, ids: &[Uuid], batch_id: &str) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let batch_id = batch_id.to_string();
        let count = ids.len();

        self.with_conn(move |conn, table| {
            let tx = conn.transaction()?;

            let mut missing = Vec::new();
            for id in &ids {
                match current_status(&tx, table, *id)? {
                    Some(status) => check_transition(*id, status, RequestStatus::Processing)?,
                    None => missing.push(*id),
                }
            }
            if !missing.is_empty() {
                // Dropping the transaction rolls it back.
                return Err(StoreError::NotFound(missing));
            }

            {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE \"{}\" SET status = ?, batch_id = ? WHERE id = ?",
                    table
                ))?;
                for id in &ids {
                    stmt.execute(params![
                        RequestStatus::Processing.as_str(),
                        batch_id,
                        id.to_string()
                    ])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::debug!(count, "Marked batch requests as processing");
        Ok(())
    }

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: TerminalStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let next = RequestStatus::from(status);
        let result = result.map(|r| serde_json::to_string(&r)).transpose()?;

        self.with_conn(move |conn, table| {
            let tx = conn.transaction()?;

            let current = current_status(&tx, table, id)?
                .ok_or_else(|| StoreError::NotFound(vec![id]))?;
            check_transition(id, current, next)?;

            tx.execute(
                &format!("UPDATE \"{}\" SET status = ?, result = ? WHERE id = ?", table),
                params![next.as_str(), result, id.to_string()],
            )?;

            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::debug!(request_id = %id, status = %next, "Marked batch request terminal");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_store() -> DuckDbRequestStore {
        let store = DuckDbRequestStore::in_memory("BatchRequest").unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn new_request(model: &str) -> NewBatchRequest {
        NewBatchRequest {
            model_deployment_name: model.to_string(),
            instructions: "extract name".to_string(),
            response_schema: json!({"name": "extract", "schema": {"type": "object"}}),
            file_locators: vec![
                "https://acct.blob.core.windows.net/documents/a.png".to_string(),
                "https://acct.blob.core.windows.net/documents/b.png".to_string(),
            ],
        }
    }

    #[tokio::test]
    async fn test_schema_initialization_is_idempotent() {
        let store = setup_store().await;
        store.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = setup_store().await;
        let id = store.create(new_request("gpt-4.1-batch")).await.unwrap();

        let record = store.get(id).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.model_deployment_name, "gpt-4.1-batch");
        assert_eq!(record.status, RequestStatus::Queued);
        assert_eq!(record.file_locators.len(), 2);
        assert_eq!(record.response_schema["name"], "extract");
        assert!(record.batch_id.is_none());
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn test_custom_table_name() {
        let store = DuckDbRequestStore::in_memory("Requests_v2").unwrap();
        store.init_schema().await.unwrap();
        let id = store.create(new_request("m")).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_list_queued_filters_model_and_status() {
        let store = setup_store().await;
        let a = store.create(new_request("model-a")).await.unwrap();
        let b = store.create(new_request("model-a")).await.unwrap();
        let _other = store.create(new_request("model-b")).await.unwrap();

        store.mark_processing(&[b], "batch-1").await.unwrap();

        let queued = store.list_queued("model-a").await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a);
    }

    #[tokio::test]
    async fn test_mark_processing_rolls_back_on_unknown_id() {
        let store = setup_store().await;
        let a = store.create(new_request("m")).await.unwrap();
        let unknown = Uuid::new_v4();

        let err = store.mark_processing(&[a, unknown], "batch-1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref ids) if ids == &vec![unknown]));

        let record = store.get(a).await.unwrap();
        assert_eq!(record.status, RequestStatus::Queued);
        assert!(record.batch_id.is_none());
    }

    #[tokio::test]
    async fn test_mark_terminal_stores_result() {
        let store = setup_store().await;
        let id = store.create(new_request("m")).await.unwrap();
        store.mark_processing(&[id], "batch-9").await.unwrap();
        store
            .mark_terminal(id, TerminalStatus::Done, Some(json!({"Name": "Ada"})))
            .await
            .unwrap();

        let record = store.get(id).await.unwrap();
        assert_eq!(record.status, RequestStatus::Done);
        assert_eq!(record.batch_id.as_deref(), Some("batch-9"));
        assert_eq!(record.result, Some(json!({"Name": "Ada"})));
    }

    #[tokio::test]
    async fn test_mark_terminal_twice_conflicts() {
        let store = setup_store().await;
        let id = store.create(new_request("m")).await.unwrap();
        store.mark_processing(&[id], "batch-1").await.unwrap();
        store.mark_terminal(id, TerminalStatus::Failed, None).await.unwrap();

        let err = store
            .mark_terminal(id, TerminalStatus::Done, Some(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                current: RequestStatus::Failed,
                requested: RequestStatus::Done,
                ..
            }
        ));
        assert!(store.get(id).await.unwrap().result.is_none());
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = setup_store().await;
        assert!(matches!(
            store.get(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("requests.duckdb");

        let id = {
            let store = DuckDbRequestStore::new(&path, "BatchRequest").unwrap();
            store.init_schema().await.unwrap();
            store.create(new_request("m")).await.unwrap()
        };

        let reopened = DuckDbRequestStore::new(&path, "BatchRequest").unwrap();
        reopened.init_schema().await.unwrap();
        assert_eq!(reopened.get(id).await.unwrap().status, RequestStatus::Queued);
    }
}
