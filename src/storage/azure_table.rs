//! Azure Table Storage backend (REST API, Shared Key Lite authorization)
//!
//! Entities are partitioned by model deployment and keyed by request id.
//! Every write is conditional on the ETag read just before it, so two
//! callers racing on one record cannot both succeed.

use super::traits::{
    check_transition, BatchRequest, NewBatchRequest, RequestStatus, RequestStore, StoreError,
    TerminalStatus,
};
use crate::account::{join_segments, ms_date, StorageAccount};
use crate::config::parse::is_table_storage_name;
use crate::config::{ConfigError, StoreConfig};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};
use uuid::Uuid;

const TABLE_API_VERSION: &str = "2019-02-02";
const ACCEPT_JSON: &str = "application/json;odata=minimalmetadata";
/// Upper bound on operations in one entity group transaction.
const MAX_TRANSACTION_OPERATIONS: usize = 100;

/// A batch request as stored in the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RequestEntity {
    partition_key: String,
    row_key: String,
    model_deployment_name: String,
    instructions: String,
    response_json: String,
    status: String,
    file_names: String,
    #[serde(default)]
    batch_id: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    created: String,
    #[serde(rename = "odata.etag", default, skip_serializing)]
    etag: Option<String>,
}

impl RequestEntity {
    fn from_record(record: &BatchRequest) -> Result<Self, StoreError> {
        Ok(Self {
            partition_key: record.model_deployment_name.clone(),
            row_key: record.id.to_string(),
            model_deployment_name: record.model_deployment_name.clone(),
            instructions: record.instructions.clone(),
            response_json: serde_json::to_string(&record.response_schema)?,
            status: record.status.to_string(),
            file_names: serde_json::to_string(&record.file_locators)?,
            batch_id: record.batch_id.clone().unwrap_or_default(),
            result: record
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?
                .unwrap_or_default(),
            created: record
                .created_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            etag: None,
        })
    }

    fn to_record(&self) -> Result<BatchRequest, StoreError> {
        let id = Uuid::parse_str(&self.row_key)
            .map_err(|e| StoreError::Corrupt(format!("invalid row key '{}': {}", self.row_key, e)))?;

        // Older writers joined file names with commas
        let file_locators = if self.file_names.trim_start().starts_with('[') {
            serde_json::from_str(&self.file_names)?
        } else {
            self.file_names
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        let result = match self.result.as_str() {
            "" => None,
            raw => Some(
                serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
            ),
        };

        Ok(BatchRequest {
            id,
            model_deployment_name: self.model_deployment_name.clone(),
            instructions: self.instructions.clone(),
            response_schema: serde_json::from_str(&self.response_json)?,
            file_locators,
            status: self.status.parse()?,
            batch_id: Some(self.batch_id.clone()).filter(|b| !b.is_empty()),
            result,
            created_at: parse_created(&self.created)
                .ok_or_else(|| StoreError::Corrupt(format!("invalid Created for {}", id)))?,
        })
    }

    fn etag(&self) -> Result<&str, StoreError> {
        self.etag
            .as_deref()
            .ok_or_else(|| StoreError::Corrupt(format!("entity {} came back without an ETag", self.row_key)))
    }
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
fn parse_created(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

#[derive(Debug, Deserialize)]
struct EntityPage {
    #[serde(default)]
    value: Vec<RequestEntity>,
}

/// Percent-encodes a query value, with spaces as `%20` rather than `+`.
fn encode_query_value(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// OData string literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Characters the table service refuses in key values.
fn check_key(value: &str) -> Result<(), StoreError> {
    if value.is_empty() || value.contains(['/', '\\', '#', '?']) || value.chars().any(char::is_control) {
        return Err(StoreError::Validation(format!(
            "'{}' cannot be used as a table key",
            value
        )));
    }
    Ok(())
}

/// Shared Key Lite string-to-sign for the table service.
pub(crate) fn string_to_sign(account_name: &str, date: &str, url: &Url) -> String {
    let mut out = format!("{}\n/{}{}", date, account_name, url.path());
    if let Some((_, comp)) = url.query_pairs().find(|(k, _)| k == "comp") {
        out.push_str("?comp=");
        out.push_str(&comp);
    }
    out
}

/// Status codes of the sub-responses inside a `$batch` response body.
fn changeset_statuses(body: &str) -> Vec<u16> {
    body.lines()
        .filter_map(|line| line.strip_prefix("HTTP/1.1 "))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|code| code.parse().ok())
        .collect()
}

/// One conditional replace inside a changeset.
struct Replace {
    url: Url,
    etag: String,
    body: String,
}

fn changeset_body(batch: &str, changeset: &str, operations: &[Replace]) -> String {
    let mut out = format!(
        "--{}\r\nContent-Type: multipart/mixed; boundary={}\r\n\r\n",
        batch, changeset
    );
    for op in operations {
        out.push_str(&format!(
            "--{changeset}\r\n\
             Content-Type: application/http\r\n\
             Content-Transfer-Encoding: binary\r\n\r\n\
             PUT {url} HTTP/1.1\r\n\
             Content-Type: application/json\r\n\
             Accept: {accept}\r\n\
             DataServiceVersion: 3.0;\r\n\
             If-Match: {etag}\r\n\r\n\
             {body}\r\n",
            changeset = changeset,
            url = op.url,
            accept = ACCEPT_JSON,
            etag = op.etag,
            body = op.body,
        ));
    }
    out.push_str(&format!("--{}--\r\n--{}--\r\n", changeset, batch));
    out
}

/// Request store backed by an Azure storage table.
pub struct TableRequestStore {
    client: reqwest::Client,
    account: Option<StorageAccount>,
    table: String,
}

impl TableRequestStore {
    pub fn new(
        account: Option<StorageAccount>,
        table: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        if !is_table_storage_name(table) {
            return Err(StoreError::Config(ConfigError::Validation(format!(
                "'{}' is not a valid table name",
                table
            ))));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            account,
            table: table.to_string(),
        })
    }

    /// Missing credentials are reported by the first call that needs them.
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let account = StorageAccount::from_settings(
            &config.connection_string,
            &config.account_name,
            &config.account_key,
        )?;
        if account.is_none() {
            warn!("No table storage credentials configured; requests will fail until STORAGE_CONNECTION_STRING is set");
        }

        Self::new(account, &config.table_name, config.timeout)
    }

    fn account(&self) -> Result<&StorageAccount, StoreError> {
        self.account
            .as_ref()
            .ok_or(StoreError::Config(ConfigError::Missing("STORAGE_CONNECTION_STRING")))
    }

    fn url(&self, segment: &str) -> Result<Url, StoreError> {
        Ok(join_segments(self.account()?.table_endpoint(), [segment])?)
    }

    fn entity_url(&self, partition_key: &str, row_key: &str) -> Result<Url, StoreError> {
        self.url(&format!(
            "{}(PartitionKey={},RowKey={})",
            self.table,
            quote(partition_key),
            quote(row_key)
        ))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<(String, &str)>,
        extra_headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, StoreError> {
        let account = self.account()?;
        let date = ms_date(Utc::now());
        let authorization = account.authorization(
            "SharedKeyLite",
            &string_to_sign(account.account_name(), &date, &url),
        )?;

        let mut request = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, authorization)
            .header("x-ms-date", date)
            .header("x-ms-version", TABLE_API_VERSION)
            .header(ACCEPT, ACCEPT_JSON)
            .header("DataServiceVersion", "3.0;NetFx")
            .header("MaxDataServiceVersion", "3.0;NetFx");
        for (name, value) in extra_headers {
            request = request.header(*name, *value);
        }
        if let Some((body, content_type)) = body {
            request = request.header(CONTENT_TYPE, content_type).body(body);
        }

        Ok(request.send().await?)
    }

    async fn unavailable(response: reqwest::Response) -> StoreError {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        StoreError::Unavailable(format!("table service returned {}: {}", status, message))
    }

    /// Runs an entity query, following continuation headers.
    async fn query(&self, filter: &str) -> Result<Vec<RequestEntity>, StoreError> {
        let mut entities = Vec::new();
        let mut continuation: Option<(String, String)> = None;

        loop {
            let mut url = self.url(&format!("{}()", self.table))?;
            let mut query = format!("$filter={}", encode_query_value(filter));
            if let Some((partition, row)) = &continuation {
                query.push_str(&format!(
                    "&NextPartitionKey={}&NextRowKey={}",
                    encode_query_value(partition),
                    encode_query_value(row)
                ));
            }
            url.set_query(Some(&query));

            let response = self.send(Method::GET, url, None, &[]).await?;
            if response.status() != StatusCode::OK {
                return Err(Self::unavailable(response).await);
            }

            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let next = header("x-ms-continuation-NextPartitionKey")
                .zip(header("x-ms-continuation-NextRowKey").or(Some(String::new())));

            let page: EntityPage = response.json().await?;
            entities.extend(page.value);

            match next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        Ok(entities)
    }

    /// Looks an id up across partitions.
    async fn find(&self, id: Uuid) -> Result<Option<RequestEntity>, StoreError> {
        let mut found = self.query(&format!("RowKey eq {}", quote(&id.to_string()))).await?;
        Ok(found.pop())
    }

    async fn replace(&self, entity: &RequestEntity) -> Result<StatusCode, StoreError> {
        let url = self.entity_url(&entity.partition_key, &entity.row_key)?;
        let body = serde_json::to_string(entity)?;
        let response = self
            .send(
                Method::PUT,
                url,
                Some((body, "application/json")),
                &[("If-Match", entity.etag()?)],
            )
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(StatusCode::NO_CONTENT),
            StatusCode::PRECONDITION_FAILED | StatusCode::NOT_FOUND => Ok(response.status()),
            _ => Err(Self::unavailable(response).await),
        }
    }

    /// Explains a conditional write that lost a race: re-reads each record
    /// and reports the first that can no longer make the transition.
    async fn lost_race(&self, ids: &[Uuid], requested: RequestStatus) -> StoreError {
        for &id in ids {
            match self.find(id).await {
                Ok(Some(entity)) => match entity.to_record() {
                    Ok(record) => {
                        if let Err(conflict) = check_transition(id, record.status, requested) {
                            return conflict;
                        }
                    }
                    Err(e) => return e,
                },
                Ok(None) => return StoreError::NotFound(vec![id]),
                Err(e) => return e,
            }
        }
        StoreError::Unavailable("batch request was modified concurrently; retry".to_string())
    }
}

#[async_trait]
impl RequestStore for TableRequestStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        if self.account.is_none() {
            return Ok(());
        }

        let body = serde_json::json!({ "TableName": self.table }).to_string();
        let response = self
            .send(
                Method::POST,
                self.url("Tables")?,
                Some((body, "application/json")),
                &[("Prefer", "return-no-content")],
            )
            .await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => {
                info!(table = %self.table, "Created request table")
            }
            StatusCode::CONFLICT => debug!(table = %self.table, "Request table already exists"),
            _ => return Err(Self::unavailable(response).await),
        }
        Ok(())
    }

    async fn create(&self, request: NewBatchRequest) -> Result<Uuid, StoreError> {
        let record = request.into_record()?;
        check_key(&record.model_deployment_name)?;
        let entity = RequestEntity::from_record(&record)?;

        let response = self
            .send(
                Method::POST,
                self.url(&self.table)?,
                Some((serde_json::to_string(&entity)?, "application/json")),
                &[("Prefer", "return-no-content")],
            )
            .await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => {
                debug!(request_id = %record.id, partition = %entity.partition_key, "Inserted request entity");
                Ok(record.id)
            }
            _ => Err(Self::unavailable(response).await),
        }
    }

    async fn get(&self, id: Uuid) -> Result<BatchRequest, StoreError> {
        match self.find(id).await? {
            Some(entity) => entity.to_record(),
            None => Err(StoreError::NotFound(vec![id])),
        }
    }

    async fn list_queued(
        &self,
        model_deployment_name: &str,
    ) -> Result<Vec<BatchRequest>, StoreError> {
        let filter = format!(
            "PartitionKey eq {} and Status eq {}",
            quote(model_deployment_name),
            quote(RequestStatus::Queued.as_str())
        );
        self.query(&filter)
            .await?
            .iter()
            .map(RequestEntity::to_record)
            .collect()
    }

    /// All ids must share one deployment: an entity group transaction
    /// covers a single partition.
    async fn mark_processing(&self, ids: &[Uuid], batch_id: &str) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return Ok(());
        }
        if ids.len() > MAX_TRANSACTION_OPERATIONS {
            return Err(StoreError::Validation(format!(
                "cannot move more than {} requests in one transaction",
                MAX_TRANSACTION_OPERATIONS
            )));
        }

        let mut entities = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for &id in &ids {
            match self.find(id).await? {
                Some(entity) => entities.push(entity),
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::NotFound(missing));
        }

        let mut operations = Vec::with_capacity(entities.len());
        for entity in &entities {
            let record = entity.to_record()?;
            check_transition(record.id, record.status, RequestStatus::Processing)?;
            if entity.partition_key != entities[0].partition_key {
                return Err(StoreError::Validation(format!(
                    "requests span deployments '{}' and '{}'",
                    entities[0].partition_key, entity.partition_key
                )));
            }

            let updated = RequestEntity {
                status: RequestStatus::Processing.to_string(),
                batch_id: batch_id.to_string(),
                ..entity.clone()
            };
            operations.push(Replace {
                url: self.entity_url(&entity.partition_key, &entity.row_key)?,
                etag: entity.etag()?.to_string(),
                body: serde_json::to_string(&updated)?,
            });
        }

        let batch_boundary = format!("batch_{}", Uuid::new_v4());
        let changeset_boundary = format!("changeset_{}", Uuid::new_v4());
        let body = changeset_body(&batch_boundary, &changeset_boundary, &operations);
        let content_type = format!("multipart/mixed; boundary={}", batch_boundary);

        let response = self
            .send(Method::POST, self.url("$batch")?, Some((body, content_type.as_str())), &[])
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Self::unavailable(response).await);
        }

        let text = response.text().await?;
        let statuses = changeset_statuses(&text);
        if statuses.is_empty() || statuses.iter().any(|s| !(200..300).contains(s)) {
            if statuses.iter().any(|&s| s == 412 || s == 404) {
                return Err(self.lost_race(&ids, RequestStatus::Processing).await);
            }
            return Err(StoreError::Unavailable(format!(
                "table transaction rejected: {}",
                text.trim()
            )));
        }

        debug!(count = ids.len(), batch_id, "Marked requests processing");
        Ok(())
    }

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: TerminalStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let entity = self
            .find(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(vec![id]))?;
        let record = entity.to_record()?;
        let requested = RequestStatus::from(status);
        check_transition(id, record.status, requested)?;

        let updated = RequestEntity {
            status: requested.to_string(),
            result: match &result {
                Some(value) => serde_json::to_string(value)?,
                None => entity.result.clone(),
            },
            ..entity
        };

        match self.replace(&updated).await? {
            StatusCode::NO_CONTENT => {
                debug!(request_id = %id, status = %requested, "Marked request terminal");
                Ok(())
            }
            _ => Err(self.lost_race(&[id], requested).await),
        }
    }
}
