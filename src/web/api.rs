use super::error::ApiError;
use super::form::{parse_document_form, DocumentForm, ProcessingMode};
use crate::clients::{CompletionClient, ImageInput, TextExtractor};
use crate::stage::{
    sanitize_file_name, ObjectStage, StagedBatch, StagedObject, StagingArea, UploadedFile,
};
use crate::storage::{BatchRequest, NewBatchRequest, RequestStore, StoreError};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, Path, State},
    Json,
};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const STATUS_MESSAGE: &str =
    "Document Processing API is running. Use /process_document endpoint to process documents.";

/// Shared state for the document API
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RequestStore>,
    pub stage: Arc<dyn ObjectStage>,
    pub extractor: Arc<dyn TextExtractor>,
    pub completion: Arc<dyn CompletionClient>,
    pub staging: Arc<StagingArea>,
    /// Container queued uploads are written to.
    pub container: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub message: &'static str,
    pub request_id: Uuid,
}

/// GET /
pub async fn root() -> Json<StatusResponse> {
    Json(StatusResponse {
        message: STATUS_MESSAGE,
    })
}

/// POST /process_document
///
/// Extracts text from every uploaded file and returns the model's
/// structured output. With `mode=vision` the files go to the model as
/// images and extraction is skipped.
pub async fn process_document(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, ApiError> {
    let form = parse_document_form(multipart).await?;
    let DocumentForm {
        files,
        deployment_name,
        instructions,
        schema,
        mode,
    } = form;

    let staged = stage_files(state.staging.clone(), files).await?;
    let result = match mode {
        ProcessingMode::Text => {
            extract_and_complete(&state, &staged, &instructions, &deployment_name, &schema).await
        }
        ProcessingMode::Vision => {
            complete_from_images(&state, &staged, &instructions, &deployment_name, &schema).await
        }
    };

    if let Err(e) = staged.close() {
        warn!(error = %e, "Failed to remove staged files");
    }

    result.map(Json)
}

async fn stage_files(
    staging: Arc<StagingArea>,
    files: Vec<UploadedFile>,
) -> Result<StagedBatch, ApiError> {
    tokio::task::spawn_blocking(move || staging.stage(&files))
        .await
        .map_err(ApiError::processing)?
        .map_err(ApiError::processing)
}

async fn extract_and_complete(
    state: &AppState,
    staged: &StagedBatch,
    instructions: &str,
    deployment_name: &str,
    schema: &Value,
) -> Result<Value, ApiError> {
    let extractions = staged.paths().iter().map(|path| async move {
        let bytes = tokio::fs::read(path).await.map_err(ApiError::processing)?;
        debug!(path = %path.display(), "Extracting staged document");
        state.extractor.extract(bytes).await.map_err(ApiError::processing)
    });
    let texts = try_join_all(extractions).await?;

    let output = state
        .completion
        .complete(&texts.join("\n\n"), instructions, deployment_name, schema)
        .await
        .map_err(ApiError::processing)?;

    info!(deployment = deployment_name, documents = texts.len(), "Processed documents");
    Ok(output)
}

async fn complete_from_images(
    state: &AppState,
    staged: &StagedBatch,
    instructions: &str,
    deployment_name: &str,
    schema: &Value,
) -> Result<Value, ApiError> {
    let reads = staged.paths().iter().map(|path| async move {
        let bytes = tokio::fs::read(path).await.map_err(ApiError::processing)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok::<_, ApiError>(ImageInput { file_name, bytes })
    });
    let images = try_join_all(reads).await?;

    let output = state
        .completion
        .complete_images(&images, instructions, deployment_name, schema)
        .await
        .map_err(ApiError::processing)?;

    info!(deployment = deployment_name, images = images.len(), "Processed documents as images");
    Ok(output)
}

/// POST /queue_document
///
/// Uploads the files to the object stage and records a queued request.
/// Nothing is recorded unless every upload succeeded; after a partial
/// failure the uploads that did land are deleted again.
pub async fn queue_document(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<QueuedResponse>, ApiError> {
    let form = parse_document_form(multipart).await?;

    let prefix = Uuid::new_v4();
    let items = form
        .files
        .into_iter()
        .enumerate()
        .map(|(i, file)| StagedObject {
            name: format!("{}/{}/{}", prefix, i, sanitize_file_name(&file.name, i)),
            bytes: file.bytes,
        })
        .collect();

    let outcomes = state.stage.put_many(&state.container, items).await;

    let mut file_locators = Vec::with_capacity(outcomes.len());
    let mut uploaded = Vec::with_capacity(outcomes.len());
    let mut failure = None;
    for outcome in outcomes {
        match outcome.result {
            Ok(locator) => {
                file_locators.push(locator);
                uploaded.push(outcome.name);
            }
            Err(e) if failure.is_none() => {
                failure = Some(format!("failed to upload {}: {}", outcome.name, e));
            }
            Err(_) => {}
        }
    }

    if let Some(message) = failure {
        discard_uploads(state.stage.as_ref(), &state.container, &uploaded).await;
        return Err(ApiError::processing(message));
    }

    let request_id = state
        .store
        .create(NewBatchRequest {
            model_deployment_name: form.deployment_name,
            instructions: form.instructions,
            response_schema: form.schema,
            file_locators,
        })
        .await
        .map_err(ApiError::processing)?;

    info!(request_id = %request_id, "Documents queued for processing");
    Ok(Json(QueuedResponse {
        message: "Documents queued for processing",
        request_id,
    }))
}

/// Best-effort removal of the objects a rejected submission left behind.
async fn discard_uploads(stage: &dyn ObjectStage, container: &str, names: &[String]) {
    for name in names {
        if let Err(e) = stage.delete(container, name).await {
            warn!(container, name = %name, error = %e, "Failed to remove orphaned upload");
        }
    }
}

/// GET /requests/:id
pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchRequest>, ApiError> {
    match state.store.get(id).await {
        Ok(request) => Ok(Json(request)),
        Err(StoreError::NotFound(_)) => Err(ApiError::NotFound("Request not found".to_string())),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}
