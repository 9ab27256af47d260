//! Multipart form shared by both document endpoints

use super::error::ApiError;
use crate::stage::UploadedFile;
use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::http::StatusCode;
use serde_json::Value;

/// How the synchronous endpoint hands documents to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Extract text first, then complete over the markdown.
    #[default]
    Text,
    /// Send the documents themselves as images.
    Vision,
}

impl std::str::FromStr for ProcessingMode {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "text" => Ok(Self::Text),
            "vision" => Ok(Self::Vision),
            other => Err(ApiError::BadRequest(format!(
                "Unknown mode '{}', expected 'text' or 'vision'",
                other
            ))),
        }
    }
}

/// A validated document submission.
#[derive(Debug)]
pub struct DocumentForm {
    pub files: Vec<UploadedFile>,
    pub deployment_name: String,
    pub instructions: String,
    pub schema: Value,
    pub mode: ProcessingMode,
}

fn malformed(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::BadRequest(format!("Malformed multipart body: {}", err.body_text()))
    }
}

fn missing(field: &str) -> ApiError {
    ApiError::BadRequest(format!("Missing form field: {}", field))
}

/// Reads `files`, `deployment_name`, `instructions`, `schema` and the
/// optional `mode` from the body. Checks run in order: at least one file,
/// schema is JSON, then the remaining text fields. Unknown fields are
/// ignored.
pub async fn parse_document_form(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<DocumentForm, ApiError> {
    let mut multipart = multipart.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let mut files = Vec::new();
    let mut deployment_name = None;
    let mut instructions = None;
    let mut schema = None;
    let mut mode = None;

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(malformed)?;
                // Browsers send an empty part when no file was chosen.
                if file_name.is_empty() && bytes.is_empty() {
                    continue;
                }
                files.push(UploadedFile {
                    name: file_name,
                    bytes: bytes.to_vec(),
                });
            }
            "deployment_name" => deployment_name = Some(field.text().await.map_err(malformed)?),
            "instructions" => instructions = Some(field.text().await.map_err(malformed)?),
            "schema" => schema = Some(field.text().await.map_err(malformed)?),
            "mode" => mode = Some(field.text().await.map_err(malformed)?),
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(ApiError::BadRequest("No files provided".to_string()));
    }

    let schema = schema.ok_or_else(|| missing("schema"))?;
    let schema: Value = serde_json::from_str(&schema)
        .map_err(|_| ApiError::BadRequest("Invalid JSON schema".to_string()))?;

    let deployment_name = deployment_name
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| missing("deployment_name"))?;
    let instructions = instructions.ok_or_else(|| missing("instructions"))?;
    let mode = match mode {
        Some(mode) => mode.parse()?,
        None => ProcessingMode::default(),
    };

    Ok(DocumentForm {
        files,
        deployment_name,
        instructions,
        schema,
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("".parse::<ProcessingMode>().unwrap(), ProcessingMode::Text);
        assert_eq!("text".parse::<ProcessingMode>().unwrap(), ProcessingMode::Text);
        assert_eq!(" vision ".parse::<ProcessingMode>().unwrap(), ProcessingMode::Vision);
        assert!(matches!(
            "audio".parse::<ProcessingMode>(),
            Err(ApiError::BadRequest(_))
        ));
    }
}
