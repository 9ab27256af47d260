use crate::config::{require, CompletionConfig, ConfigError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

pub const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that can extract information from a markdown document.";

/// System instruction when the documents are sent to the model as images.
pub const VISION_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion service returned error status {status}: {message}")]
    Service { status: u16, message: String },

    #[error("model refused the request: {0}")]
    Refused(String),

    #[error("model output is not valid JSON: {0}")]
    InvalidOutput(String),

    #[error("completion configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Structured-output chat completion over extracted document text.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        text: &str,
        instructions: &str,
        model_deployment_name: &str,
        response_schema: &Value,
    ) -> Result<Value, CompletionError>;

    /// Same contract as [`CompletionClient::complete`], but the documents
    /// go to the model directly as images instead of extracted text.
    async fn complete_images(
        &self,
        images: &[ImageInput],
        instructions: &str,
        model_deployment_name: &str,
        response_schema: &Value,
    ) -> Result<Value, CompletionError>;
}

/// A document handed to a vision-capable model.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ImageInput {
    /// Media type guessed from the file extension.
    pub fn mime_type(&self) -> &'static str {
        let extension = self
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "bmp" => "image/bmp",
            "tif" | "tiff" => "image/tiff",
            "pdf" => "application/pdf",
            _ => "application/octet-stream",
        }
    }

    /// `data:<mime>;base64,<payload>`
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), STANDARD.encode(&self.bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: MessageContent,
}

/// The fixed system instruction followed by one user message.
pub fn build_messages(text: &str, instructions: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system",
            content: MessageContent::Text(SYSTEM_PROMPT.to_string()),
        },
        ChatMessage {
            role: "user",
            content: MessageContent::Text(format!("{}. markdown: {}", instructions, text)),
        },
    ]
}

/// System instruction, then one user message holding the instructions
/// followed by every image as a data URL, in upload order.
pub fn build_vision_messages(images: &[ImageInput], instructions: &str) -> Vec<ChatMessage> {
    let mut parts = vec![ContentPart::Text {
        text: instructions.to_string(),
    }];
    parts.extend(images.iter().map(|image| ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: image.data_url(),
        },
    }));

    vec![
        ChatMessage {
            role: "system",
            content: MessageContent::Text(VISION_SYSTEM_PROMPT.to_string()),
        },
        ChatMessage {
            role: "user",
            content: MessageContent::Parts(parts),
        },
    ]
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat<'a>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Interprets a raw chat-completions response body.
///
/// The first choice's content must be JSON. A body with no choices is
/// passed back wrapped as `{"response": <body>}`.
pub fn parse_completion(body: &str) -> Result<Value, CompletionError> {
    let parsed: ChatResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(json!({ "response": body })),
    };

    let Some(choice) = parsed.choices.into_iter().next() else {
        warn!("Completion response carried no choices");
        return Ok(json!({ "response": body }));
    };

    if let Some(refusal) = choice.message.refusal.filter(|r| !r.is_empty()) {
        return Err(CompletionError::Refused(refusal));
    }

    let content = choice.message.content.unwrap_or_default();
    serde_json::from_str(&content).map_err(|e| CompletionError::InvalidOutput(e.to_string()))
}

/// Azure OpenAI chat completions client.
#[derive(Debug)]
pub struct AzureOpenAiClient {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    api_version: Option<String>,
}

impl AzureOpenAiClient {
    pub fn new(config: &CompletionConfig) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
        })
    }

    fn completions_url(&self, deployment: &str) -> Result<String, CompletionError> {
        let endpoint = require(&self.endpoint, "OPENAI_ENDPOINT")?;
        let version = require(&self.api_version, "OPENAI_API_VERSION")?;
        Ok(format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            deployment,
            version
        ))
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        model_deployment_name: &str,
        response_schema: &Value,
    ) -> Result<Value, CompletionError> {
        let url = self.completions_url(model_deployment_name)?;
        let api_key = require(&self.api_key, "OPENAI_API_KEY")?;

        let request = ChatRequest {
            messages,
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: response_schema,
            },
        };

        let response = self
            .client
            .post(&url)
            .header("api-key", api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CompletionError::Service {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body = response.text().await?;
        parse_completion(&body)
    }
}

#[async_trait]
impl CompletionClient for AzureOpenAiClient {
    async fn complete(
        &self,
        text: &str,
        instructions: &str,
        model_deployment_name: &str,
        response_schema: &Value,
    ) -> Result<Value, CompletionError> {
        let output = self
            .chat(
                build_messages(text, instructions),
                model_deployment_name,
                response_schema,
            )
            .await?;

        info!(deployment = model_deployment_name, "Completion returned structured output");
        Ok(output)
    }

    async fn complete_images(
        &self,
        images: &[ImageInput],
        instructions: &str,
        model_deployment_name: &str,
        response_schema: &Value,
    ) -> Result<Value, CompletionError> {
        let output = self
            .chat(
                build_vision_messages(images, instructions),
                model_deployment_name,
                response_schema,
            )
            .await?;

        info!(
            deployment = model_deployment_name,
            images = images.len(),
            "Vision completion returned structured output"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_messages() {
        let messages = build_messages("# Passport\nName: Ada", "extract name");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, MessageContent::Text(SYSTEM_PROMPT.to_string()));
        assert_eq!(messages[1].role, "user");
        assert_eq!(
            messages[1].content,
            MessageContent::Text("extract name. markdown: # Passport\nName: Ada".to_string())
        );
    }

    #[test]
    fn test_build_vision_messages() {
        let images = vec![
            ImageInput {
                file_name: "0-passport.PNG".to_string(),
                bytes: b"png".to_vec(),
            },
            ImageInput {
                file_name: "1-scan".to_string(),
                bytes: vec![0xff],
            },
        ];
        let body = serde_json::to_value(build_vision_messages(&images, "extract name")).unwrap();

        assert_eq!(body[0], json!({"role": "system", "content": VISION_SYSTEM_PROMPT}));
        assert_eq!(
            body[1]["content"],
            json!([
                {"type": "text", "text": "extract name"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,cG5n"}},
                {"type": "image_url", "image_url": {"url": "data:application/octet-stream;base64,/w=="}}
            ])
        );
    }

    #[test]
    fn test_request_body_shape() {
        let schema = json!({"name": "person", "schema": {"type": "object"}});
        let request = ChatRequest {
            messages: build_messages("text", "do it"),
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: &schema,
            },
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["temperature"], json!(0.0));
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"], schema);
    }

    #[test]
    fn test_parse_completion_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"Name\":\"Ada\"}"}}]}"#;
        assert_eq!(parse_completion(body).unwrap(), json!({"Name": "Ada"}));
    }

    #[test]
    fn test_parse_completion_without_choices_falls_back() {
        let body = r#"{"choices":[]}"#;
        assert_eq!(parse_completion(body).unwrap(), json!({"response": body}));
    }

    #[test]
    fn test_parse_completion_rejects_prose() {
        let body = r#"{"choices":[{"message":{"content":"Sure! The name is Ada."}}]}"#;
        assert!(matches!(
            parse_completion(body),
            Err(CompletionError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_parse_completion_refusal() {
        let body = r#"{"choices":[{"message":{"content":null,"refusal":"I can't help with that."}}]}"#;
        assert!(matches!(parse_completion(body), Err(CompletionError::Refused(_))));
    }

    #[test]
    fn test_missing_api_version_is_reported() {
        let client = AzureOpenAiClient::new(&CompletionConfig {
            endpoint: Some("https://oai.example.com".to_string()),
            ..CompletionConfig::default()
        })
        .unwrap();
        let err = client.completions_url("gpt-4o").unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_VERSION"));
    }
}
