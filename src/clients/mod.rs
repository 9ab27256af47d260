//! Clients for the external AI services: text extraction and completion.

pub mod completion;
pub mod extraction;

pub use completion::{
    build_messages, build_vision_messages, parse_completion, AzureOpenAiClient, ChatMessage,
    CompletionClient, CompletionError, ContentPart, ImageInput, MessageContent, SYSTEM_PROMPT,
    VISION_SYSTEM_PROMPT,
};
pub use extraction::{DocumentIntelligenceClient, ExtractionError, TextExtractor};
