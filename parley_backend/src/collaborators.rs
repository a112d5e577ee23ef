//! Seams to the outside world. The orchestrator only talks to these traits;
//! `LlmClient`, `SearchClient`, `ImageClient`, `ChatDatabase` and
//! `DirectoryExporter` are the default implementations.

use std::path::PathBuf;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::conversation::{
    Conversation, ConversationPatch, ConversationSummary, ExecutableCode, GeneratedImage,
    Message, MessagePatch, Page, SearchResults, Speaker,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl HistoryMessage {
    pub fn from_message(message: &Message) -> Self {
        let role = match message.sender {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        };
        Self {
            role: role.to_string(),
            content: message.content.clone(),
        }
    }
}

/// One request to the language model.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub prompt: String,
    pub history: Vec<HistoryMessage>,
    pub model: String,
    /// Overrides the configured system prompt when set.
    pub system_prompt: Option<String>,
    /// Data the model may use but must not quote back verbatim.
    pub hidden_context: Option<String>,
}

/// Structured chunk payload (code execution capable models).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkPayload {
    pub content: Option<String>,
    pub executable_code: Option<ExecutableCode>,
    pub generated_images: Option<Vec<GeneratedImage>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    Payload(ChunkPayload),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start a streamed completion. Errors before the first chunk are returned
    /// directly; errors mid-stream surface as `Err` items.
    async fn stream_message(&self, request: ChatRequest) -> Result<ChunkStream>;

    /// Non-streamed completion, used for finalization.
    async fn complete(&self, request: ChatRequest) -> Result<String>;
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search_web(&self, query: &str) -> Result<SearchResults>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(&self, prompt: &str) -> Result<Vec<GeneratedImage>>;
}

/// Read/write contract of the conversation store.
pub trait ConversationStore: Send + Sync {
    fn create_conversation(&self, title: Option<&str>, model: &str) -> Result<Conversation>;
    fn load_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;
    fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>>;
    fn add_message_to_conversation(&self, conversation_id: &str, message: &Message) -> Result<()>;
    fn update_message_in_conversation(&self, message_id: &str, patch: &MessagePatch)
        -> Result<()>;
    fn update_conversation(&self, conversation_id: &str, patch: &ConversationPatch) -> Result<()>;
    fn create_page(&self, page: &Page) -> Result<()>;
}

/// Destination for text-file directives (the "download").
pub trait FileExporter: Send + Sync {
    fn export(&self, file_name: &str, body: &str) -> Result<PathBuf>;
}
