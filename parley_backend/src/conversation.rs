use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directives::DirectiveKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Speaker::User,
            _ => Speaker::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSource {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchResults {
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<SearchSource>,
    #[serde(default)]
    pub images: Vec<SearchImage>,
    pub query: String,
}

/// One entry of a chained search. Order matches detection order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStep {
    pub query: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<SearchResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SearchStep {
    pub fn queued(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            completed: false,
            results: None,
            error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableCode {
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

/// Confirmation or error sentence shown in place of a one-shot directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveNotice {
    pub kind: DirectiveKind,
    pub text: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_type: String,
    pub query: String,
}

/// Directive-specific state carried by an assistant message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DirectiveFields {
    #[serde(default)]
    pub search_request: Option<String>,
    #[serde(default)]
    pub search_completed: bool,
    #[serde(default)]
    pub search_results: Option<SearchResults>,
    #[serde(default)]
    pub multi_search: Vec<SearchStep>,

    #[serde(default)]
    pub executable_code: Option<ExecutableCode>,
    #[serde(default)]
    pub code_executing: bool,
    #[serde(default)]
    pub code_executed: bool,
    #[serde(default)]
    pub generated_images: Option<Vec<GeneratedImage>>,

    #[serde(default)]
    pub image_prompt: Option<String>,
    #[serde(default)]
    pub image_generation_completed: bool,
    #[serde(default)]
    pub image_generation_error: bool,

    #[serde(default)]
    pub page_id: Option<String>,
    #[serde(default)]
    pub is_finalizing: bool,

    #[serde(default)]
    pub notices: Vec<DirectiveNotice>,
    #[serde(default)]
    pub exported_files: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: Speaker,
    /// Raw stream text, directive tags included.
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub response_time_ms: Option<u64>,
    #[serde(default)]
    pub directives: DirectiveFields,
}

impl Message {
    pub fn new(conversation_id: &str, sender: Speaker, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender,
            content: content.into(),
            created_at: Utc::now(),
            response_time_ms: None,
            directives: DirectiveFields::default(),
        }
    }

    pub fn user(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Speaker::User, content)
    }

    pub fn assistant(conversation_id: &str) -> Self {
        Self::new(conversation_id, Speaker::Assistant, String::new())
    }

    pub fn notice_for(&self, kind: DirectiveKind) -> Option<&DirectiveNotice> {
        self.directives.notices.iter().find(|n| n.kind == kind)
    }
}

/// Partial message update handed to the store.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub response_time_ms: Option<u64>,
    pub directives: Option<DirectiveFields>,
}

impl MessagePatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.response_time_ms.is_none() && self.directives.is_none()
    }

    pub fn apply_to(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(response_time_ms) = self.response_time_ms {
            message.response_time_ms = Some(response_time_ms);
        }
        if let Some(directives) = &self.directives {
            message.directives = directives.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub icon: Option<String>,
    pub messages: Vec<Message>,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub icon: Option<String>,
    pub model: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub icon: Option<String>,
    pub model: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Page {
    pub fn from_markdown(conversation_id: &str, message_id: &str, body: &str) -> Self {
        let title = body
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with('#'))
            .map(|line| line.trim_start_matches('#').trim().to_string())
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| "Untitled page".to_string());

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            title,
            body: body.trim().to_string(),
            created_at: Utc::now(),
        }
    }
}
