// Chat completions over an OpenAI-compatible API (Ollama, LM Studio, vLLM, OpenAI, etc.)

use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collaborators::{
    ChatRequest, ChunkPayload, ChunkStream, HistoryMessage, LanguageModel, StreamChunk,
};
use crate::conversation::{ExecutableCode, GeneratedImage};

pub const HIDDEN_CONTEXT_OPEN: &str = "<HIDDEN_CONTEXT>";
pub const HIDDEN_CONTEXT_CLOSE: &str = "</HIDDEN_CONTEXT>";

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<HistoryMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        system_prompt: String,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            system_prompt,
            temperature: 0.7,
            max_tokens: 4096,
            client,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn build_messages(&self, request: &ChatRequest) -> Vec<HistoryMessage> {
        let mut messages = vec![HistoryMessage {
            role: "system".to_string(),
            content: request
                .system_prompt
                .clone()
                .unwrap_or_else(|| self.system_prompt.clone()),
        }];

        if let Some(hidden) = request.hidden_context.as_deref() {
            messages.push(HistoryMessage {
                role: "system".to_string(),
                content: format!("{}\n{}\n{}", HIDDEN_CONTEXT_OPEN, hidden, HIDDEN_CONTEXT_CLOSE),
            });
        }

        messages.extend(request.history.iter().cloned());
        messages.push(HistoryMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });
        messages
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: self.build_messages(request),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        };

        let mut req = self.client.post(&url).json(&body);

        // Add API key header if provided (not needed for local models)
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn stream_message(&self, request: ChatRequest) -> Result<ChunkStream> {
        let response = self
            .send(&request, true)
            .await
            .context("Failed to start streaming completion")?;

        let state = SseState {
            response,
            decoder: SseDecoder::default(),
            done: false,
        };

        let stream = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(chunk) = state.decoder.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.done {
                    return None;
                }
                match state.response.chunk().await {
                    Ok(Some(bytes)) => {
                        state.decoder.push(&bytes);
                        if state.decoder.saw_done {
                            state.done = true;
                        }
                    }
                    Ok(None) => {
                        state.decoder.finish();
                        state.done = true;
                    }
                    Err(e) => {
                        state.done = true;
                        let error = anyhow::Error::new(e).context("Failed reading streaming chunk");
                        return Some((Err(error), state));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let response = self.send(&request, false).await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

struct SseState {
    response: reqwest::Response,
    decoder: SseDecoder,
    done: bool,
}

/// Incremental decoder for `data:` lines of a chat completion event stream.
/// Bytes are buffered until a full line arrives, so multibyte characters split
/// across network chunks decode intact.
#[derive(Debug, Default)]
struct SseDecoder {
    line_buffer: Vec<u8>,
    pending: VecDeque<StreamChunk>,
    saw_done: bool,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.line_buffer.extend_from_slice(bytes);

        while !self.saw_done {
            let Some(newline_idx) = self.line_buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.line_buffer.drain(..=newline_idx).collect();
            self.handle_line(&line);
        }
    }

    /// Body ended; a last line without a trailing newline still counts.
    fn finish(&mut self) {
        if self.saw_done || self.line_buffer.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.line_buffer);
        self.handle_line(&line);
    }

    fn handle_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
            return;
        };
        if payload == "[DONE]" {
            self.saw_done = true;
            return;
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(chunk_json) => {
                if let Some(chunk) = chunk_from_delta(&chunk_json) {
                    self.pending.push_back(chunk);
                }
            }
            Err(e) => tracing::warn!("Skipping unparseable stream payload {}: {}", payload, e),
        }
    }
}

/// Map one streamed delta to a chunk. Plain text deltas become `Text`; deltas
/// carrying `executable_code` or `generated_images` (code-execution capable
/// gateways) become `Payload`.
fn chunk_from_delta(chunk_json: &Value) -> Option<StreamChunk> {
    let choice = chunk_json["choices"].as_array().and_then(|arr| arr.first())?;
    let delta = &choice["delta"];

    let content = delta["content"].as_str().map(str::to_string);
    let executable_code = delta
        .get("executable_code")
        .filter(|v| !v.is_null())
        .and_then(|v| {
            let code = v.get("code")?.as_str()?.to_string();
            let language = v
                .get("language")
                .and_then(Value::as_str)
                .unwrap_or("python")
                .to_ascii_lowercase();
            Some(ExecutableCode { code, language })
        });
    let generated_images = delta
        .get("generated_images")
        .and_then(Value::as_array)
        .map(|images| images.iter().filter_map(image_from_value).collect::<Vec<_>>())
        .filter(|images| !images.is_empty());

    if executable_code.is_none() && generated_images.is_none() {
        return content.filter(|c| !c.is_empty()).map(StreamChunk::Text);
    }

    Some(StreamChunk::Payload(ChunkPayload {
        content,
        executable_code,
        generated_images,
    }))
}

fn image_from_value(value: &Value) -> Option<GeneratedImage> {
    if let Some(src) = value.as_str() {
        return Some(GeneratedImage {
            src: src.to_string(),
            alt: None,
        });
    }
    let src = value
        .get("src")
        .or_else(|| value.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            let data = value.get("b64_json").or_else(|| value.get("data"))?.as_str()?;
            let mime = value
                .get("mime_type")
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            Some(format!("data:{};base64,{}", mime, data))
        })?;
    Some(GeneratedImage {
        src,
        alt: value.get("alt").and_then(Value::as_str).map(str::to_string),
    })
}
