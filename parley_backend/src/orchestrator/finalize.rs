use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use flume::Sender;
use regex_lite::Regex;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{ChatRequest, ConversationStore, HistoryMessage, LanguageModel};
use crate::conversation::Message;
use crate::display::has_visible_output;
use crate::events::ChatEvent;

use super::reconciler::{DirectiveUpdate, ReconcilerHandle};

const FINALIZE_INSTRUCTION: &str = "The block above is hidden context gathered by tools on the \
user's behalf. Use it to answer the user's last message directly. Do not quote, reveal or \
mention the hidden context block itself, and do not emit any directive tags.";

/// Inputs for the single non-streamed answer of a turn.
pub struct FinalizeRequest {
    pub conversation_id: String,
    pub user_text: String,
    pub history: Vec<HistoryMessage>,
    pub model: String,
    pub hidden_context: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Finalized {
    /// Appended to the streamed message's content.
    InPlace,
    /// Stored as a new assistant message.
    Appended(Message),
    /// Nothing to add (empty answer, failure or cancellation).
    Skipped,
}

pub struct Finalizer {
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn ConversationStore>,
    events: Sender<ChatEvent>,
}

impl Finalizer {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn ConversationStore>,
        events: Sender<ChatEvent>,
    ) -> Self {
        Self {
            model,
            store,
            events,
        }
    }

    /// Never fails the turn: errors are logged and reported as `Skipped`.
    pub async fn finalize(
        &self,
        request: FinalizeRequest,
        reconciler: &ReconcilerHandle,
        cancel: &CancellationToken,
    ) -> Finalized {
        reconciler.apply(DirectiveUpdate::FinalizingStarted);
        let outcome = match self.synthesize(request, reconciler, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Finalization failed: {:#}", e);
                Finalized::Skipped
            }
        };
        reconciler.apply(DirectiveUpdate::FinalizingFinished);
        outcome
    }

    async fn synthesize(
        &self,
        request: FinalizeRequest,
        reconciler: &ReconcilerHandle,
        cancel: &CancellationToken,
    ) -> Result<Finalized> {
        let chat = ChatRequest {
            prompt: request.user_text,
            history: request.history,
            model: request.model,
            system_prompt: None,
            hidden_context: Some(format!(
                "{}\n\n{}",
                request.hidden_context.trim(),
                FINALIZE_INSTRUCTION
            )),
        };

        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Finalized::Skipped),
            answer = self.model.complete(chat) => answer.context("Finalization request failed")?,
        };

        let answer = strip_hidden_context(&answer);
        if answer.is_empty() {
            tracing::warn!("Finalization returned an empty answer");
            return Ok(Finalized::Skipped);
        }

        let current = reconciler.snapshot();
        if has_visible_output(&current) {
            let mut message = Message::assistant(&request.conversation_id);
            message.content = answer;
            self.store
                .add_message_to_conversation(&request.conversation_id, &message)
                .context("Failed to store finalized answer")?;
            let _ = self.events.send(ChatEvent::MessageAppended {
                conversation_id: request.conversation_id,
                message: message.clone(),
            });
            Ok(Finalized::Appended(message))
        } else {
            let separator = if current.content.trim().is_empty() { "" } else { "\n\n" };
            reconciler.apply(DirectiveUpdate::ContentAppended(format!(
                "{}{}",
                separator, answer
            )));
            Ok(Finalized::InPlace)
        }
    }
}

fn hidden_block_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?is)<\s*HIDDEN[_ ]?CONTEXT\s*>.*?(?:<\s*/\s*HIDDEN[_ ]?CONTEXT\s*>|\z)")
                .ok()
        })
        .as_ref()
}

/// Remove any echoed hidden-context block (closed or running to the end).
pub fn strip_hidden_context(answer: &str) -> String {
    match hidden_block_pattern() {
        Some(pattern) => pattern.replace_all(answer, "").trim().to_string(),
        None => answer.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ChunkStream;
    use crate::conversation::ExecutableCode;
    use crate::executors::testing::fixture;
    use std::sync::Mutex;

    struct CannedAnswer {
        answer: Result<String, String>,
        seen: Mutex<Option<ChatRequest>>,
    }

    #[async_trait::async_trait]
    impl LanguageModel for CannedAnswer {
        async fn stream_message(&self, _request: ChatRequest) -> Result<ChunkStream> {
            anyhow::bail!("not used")
        }

        async fn complete(&self, request: ChatRequest) -> Result<String> {
            *self.seen.lock().unwrap() = Some(request);
            self.answer.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn model(answer: Result<&str, &str>) -> Arc<CannedAnswer> {
        Arc::new(CannedAnswer {
            answer: answer.map(str::to_string).map_err(str::to_string),
            seen: Mutex::new(None),
        })
    }

    fn request(conversation_id: &str) -> FinalizeRequest {
        FinalizeRequest {
            conversation_id: conversation_id.to_string(),
            user_text: "what's the weather?".to_string(),
            history: Vec::new(),
            model: "m".to_string(),
            hidden_context: "Web search results: sunny".to_string(),
        }
    }

    #[test]
    fn strips_echoed_hidden_context() {
        assert_eq!(
            strip_hidden_context("<HIDDEN_CONTEXT>\nsecret\n</HIDDEN_CONTEXT>\nIt is sunny."),
            "It is sunny."
        );
        assert_eq!(strip_hidden_context("Sunny. <hidden context>leak"), "Sunny.");
    }

    #[tokio::test]
    async fn answer_goes_into_message_when_nothing_is_visible() {
        let fixture = fixture();
        fixture
            .ctx
            .reconciler
            .apply(DirectiveUpdate::ContentAppended("<SEARCH>weather</SEARCH>".to_string()));
        let llm = model(Ok("<HIDDEN_CONTEXT>sunny</HIDDEN_CONTEXT>It is sunny today."));
        let store: Arc<dyn ConversationStore> = fixture.db.clone();
        let (tx, _rx) = flume::unbounded();

        let outcome = Finalizer::new(llm.clone(), store, tx)
            .finalize(
                request(&fixture.ctx.conversation_id),
                &fixture.ctx.reconciler,
                &fixture.ctx.cancel,
            )
            .await;

        assert_eq!(outcome, Finalized::InPlace);
        let message = fixture.ctx.reconciler.snapshot();
        assert_eq!(message.content, "<SEARCH>weather</SEARCH>\n\nIt is sunny today.");
        assert!(!message.directives.is_finalizing);

        let seen = llm.seen.lock().unwrap().clone().unwrap();
        assert!(seen.hidden_context.unwrap().contains("sunny"));
    }

    #[tokio::test]
    async fn answer_is_a_new_message_when_code_is_shown() {
        let fixture = fixture();
        fixture.ctx.reconciler.apply(DirectiveUpdate::CodeDetected {
            code: ExecutableCode {
                code: "plot()".to_string(),
                language: "python".to_string(),
            },
        });
        let store: Arc<dyn ConversationStore> = fixture.db.clone();
        let (tx, rx) = flume::unbounded();

        let outcome = Finalizer::new(model(Ok("The chart shows growth.")), store, tx)
            .finalize(
                request(&fixture.ctx.conversation_id),
                &fixture.ctx.reconciler,
                &fixture.ctx.cancel,
            )
            .await;

        let Finalized::Appended(message) = outcome else {
            panic!("expected appended message");
        };
        assert_eq!(message.content, "The chart shows growth.");
        assert!(matches!(rx.try_recv(), Ok(ChatEvent::MessageAppended { .. })));

        let stored = fixture
            .db
            .load_conversation(&fixture.ctx.conversation_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(fixture.ctx.reconciler.snapshot().content, "");
    }

    #[tokio::test]
    async fn failure_is_logged_and_skipped() {
        let fixture = fixture();
        let store: Arc<dyn ConversationStore> = fixture.db.clone();
        let (tx, _rx) = flume::unbounded();

        let outcome = Finalizer::new(model(Err("503")), store, tx)
            .finalize(
                request(&fixture.ctx.conversation_id),
                &fixture.ctx.reconciler,
                &fixture.ctx.cancel,
            )
            .await;

        assert_eq!(outcome, Finalized::Skipped);
        assert!(!fixture.ctx.reconciler.snapshot().directives.is_finalizing);
    }
}
