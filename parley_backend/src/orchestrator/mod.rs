//! Turn coordination.
//!
//! One call to [`ChatOrchestrator::run_turn`] streams the assistant reply,
//! launches an executor for every directive the moment its closing tag
//! arrives, waits for all of them, optionally delegates a visualization, and
//! runs the single finalization request when any executor left hidden context
//! behind. Every mutation of the assistant message goes through one
//! [`ReconcilerHandle`].

pub mod accumulator;
pub mod finalize;
pub mod persist;
pub mod reconciler;
pub mod rehydrate;
pub mod throttle;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use flume::Sender;
use futures_util::StreamExt;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{
    ChatRequest, ChunkStream, ConversationStore, FileExporter, HistoryMessage, ImageGenerator,
    LanguageModel, StreamChunk, WebSearch,
};
use crate::conversation::{Conversation, ConversationPatch, Message, Speaker};
use crate::directives::detector::{Detection, DirectiveDetector};
use crate::display::strip_directives;
use crate::events::ChatEvent;
use crate::executors::code::VISUALIZATION_PROMPT;
use crate::executors::{
    CodeExecutor, ExecutorContext, ExecutorReport, FunctionCallExecutor, ImageExecutor,
    PageExecutor, QueuedSearch, SearchExecutor, TaskExecutor, TextFileExecutor, CANCELLED,
};
use crate::functions::FunctionRegistry;

use accumulator::ChunkAccumulator;
use finalize::{FinalizeRequest, Finalized, Finalizer};

pub use reconciler::{
    DirectiveState, DirectiveUpdate, MessageReconciler, ReconcilerHandle, ReconcilerSettings,
    SideEffect,
};
pub use rehydrate::{RehydrateReport, Rehydrator};

pub const STREAM_FAILURE_APOLOGY: &str =
    "Sorry, something went wrong while generating a response. Please try again.";

const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    StreamFailed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub status: TurnStatus,
    /// Set when the finalized answer was stored as its own message.
    pub appended_message_id: Option<String>,
    pub response_time_ms: u64,
}

/// The collaborators a turn talks to.
#[derive(Clone)]
pub struct Services {
    pub model: Arc<dyn LanguageModel>,
    pub search: Arc<dyn WebSearch>,
    pub images: Arc<dyn ImageGenerator>,
    pub store: Arc<dyn ConversationStore>,
    pub exporter: Arc<dyn FileExporter>,
    pub functions: Arc<FunctionRegistry>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model: String,
    pub reconciler: ReconcilerSettings,
    pub visualization_keywords: Vec<String>,
    /// Prior messages sent along with each request.
    pub history_limit: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            reconciler: ReconcilerSettings::default(),
            visualization_keywords: Vec::new(),
            history_limit: 40,
        }
    }
}

enum StreamEnd {
    Finished,
    Failed(String),
    Cancelled,
}

/// Per-turn working state of the chunk loop.
struct ActiveTurn {
    ctx: ExecutorContext,
    accumulator: ChunkAccumulator,
    detector: DirectiveDetector,
    tasks: JoinSet<ExecutorReport>,
    search_queue: Option<UnboundedSender<QueuedSearch>>,
}

pub struct ChatOrchestrator {
    services: Services,
    events: Sender<ChatEvent>,
    settings: OrchestratorSettings,
    visualization_pattern: Option<Regex>,
}

impl ChatOrchestrator {
    pub fn new(services: Services, events: Sender<ChatEvent>, settings: OrchestratorSettings) -> Self {
        let visualization_pattern = keyword_pattern(&settings.visualization_keywords);
        Self {
            services,
            events,
            settings,
            visualization_pattern,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// A rehydrator sharing this orchestrator's collaborators and settings.
    pub fn rehydrator(&self) -> Rehydrator {
        Rehydrator::new(
            self.services.search.clone(),
            self.services.images.clone(),
            self.services.store.clone(),
            self.events.clone(),
            self.settings.reconciler.clone(),
        )
    }

    /// Whether the user asked for something to be plotted.
    pub fn wants_visualization(&self, user_text: &str) -> bool {
        self.visualization_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(user_text))
    }

    /// Run one user turn to completion. Stream, directive and finalization
    /// failures are reported through the outcome and the message itself;
    /// only store failures before streaming starts are returned as errors.
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let started = Instant::now();
        let store = &self.services.store;

        let conversation = store
            .load_conversation(conversation_id)?
            .with_context(|| format!("Conversation {} not found", conversation_id))?;
        let history = self.history_for(&conversation);

        let user_message = Message::user(conversation_id, user_text);
        store
            .add_message_to_conversation(conversation_id, &user_message)
            .context("Failed to store user message")?;
        self.touch_conversation(&conversation, user_text);

        let assistant = Message::assistant(conversation_id);
        store
            .add_message_to_conversation(conversation_id, &assistant)
            .context("Failed to store assistant message")?;
        for message in [&user_message, &assistant] {
            let _ = self.events.send(ChatEvent::MessageAppended {
                conversation_id: conversation_id.to_string(),
                message: message.clone(),
            });
        }

        tracing::info!(
            "Turn started in {} (assistant message {})",
            conversation_id,
            assistant.id
        );

        let reconciler = ReconcilerHandle::new(MessageReconciler::new(
            assistant.clone(),
            store.clone(),
            self.events.clone(),
            self.settings.reconciler.clone(),
        ));
        let mut turn = ActiveTurn {
            ctx: ExecutorContext {
                conversation_id: conversation_id.to_string(),
                message_id: assistant.id.clone(),
                reconciler: reconciler.clone(),
                cancel: cancel.clone(),
            },
            accumulator: ChunkAccumulator::new(),
            detector: DirectiveDetector::new(),
            tasks: JoinSet::new(),
            search_queue: None,
        };

        let request = ChatRequest {
            prompt: user_text.to_string(),
            history: history.clone(),
            model: self.settings.model.clone(),
            system_prompt: None,
            hidden_context: None,
        };
        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => StreamEnd::Cancelled,
            opened = self.services.model.stream_message(request) => match opened {
                Ok(stream) => self.drain_stream(stream, &mut turn).await,
                Err(e) => StreamEnd::Failed(format!("{:#}", e)),
            },
        };

        // Closing the queue lets the search chain finish after its last step.
        turn.search_queue = None;
        self.settle_stream(&end, &reconciler);

        let mut reports = Vec::new();
        while let Some(joined) = turn.tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Executor task panicked: {}", e),
            }
        }

        let streamed = matches!(end, StreamEnd::Finished) && !cancel.is_cancelled();
        if streamed {
            if let Some(report) = self
                .maybe_visualize(user_text, &history, &reports, &turn.ctx)
                .await
            {
                reports.push(report);
            }
        }
        reports.sort_by_key(|report| report.effect as u8);

        let mut appended_message_id = None;
        if streamed && !cancel.is_cancelled() {
            if let Some(hidden_context) = hidden_context(&reports) {
                let finalizer = Finalizer::new(
                    self.services.model.clone(),
                    store.clone(),
                    self.events.clone(),
                );
                let request = FinalizeRequest {
                    conversation_id: conversation_id.to_string(),
                    user_text: user_text.to_string(),
                    history,
                    model: self.settings.model.clone(),
                    hidden_context,
                };
                if let Finalized::Appended(message) =
                    finalizer.finalize(request, &reconciler, &cancel).await
                {
                    appended_message_id = Some(message.id);
                }
            }
        }

        let status = if cancel.is_cancelled() {
            TurnStatus::Cancelled
        } else if matches!(end, StreamEnd::Failed(_)) {
            TurnStatus::StreamFailed
        } else {
            TurnStatus::Completed
        };

        let response_time_ms = started.elapsed().as_millis() as u64;
        reconciler.apply(DirectiveUpdate::ResponseTime(response_time_ms));
        reconciler.flush().await;

        tracing::info!(
            "Turn finished in {} with {:?} after {} ms ({} executor report(s))",
            conversation_id,
            status,
            response_time_ms,
            reports.len()
        );
        let _ = self.events.send(ChatEvent::TurnCompleted {
            conversation_id: conversation_id.to_string(),
            message_id: assistant.id.clone(),
            status,
            response_time_ms,
        });

        Ok(TurnOutcome {
            conversation_id: conversation_id.to_string(),
            user_message_id: user_message.id,
            assistant_message_id: assistant.id,
            status,
            appended_message_id,
            response_time_ms,
        })
    }

    async fn drain_stream(&self, mut stream: ChunkStream, turn: &mut ActiveTurn) -> StreamEnd {
        let cancel = turn.ctx.cancel.clone();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                None => return StreamEnd::Finished,
                Some(Err(e)) => return StreamEnd::Failed(format!("{:#}", e)),
                Some(Ok(chunk)) => self.on_chunk(turn, chunk),
            }
        }
    }

    fn on_chunk(&self, turn: &mut ActiveTurn, chunk: StreamChunk) {
        let effects = turn.accumulator.on_chunk(chunk);
        let reconciler = &turn.ctx.reconciler;

        reconciler.apply(DirectiveUpdate::ContentAppended(effects.appended));
        if let Some(code) = effects.executable_code {
            reconciler.apply(DirectiveUpdate::CodeDetected { code });
        }
        if let Some(images) = effects.generated_images {
            reconciler.apply(DirectiveUpdate::CodeImages { images });
        }

        let detections = turn.detector.scan(turn.accumulator.full_content());
        for detection in detections {
            self.dispatch(turn, detection);
        }
    }

    fn dispatch(&self, turn: &mut ActiveTurn, detection: Detection) {
        tracing::debug!("Detected {:?} directive", detection.kind());
        let services = &self.services;
        let ctx = turn.ctx.clone();

        match detection {
            Detection::Search { index, query } => {
                ctx.reconciler.apply(DirectiveUpdate::SearchQueued {
                    query: query.clone(),
                });
                let tasks = &mut turn.tasks;
                let queue = turn.search_queue.get_or_insert_with(|| {
                    let (tx, rx) = unbounded_channel();
                    tasks.spawn(SearchExecutor::new(services.search.clone(), ctx.clone()).run(rx));
                    tx
                });
                if queue.send(QueuedSearch { index, query }).is_err() {
                    tracing::warn!("Search chain already finished, dropping step {}", index + 1);
                }
            }
            Detection::Image { prompt } => {
                turn.tasks
                    .spawn(ImageExecutor::new(services.images.clone(), ctx).run(prompt));
            }
            Detection::Page { body } => {
                turn.tasks
                    .spawn(PageExecutor::new(services.store.clone(), ctx).run(body));
            }
            Detection::TextFile { name, body } => {
                turn.tasks
                    .spawn(TextFileExecutor::new(services.exporter.clone(), ctx).run(name, body));
            }
            Detection::TaskCreate { body } => {
                turn.tasks.spawn(TaskExecutor::new(ctx).run(body));
            }
            Detection::FunctionCall { body } => {
                turn.tasks
                    .spawn(FunctionCallExecutor::new(services.functions.clone(), ctx).run(body));
            }
        }
    }

    /// Bring stream-owned state (content, inline code) to its terminal form.
    fn settle_stream(&self, end: &StreamEnd, reconciler: &ReconcilerHandle) {
        let code_running = reconciler.state(SideEffect::CodeExecution) == DirectiveState::Running;
        match end {
            StreamEnd::Finished => {
                if code_running {
                    reconciler.apply(DirectiveUpdate::CodeFinished);
                }
            }
            StreamEnd::Failed(error) => {
                tracing::error!("Response stream failed: {}", error);
                reconciler.apply(DirectiveUpdate::StreamFailed {
                    apology: STREAM_FAILURE_APOLOGY.to_string(),
                });
                if code_running {
                    reconciler.apply(DirectiveUpdate::EffectFailed {
                        effect: SideEffect::CodeExecution,
                        error: error.clone(),
                    });
                }
            }
            StreamEnd::Cancelled => {
                tracing::info!("Turn cancelled while streaming");
                if code_running {
                    reconciler.apply(DirectiveUpdate::EffectFailed {
                        effect: SideEffect::CodeExecution,
                        error: CANCELLED.to_string(),
                    });
                }
            }
        }
    }

    async fn maybe_visualize(
        &self,
        user_text: &str,
        history: &[HistoryMessage],
        reports: &[ExecutorReport],
        ctx: &ExecutorContext,
    ) -> Option<ExecutorReport> {
        let search_context = reports
            .iter()
            .find(|report| report.effect == SideEffect::Search)
            .and_then(|report| report.context.clone())?;
        if !self.wants_visualization(user_text)
            || ctx.reconciler.state(SideEffect::CodeExecution) != DirectiveState::NotDetected
        {
            return None;
        }

        tracing::info!("Delegating search results to a visualization request");
        let request = ChatRequest {
            prompt: user_text.to_string(),
            history: history.to_vec(),
            model: self.settings.model.clone(),
            system_prompt: Some(VISUALIZATION_PROMPT.to_string()),
            hidden_context: Some(search_context),
        };
        Some(
            CodeExecutor::new(self.services.model.clone(), ctx.clone())
                .run_delegated(request)
                .await,
        )
    }

    fn history_for(&self, conversation: &Conversation) -> Vec<HistoryMessage> {
        let skip = conversation
            .messages
            .len()
            .saturating_sub(self.settings.history_limit);
        conversation
            .messages
            .iter()
            .skip(skip)
            .filter_map(|message| {
                let content = match message.sender {
                    Speaker::User => message.content.trim().to_string(),
                    Speaker::Assistant => strip_directives(&message.content).trim().to_string(),
                };
                if content.is_empty() {
                    return None;
                }
                let mut entry = HistoryMessage::from_message(message);
                entry.content = content;
                Some(entry)
            })
            .collect()
    }

    fn touch_conversation(&self, conversation: &Conversation, user_text: &str) {
        let title = conversation
            .messages
            .is_empty()
            .then(|| title_from(user_text))
            .flatten();
        let patch = ConversationPatch {
            title,
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self
            .services
            .store
            .update_conversation(&conversation.id, &patch)
        {
            tracing::warn!("Failed to update conversation {}: {:#}", conversation.id, e);
        }
    }
}

/// Hidden context for finalization, if any report asks for it. Optional
/// contexts (images) only ride along.
fn hidden_context(reports: &[ExecutorReport]) -> Option<String> {
    if !reports
        .iter()
        .any(|report| report.requires_finalization && report.context.is_some())
    {
        return None;
    }
    let sections: Vec<&str> = reports
        .iter()
        .filter_map(|report| report.context.as_deref())
        .map(str::trim)
        .filter(|section| !section.is_empty())
        .collect();
    Some(sections.join("\n\n"))
}

fn keyword_pattern(keywords: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|keyword| keyword.trim())
        .filter(|keyword| !keyword.is_empty())
        .map(regex_lite::escape)
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    match Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))) {
        Ok(pattern) => Some(pattern),
        Err(e) => {
            tracing::warn!("Invalid visualization keywords: {}", e);
            None
        }
    }
}

fn title_from(user_text: &str) -> Option<String> {
    let line = user_text.lines().map(str::trim).find(|line| !line.is_empty())?;
    if line.chars().count() <= TITLE_MAX_CHARS {
        return Some(line.to_string());
    }
    let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
    Some(format!("{}...", cut.trim_end()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ChunkPayload;
    use crate::conversation::{ExecutableCode, GeneratedImage, SearchResults, SearchSource};
    use crate::database::ChatDatabase;
    use crate::exporter::DirectoryExporter;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex;

    type Script = Vec<Result<StreamChunk, String>>;

    fn text(fragment: &str) -> Result<StreamChunk, String> {
        Ok(StreamChunk::Text(fragment.to_string()))
    }

    #[derive(Default)]
    struct FakeModel {
        primary: Script,
        /// Keep the primary stream open after the script runs out.
        hang: bool,
        visualization: Vec<StreamChunk>,
        answer: String,
        streamed: Mutex<Vec<ChatRequest>>,
        completed: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        async fn stream_message(&self, request: ChatRequest) -> Result<ChunkStream> {
            let delegated = request.system_prompt.as_deref() == Some(VISUALIZATION_PROMPT);
            self.streamed.lock().unwrap().push(request);

            let items: Vec<Result<StreamChunk>> = if delegated {
                self.visualization.iter().cloned().map(Ok).collect()
            } else {
                self.primary
                    .iter()
                    .cloned()
                    .map(|item| item.map_err(|e| anyhow::anyhow!(e)))
                    .collect()
            };
            let script = stream::iter(items);
            if self.hang && !delegated {
                Ok(Box::pin(script.chain(stream::pending())))
            } else {
                Ok(Box::pin(script))
            }
        }

        async fn complete(&self, request: ChatRequest) -> Result<String> {
            self.completed.lock().unwrap().push(request);
            Ok(self.answer.clone())
        }
    }

    #[derive(Default)]
    struct FakeSearch {
        calls: Mutex<Vec<String>>,
        /// Cancel this token and stall instead of answering.
        cancel_on_call: Option<CancellationToken>,
    }

    #[async_trait]
    impl WebSearch for FakeSearch {
        async fn search_web(&self, query: &str) -> Result<SearchResults> {
            self.calls.lock().unwrap().push(query.to_string());
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
                std::future::pending::<()>().await;
            }
            Ok(SearchResults {
                answer: format!("{} is rising", query),
                sources: vec![SearchSource {
                    title: query.to_string(),
                    url: format!("https://example.com/{}", query.replace(' ', "-")),
                    content: "42% in 2024".to_string(),
                    score: 0.9,
                    published_date: None,
                }],
                images: Vec::new(),
                query: query.to_string(),
            })
        }
    }

    struct FakeImages;

    #[async_trait]
    impl ImageGenerator for FakeImages {
        async fn generate_image(&self, prompt: &str) -> Result<Vec<GeneratedImage>> {
            Ok(vec![GeneratedImage {
                src: format!("https://img/{}.png", prompt),
                alt: Some(prompt.to_string()),
            }])
        }
    }

    struct Harness {
        orchestrator: ChatOrchestrator,
        db: Arc<ChatDatabase>,
        events: flume::Receiver<ChatEvent>,
        model: Arc<FakeModel>,
        search: Arc<FakeSearch>,
        conversation_id: String,
        _exports: tempfile::TempDir,
    }

    impl Harness {
        fn stored(&self) -> Conversation {
            self.db
                .load_conversation(&self.conversation_id)
                .unwrap()
                .unwrap()
        }

        fn progress(&self, effect: SideEffect) -> Vec<DirectiveState> {
            self.events
                .drain()
                .filter_map(|event| match event {
                    ChatEvent::DirectiveProgress {
                        effect: seen,
                        state,
                        ..
                    } if seen == effect => Some(state),
                    _ => None,
                })
                .collect()
        }
    }

    fn harness(model: FakeModel, search: FakeSearch) -> Harness {
        let db = Arc::new(ChatDatabase::open_in_memory().unwrap());
        let conversation = db.create_conversation(None, "test-model").unwrap();
        let exports = tempfile::tempdir().unwrap();
        let model = Arc::new(model);
        let search = Arc::new(search);
        let (tx, rx) = flume::unbounded();

        let services = Services {
            model: model.clone(),
            search: search.clone(),
            images: Arc::new(FakeImages),
            store: db.clone(),
            exporter: Arc::new(DirectoryExporter::new(exports.path())),
            functions: Arc::new(FunctionRegistry::new()),
        };
        let settings = OrchestratorSettings {
            model: "test-model".to_string(),
            visualization_keywords: vec!["chart".to_string(), "plot".to_string()],
            ..Default::default()
        };

        Harness {
            orchestrator: ChatOrchestrator::new(services, tx, settings),
            db,
            events: rx,
            model,
            search,
            conversation_id: conversation.id,
            _exports: exports,
        }
    }

    #[tokio::test]
    async fn search_then_chart_appends_a_final_message() {
        let code = ExecutableCode {
            code: "import matplotlib.pyplot as plt\nplt.bar(['2024'], [42])".to_string(),
            language: "python".to_string(),
        };
        let chart = GeneratedImage {
            src: "data:image/png;base64,AAAA".to_string(),
            alt: None,
        };
        let h = harness(
            FakeModel {
                primary: vec![
                    text("Let me look that up. <SEARCH"),
                    text("REQUEST>rust adoption</SEARCH"),
                    text("REQUEST>"),
                ],
                visualization: vec![
                    StreamChunk::Payload(ChunkPayload {
                        content: Some("Here is the chart.".to_string()),
                        executable_code: Some(code.clone()),
                        generated_images: None,
                    }),
                    StreamChunk::Payload(ChunkPayload {
                        generated_images: Some(vec![chart.clone()]),
                        ..Default::default()
                    }),
                ],
                answer: "<HIDDEN_CONTEXT>rust adoption is rising</HIDDEN_CONTEXT>\nAdoption grew to 42%."
                    .to_string(),
                ..Default::default()
            },
            FakeSearch::default(),
        );

        let outcome = h
            .orchestrator
            .run_turn(
                &h.conversation_id,
                "search for rust adoption and show me a chart of it",
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(*h.search.calls.lock().unwrap(), vec!["rust adoption"]);
        assert_eq!(
            h.progress(SideEffect::CodeExecution),
            vec![DirectiveState::Running, DirectiveState::Completed]
        );

        let stored = h.stored();
        assert_eq!(stored.messages.len(), 3);
        assert_eq!(
            stored.title,
            "search for rust adoption and show me a chart of it"
        );

        let d = &stored.messages[1].directives;
        assert!(d.search_completed);
        assert_eq!(d.search_results.as_ref().unwrap().answer, "rust adoption is rising");
        assert_eq!(d.executable_code, Some(code));
        assert!(!d.code_executing);
        assert!(d.code_executed);
        assert_eq!(d.generated_images, Some(vec![chart]));
        assert!(!d.is_finalizing);
        assert!(stored.messages[1].response_time_ms.is_some());

        let appended = &stored.messages[2];
        assert_eq!(outcome.appended_message_id.as_deref(), Some(appended.id.as_str()));
        assert_eq!(appended.content, "Adoption grew to 42%.");
        assert!(!appended.content.to_uppercase().contains("HIDDEN"));

        let finalize_requests = h.model.completed.lock().unwrap();
        assert_eq!(finalize_requests.len(), 1);
        let hidden = finalize_requests[0].hidden_context.as_deref().unwrap();
        assert!(hidden.contains("### Step 1: rust adoption"));
        assert!(hidden.contains("A visualization was prepared"));
    }

    #[tokio::test]
    async fn searches_run_in_detection_order() {
        let h = harness(
            FakeModel {
                primary: vec![
                    text("<SEARCH>first</SEARCH><WEB_SEARCH>sec"),
                    text("ond</WEB_SEARCH>\n<searchrequest>third</searchrequest>"),
                ],
                answer: "Summary.".to_string(),
                ..Default::default()
            },
            FakeSearch::default(),
        );

        let outcome = h
            .orchestrator
            .run_turn(&h.conversation_id, "research this", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(
            *h.search.calls.lock().unwrap(),
            vec!["first", "second", "third"]
        );

        let stored = h.stored();
        let d = &stored.messages[1].directives;
        let queries: Vec<_> = d.multi_search.iter().map(|s| s.query.as_str()).collect();
        assert_eq!(queries, vec!["first", "second", "third"]);
        assert!(d.multi_search.iter().all(|s| s.completed && s.results.is_some()));
        assert_eq!(d.search_request.as_deref(), Some("first"));
        assert!(d.search_results.as_ref().unwrap().answer.starts_with("Step 1: first"));

        // Nothing visible besides tags, so the answer lands in the same message.
        assert_eq!(stored.messages.len(), 2);
        assert!(stored.messages[1].content.ends_with("\n\nSummary."));
        assert!(outcome.appended_message_id.is_none());
    }

    #[tokio::test]
    async fn stream_failure_keeps_launched_work_and_apologizes() {
        let h = harness(
            FakeModel {
                primary: vec![
                    text("Drawing <IMG>fox</IMG> now"),
                    Err("connection reset".to_string()),
                ],
                answer: "unused".to_string(),
                ..Default::default()
            },
            FakeSearch::default(),
        );

        let outcome = h
            .orchestrator
            .run_turn(&h.conversation_id, "draw a fox", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::StreamFailed);
        let stored = h.stored();
        let message = &stored.messages[1];
        assert_eq!(message.content, STREAM_FAILURE_APOLOGY);
        assert!(message.directives.image_generation_completed);
        assert!(!message.directives.image_generation_error);
        assert!(h.model.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_errors_running_search_and_skips_finalization() {
        let cancel = CancellationToken::new();
        let h = harness(
            FakeModel {
                primary: vec![text("<SEARCH>slow topic</SEARCH>")],
                hang: true,
                answer: "unused".to_string(),
                ..Default::default()
            },
            FakeSearch {
                cancel_on_call: Some(cancel.clone()),
                ..Default::default()
            },
        );

        let outcome = h
            .orchestrator
            .run_turn(&h.conversation_id, "look it up", cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Cancelled);
        assert!(h.model.completed.lock().unwrap().is_empty());

        let stored = h.stored();
        let d = &stored.messages[1].directives;
        assert!(d.search_completed);
        assert_eq!(d.multi_search[0].error.as_deref(), Some(CANCELLED));
        let states = h.progress(SideEffect::Search);
        assert_eq!(states.first(), Some(&DirectiveState::Running));
        assert_eq!(states.last(), Some(&DirectiveState::Errored));
    }

    #[tokio::test]
    async fn unclosed_page_never_fires() {
        let h = harness(
            FakeModel {
                primary: vec![text("Sure. <PAGE># Notes\n"), text("never closed")],
                answer: "unused".to_string(),
                ..Default::default()
            },
            FakeSearch::default(),
        );

        let outcome = h
            .orchestrator
            .run_turn(&h.conversation_id, "write notes", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert!(h.progress(SideEffect::Page).is_empty());
        let stored = h.stored();
        let message = &stored.messages[1];
        assert!(message.directives.page_id.is_none());
        assert!(message.notice_for(crate::directives::DirectiveKind::Page).is_none());
        assert_eq!(message.content, "Sure. <PAGE># Notes\nnever closed");
        assert!(h.model.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_omits_directive_tags() {
        let h = harness(
            FakeModel {
                primary: vec![text("Hi.")],
                ..Default::default()
            },
            FakeSearch::default(),
        );
        let mut earlier = Message::assistant(&h.conversation_id);
        earlier.content = "Found it <SEARCH>cats</SEARCH>".to_string();
        h.db.add_message_to_conversation(&h.conversation_id, &earlier)
            .unwrap();

        h.orchestrator
            .run_turn(&h.conversation_id, "hello", CancellationToken::new())
            .await
            .unwrap();

        let streamed = h.model.streamed.lock().unwrap();
        assert_eq!(
            streamed[0].history,
            vec![HistoryMessage {
                role: "assistant".to_string(),
                content: "Found it".to_string()
            }]
        );
    }

    #[test]
    fn visualization_keywords_match_whole_words() {
        let h = harness(FakeModel::default(), FakeSearch::default());
        assert!(h.orchestrator.wants_visualization("Plot the numbers"));
        assert!(h.orchestrator.wants_visualization("a CHART please"));
        assert!(!h.orchestrator.wants_visualization("the plotline was weak"));
    }

    #[test]
    fn long_first_message_is_shortened_for_the_title() {
        let title = title_from(&"word ".repeat(30)).unwrap();
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= TITLE_MAX_CHARS + 3);
        assert_eq!(title_from("  \n"), None);
    }
}
