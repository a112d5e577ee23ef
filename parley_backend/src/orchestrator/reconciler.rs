//! Single mutation authority over one assistant message.
//!
//! Executors never touch the message directly: they send typed
//! [`DirectiveUpdate`]s through a cloned [`ReconcilerHandle`]. Each side effect
//! advances through `NotDetected -> Running -> Completed | Errored`; updates
//! that would move a terminal effect are dropped, so re-applying a result is
//! a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::collaborators::ConversationStore;
use crate::conversation::{
    DirectiveFields, DirectiveNotice, ExecutableCode, GeneratedImage, Message, MessagePatch,
    SearchResults, TaskRecord,
};
use crate::directives::DirectiveKind;
use crate::events::ChatEvent;

use super::persist::PersistQueue;
use super::throttle::UpdateThrottle;

/// Everything a turn can set in motion: the six directive kinds plus code
/// execution, which has no tag of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    Search,
    Image,
    Page,
    TextFile,
    Task,
    FunctionCall,
    CodeExecution,
}

impl From<DirectiveKind> for SideEffect {
    fn from(kind: DirectiveKind) -> Self {
        match kind {
            DirectiveKind::Search => SideEffect::Search,
            DirectiveKind::Image => SideEffect::Image,
            DirectiveKind::Page => SideEffect::Page,
            DirectiveKind::TextFile => SideEffect::TextFile,
            DirectiveKind::TaskCreate => SideEffect::Task,
            DirectiveKind::FunctionCall => SideEffect::FunctionCall,
        }
    }
}

impl std::fmt::Display for SideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SideEffect::Search => "search",
            SideEffect::Image => "image",
            SideEffect::Page => "page",
            SideEffect::TextFile => "text file",
            SideEffect::Task => "task",
            SideEffect::FunctionCall => "function call",
            SideEffect::CodeExecution => "code execution",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveState {
    NotDetected,
    Running,
    Completed,
    Errored,
}

impl DirectiveState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DirectiveState::Completed | DirectiveState::Errored)
    }

    fn can_become(self, next: DirectiveState) -> bool {
        use DirectiveState::*;
        matches!(
            (self, next),
            (NotDetected, Running) | (NotDetected | Running, Completed | Errored)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveUpdate {
    ContentAppended(String),

    SearchQueued { query: String },
    SearchStarted { index: usize },
    SearchSucceeded { index: usize, results: SearchResults },
    SearchFailed { index: usize, error: String },
    /// The whole chain is terminal. `aggregate` is the single step's results
    /// or the merged results of several steps.
    SearchChainFinished { aggregate: Option<SearchResults> },

    ImageStarted { prompt: String },
    ImageSucceeded { images: Vec<GeneratedImage> },

    CodeDetected { code: ExecutableCode },
    CodeImages { images: Vec<GeneratedImage> },
    CodeFinished,

    DirectiveStarted(DirectiveKind),
    PageCreated { page_id: String, title: String },
    TextFileExported { file_name: String, path: String },
    TaskRecorded { task: TaskRecord },
    FunctionCompleted { name: String, output: String },
    /// Failure of any single side effect; `error` becomes the notice.
    EffectFailed { effect: SideEffect, error: String },

    FinalizingStarted,
    FinalizingFinished,
    StreamFailed { apology: String },
    ResponseTime(u64),

    SearchResultsRestored { results: SearchResults },
    SearchStepRestored { index: usize, results: SearchResults },
    ImagesRestored { images: Vec<GeneratedImage> },
}

impl DirectiveUpdate {
    fn is_content_only(&self) -> bool {
        matches!(self, DirectiveUpdate::ContentAppended(_))
    }
}

/// What the reconciler writes to the store and what it strips first.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub ui_throttle: Duration,
    pub persist_search_results: bool,
    pub persist_generated_images: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            ui_throttle: Duration::from_millis(16),
            persist_search_results: true,
            persist_generated_images: true,
        }
    }
}

pub struct MessageReconciler {
    message: Message,
    ledger: HashMap<SideEffect, DirectiveState>,
    persistence: PersistQueue,
    events: Sender<ChatEvent>,
    throttle: UpdateThrottle,
    settings: ReconcilerSettings,
}

impl MessageReconciler {
    pub fn new(
        message: Message,
        store: Arc<dyn ConversationStore>,
        events: Sender<ChatEvent>,
        settings: ReconcilerSettings,
    ) -> Self {
        let ledger = ledger_from_fields(&message.directives);
        Self {
            throttle: UpdateThrottle::new(settings.ui_throttle, events.clone()),
            persistence: PersistQueue::new(message.id.clone(), store, events.clone()),
            message,
            ledger,
            events,
            settings,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn state(&self, effect: SideEffect) -> DirectiveState {
        self.ledger
            .get(&effect)
            .copied()
            .unwrap_or(DirectiveState::NotDetected)
    }

    /// Apply one update. Returns false when it was a no-op.
    pub fn apply(&mut self, update: DirectiveUpdate) -> bool {
        let content_only = update.is_content_only();
        let (changed, transition) = self.mutate(update);
        let transitioned = transition.is_some();

        if let Some((effect, state, detail)) = transition {
            let _ = self.events.send(ChatEvent::DirectiveProgress {
                conversation_id: self.message.conversation_id.clone(),
                message_id: self.message.id.clone(),
                effect,
                state,
                detail,
            });
        }
        if !changed {
            return transitioned;
        }

        if !content_only {
            self.persist();
        }
        let event = self.snapshot_event();
        self.throttle.submit(event);
        true
    }

    /// Queue a final write and push the latest snapshot right away. The
    /// receiver resolves once the store has caught up.
    pub fn flush(&mut self) -> oneshot::Receiver<()> {
        self.persist();
        let event = self.snapshot_event();
        self.throttle.flush(event);
        self.persistence.settled()
    }

    fn snapshot_event(&self) -> ChatEvent {
        ChatEvent::MessageUpdated {
            conversation_id: self.message.conversation_id.clone(),
            message: self.message.clone(),
        }
    }

    fn persist(&mut self) {
        let patch = MessagePatch {
            content: Some(self.message.content.clone()),
            response_time_ms: self.message.response_time_ms,
            directives: Some(self.persistable_fields()),
        };
        self.persistence.write(patch);
    }

    fn persistable_fields(&self) -> DirectiveFields {
        let mut fields = self.message.directives.clone();
        if !self.settings.persist_search_results {
            fields.search_results = None;
            for step in &mut fields.multi_search {
                step.results = None;
            }
        }
        if !self.settings.persist_generated_images {
            fields.generated_images = None;
        }
        fields
    }

    fn advance(&mut self, effect: SideEffect, next: DirectiveState) -> bool {
        let current = self.state(effect);
        if !current.can_become(next) {
            tracing::debug!(
                "Ignoring {} transition {:?} -> {:?}",
                effect,
                current,
                next
            );
            return false;
        }
        self.ledger.insert(effect, next);
        true
    }

    fn notice(&mut self, kind: DirectiveKind, text: String, is_error: bool) {
        self.message.directives.notices.retain(|n| n.kind != kind);
        self.message
            .directives
            .notices
            .push(DirectiveNotice { kind, text, is_error });
    }

    fn mutate(
        &mut self,
        update: DirectiveUpdate,
    ) -> (bool, Option<(SideEffect, DirectiveState, Option<String>)>) {
        use DirectiveState::*;
        let d = &mut self.message.directives;

        match update {
            DirectiveUpdate::ContentAppended(text) => {
                if text.is_empty() {
                    return (false, None);
                }
                self.message.content.push_str(&text);
                (true, None)
            }

            DirectiveUpdate::SearchQueued { query } => {
                let state = self.state(SideEffect::Search);
                if state.is_terminal() {
                    return (false, None);
                }
                let d = &mut self.message.directives;
                if d.search_request.is_none() {
                    d.search_request = Some(query.clone());
                }
                d.multi_search.push(crate::conversation::SearchStep::queued(query.clone()));
                let first = state == NotDetected;
                if first {
                    self.ledger.insert(SideEffect::Search, Running);
                }
                (true, first.then(|| (SideEffect::Search, Running, Some(query))))
            }
            DirectiveUpdate::SearchStarted { index } => {
                let Some(step) = d.multi_search.get(index).filter(|s| !s.completed) else {
                    return (false, None);
                };
                let _ = self.events.send(ChatEvent::DirectiveProgress {
                    conversation_id: self.message.conversation_id.clone(),
                    message_id: self.message.id.clone(),
                    effect: SideEffect::Search,
                    state: Running,
                    detail: Some(format!("Step {}: {}", index + 1, step.query)),
                });
                (false, None)
            }
            DirectiveUpdate::SearchSucceeded { index, results } => {
                let Some(step) = d.multi_search.get_mut(index).filter(|s| !s.completed) else {
                    return (false, None);
                };
                step.completed = true;
                step.results = Some(results.clone());
                if index == 0 && d.search_results.is_none() {
                    d.search_results = Some(results);
                }
                (true, None)
            }
            DirectiveUpdate::SearchFailed { index, error } => {
                let Some(step) = d.multi_search.get_mut(index).filter(|s| !s.completed) else {
                    return (false, None);
                };
                step.completed = true;
                step.error = Some(error);
                (true, None)
            }
            DirectiveUpdate::SearchChainFinished { aggregate } => {
                let all_failed = !d.multi_search.is_empty()
                    && d.multi_search.iter().all(|s| s.is_error());
                let next = if all_failed { Errored } else { Completed };
                if !self.advance(SideEffect::Search, next) {
                    return (false, None);
                }
                let d = &mut self.message.directives;
                d.search_completed = true;
                if aggregate.is_some() {
                    d.search_results = aggregate;
                }
                (true, Some((SideEffect::Search, next, None)))
            }

            DirectiveUpdate::ImageStarted { prompt } => {
                if !self.advance(SideEffect::Image, Running) {
                    return (false, None);
                }
                let d = &mut self.message.directives;
                d.image_prompt = Some(prompt.clone());
                d.image_generation_completed = false;
                d.image_generation_error = false;
                (true, Some((SideEffect::Image, Running, Some(prompt))))
            }
            DirectiveUpdate::ImageSucceeded { images } => {
                if !self.advance(SideEffect::Image, Completed) {
                    return (false, None);
                }
                let d = &mut self.message.directives;
                d.image_generation_completed = true;
                d.image_generation_error = false;
                extend_images(&mut d.generated_images, images);
                (true, Some((SideEffect::Image, Completed, None)))
            }

            DirectiveUpdate::CodeDetected { code } => {
                if !self.advance(SideEffect::CodeExecution, Running) {
                    return (false, None);
                }
                let d = &mut self.message.directives;
                let language = code.language.clone();
                d.executable_code = Some(code);
                d.code_executing = true;
                d.code_executed = false;
                (true, Some((SideEffect::CodeExecution, Running, Some(language))))
            }
            DirectiveUpdate::CodeImages { images } => {
                if images.is_empty() {
                    return (false, None);
                }
                let finished = self.state(SideEffect::CodeExecution) == Running
                    && self.advance(SideEffect::CodeExecution, Completed);
                let d = &mut self.message.directives;
                let added = extend_images(&mut d.generated_images, images);
                if finished {
                    d.code_executing = false;
                    d.code_executed = true;
                }
                (
                    added || finished,
                    finished.then_some((SideEffect::CodeExecution, Completed, None)),
                )
            }
            DirectiveUpdate::CodeFinished => {
                if self.state(SideEffect::CodeExecution) != Running
                    || !self.advance(SideEffect::CodeExecution, Completed)
                {
                    return (false, None);
                }
                let d = &mut self.message.directives;
                d.code_executing = false;
                d.code_executed = true;
                (true, Some((SideEffect::CodeExecution, Completed, None)))
            }

            DirectiveUpdate::DirectiveStarted(kind) => {
                let effect = SideEffect::from(kind);
                let changed = self.advance(effect, Running);
                (false, changed.then_some((effect, Running, None)))
            }
            DirectiveUpdate::PageCreated { page_id, title } => {
                if !self.advance(SideEffect::Page, Completed) {
                    return (false, None);
                }
                self.message.directives.page_id = Some(page_id);
                self.notice(
                    DirectiveKind::Page,
                    format!("Created page \"{}\"", title),
                    false,
                );
                (true, Some((SideEffect::Page, Completed, Some(title))))
            }
            DirectiveUpdate::TextFileExported { file_name, path } => {
                if !self.advance(SideEffect::TextFile, Completed) {
                    return (false, None);
                }
                self.message.directives.exported_files.push(path.clone());
                self.notice(
                    DirectiveKind::TextFile,
                    format!("Created text file {} ({})", file_name, path),
                    false,
                );
                (true, Some((SideEffect::TextFile, Completed, Some(path))))
            }
            DirectiveUpdate::TaskRecorded { task } => {
                if !self.advance(SideEffect::Task, Completed) {
                    return (false, None);
                }
                let text = format!("Created {} task: {}", task.task_type, task.query);
                self.message.directives.tasks.push(task);
                self.notice(DirectiveKind::TaskCreate, text.clone(), false);
                (true, Some((SideEffect::Task, Completed, Some(text))))
            }
            DirectiveUpdate::FunctionCompleted { name, output } => {
                if !self.advance(SideEffect::FunctionCall, Completed) {
                    return (false, None);
                }
                self.notice(
                    DirectiveKind::FunctionCall,
                    format!("Called {}: {}", name, preview(&output, 200)),
                    false,
                );
                (true, Some((SideEffect::FunctionCall, Completed, Some(name))))
            }
            DirectiveUpdate::EffectFailed { effect, error } => self.fail(effect, error),

            DirectiveUpdate::FinalizingStarted => {
                let changed = !d.is_finalizing;
                d.is_finalizing = true;
                (changed, None)
            }
            DirectiveUpdate::FinalizingFinished => {
                let changed = d.is_finalizing;
                d.is_finalizing = false;
                (changed, None)
            }
            DirectiveUpdate::StreamFailed { apology } => {
                let changed = self.message.content != apology;
                self.message.content = apology;
                (changed, None)
            }
            DirectiveUpdate::ResponseTime(ms) => {
                let changed = self.message.response_time_ms != Some(ms);
                self.message.response_time_ms = Some(ms);
                (changed, None)
            }

            DirectiveUpdate::SearchResultsRestored { results } => {
                if d.search_results.is_some() {
                    return (false, None);
                }
                d.search_results = Some(results);
                (true, None)
            }
            DirectiveUpdate::SearchStepRestored { index, results } => {
                let Some(step) = d
                    .multi_search
                    .get_mut(index)
                    .filter(|s| s.results.is_none() && !s.is_error())
                else {
                    return (false, None);
                };
                step.results = Some(results);
                (true, None)
            }
            DirectiveUpdate::ImagesRestored { images } => {
                if d.generated_images.is_some() || images.is_empty() {
                    return (false, None);
                }
                d.generated_images = Some(images);
                (true, None)
            }
        }
    }

    fn fail(
        &mut self,
        effect: SideEffect,
        error: String,
    ) -> (bool, Option<(SideEffect, DirectiveState, Option<String>)>) {
        if !self.advance(effect, DirectiveState::Errored) {
            return (false, None);
        }
        let d = &mut self.message.directives;
        let notice = match effect {
            SideEffect::Image => {
                d.image_generation_completed = true;
                d.image_generation_error = true;
                Some((DirectiveKind::Image, format!("Image generation failed: {}", error)))
            }
            SideEffect::CodeExecution => {
                d.code_executing = false;
                None
            }
            SideEffect::Search => {
                d.search_completed = true;
                None
            }
            SideEffect::Page => Some((DirectiveKind::Page, format!("Could not create page: {}", error))),
            SideEffect::TextFile => Some((
                DirectiveKind::TextFile,
                format!("Could not create text file: {}", error),
            )),
            SideEffect::Task => Some((
                DirectiveKind::TaskCreate,
                format!("Could not create task: {}", error),
            )),
            SideEffect::FunctionCall => Some((
                DirectiveKind::FunctionCall,
                format!("Function call failed: {}", error),
            )),
        };
        if let Some((kind, text)) = notice {
            self.notice(kind, text, true);
        }
        (true, Some((effect, DirectiveState::Errored, Some(error))))
    }
}

/// Infer effect states from stored fields, for messages loaded from the store.
fn ledger_from_fields(d: &DirectiveFields) -> HashMap<SideEffect, DirectiveState> {
    use DirectiveState::*;
    let mut ledger = HashMap::new();

    if d.search_completed {
        let all_failed = !d.multi_search.is_empty() && d.multi_search.iter().all(|s| s.is_error());
        ledger.insert(SideEffect::Search, if all_failed { Errored } else { Completed });
    } else if d.search_request.is_some() || !d.multi_search.is_empty() {
        ledger.insert(SideEffect::Search, Running);
    }

    if d.image_generation_completed {
        let state = if d.image_generation_error { Errored } else { Completed };
        ledger.insert(SideEffect::Image, state);
    } else if d.image_prompt.is_some() {
        ledger.insert(SideEffect::Image, Running);
    }

    if d.code_executed {
        ledger.insert(SideEffect::CodeExecution, Completed);
    } else if d.code_executing {
        ledger.insert(SideEffect::CodeExecution, Running);
    } else if d.executable_code.is_some() {
        ledger.insert(SideEffect::CodeExecution, Errored);
    }

    if d.page_id.is_some() {
        ledger.insert(SideEffect::Page, Completed);
    }
    for notice in &d.notices {
        let state = if notice.is_error { Errored } else { Completed };
        ledger.entry(SideEffect::from(notice.kind)).or_insert(state);
    }
    ledger
}

fn extend_images(target: &mut Option<Vec<GeneratedImage>>, images: Vec<GeneratedImage>) -> bool {
    let existing = target.get_or_insert_with(Vec::new);
    let before = existing.len();
    for image in images {
        if !existing.iter().any(|e| e.src == image.src) {
            existing.push(image);
        }
    }
    existing.len() > before
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Shared handle injected into executors.
#[derive(Clone)]
pub struct ReconcilerHandle {
    inner: Arc<Mutex<MessageReconciler>>,
}

impl ReconcilerHandle {
    pub fn new(reconciler: MessageReconciler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(reconciler)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MessageReconciler> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn apply(&self, update: DirectiveUpdate) -> bool {
        self.lock().apply(update)
    }

    pub fn snapshot(&self) -> Message {
        self.lock().message().clone()
    }

    pub fn state(&self, effect: SideEffect) -> DirectiveState {
        self.lock().state(effect)
    }

    /// Waits until every update so far is in the store.
    pub async fn flush(&self) {
        let settled = self.lock().flush();
        let _ = settled.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::SearchStep;
    use crate::database::ChatDatabase;

    fn setup(settings: ReconcilerSettings) -> (ReconcilerHandle, Arc<ChatDatabase>, flume::Receiver<ChatEvent>, String) {
        let db = Arc::new(ChatDatabase::open_in_memory().unwrap());
        let conversation = db.create_conversation(None, "m").unwrap();
        let message = Message::assistant(&conversation.id);
        db.add_message_to_conversation(&conversation.id, &message).unwrap();
        let (tx, rx) = flume::unbounded();
        let store: Arc<dyn ConversationStore> = db.clone();
        let handle = ReconcilerHandle::new(MessageReconciler::new(message, store, tx, settings));
        (handle, db, rx, conversation.id)
    }

    fn results(answer: &str) -> SearchResults {
        SearchResults {
            answer: answer.to_string(),
            query: answer.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn image_lifecycle_reaches_terminal_flags_once() {
        let (handle, _db, _rx, _) = setup(ReconcilerSettings::default());
        let image = GeneratedImage {
            src: "https://img/cat.png".to_string(),
            alt: None,
        };

        assert!(handle.apply(DirectiveUpdate::ImageStarted {
            prompt: "cat".to_string()
        }));
        assert!(handle.apply(DirectiveUpdate::ImageSucceeded {
            images: vec![image.clone()]
        }));
        assert!(!handle.apply(DirectiveUpdate::ImageSucceeded {
            images: vec![image.clone()]
        }));
        assert!(!handle.apply(DirectiveUpdate::EffectFailed {
            effect: SideEffect::Image,
            error: "late".to_string()
        }));

        let message = handle.snapshot();
        assert!(message.directives.image_generation_completed);
        assert!(!message.directives.image_generation_error);
        assert_eq!(message.directives.generated_images, Some(vec![image]));
        assert_eq!(handle.state(SideEffect::Image), DirectiveState::Completed);
    }

    #[tokio::test]
    async fn search_steps_complete_individually_and_chain_finishes_once() {
        let (handle, db, _rx, conversation_id) = setup(ReconcilerSettings::default());

        handle.apply(DirectiveUpdate::SearchQueued { query: "a".to_string() });
        handle.apply(DirectiveUpdate::SearchQueued { query: "b".to_string() });
        handle.apply(DirectiveUpdate::SearchSucceeded { index: 0, results: results("A") });
        handle.apply(DirectiveUpdate::SearchFailed { index: 1, error: "timeout".to_string() });
        assert!(!handle.apply(DirectiveUpdate::SearchSucceeded { index: 1, results: results("B") }));

        assert!(handle.apply(DirectiveUpdate::SearchChainFinished {
            aggregate: Some(results("Step 1: A"))
        }));
        assert!(!handle.apply(DirectiveUpdate::SearchChainFinished { aggregate: None }));
        assert!(!handle.apply(DirectiveUpdate::SearchQueued { query: "late".to_string() }));

        let message = handle.snapshot();
        let d = &message.directives;
        assert_eq!(d.search_request.as_deref(), Some("a"));
        assert!(d.search_completed);
        assert_eq!(d.multi_search.len(), 2);
        assert_eq!(d.multi_search[1].error.as_deref(), Some("timeout"));
        assert_eq!(d.search_results.as_ref().unwrap().answer, "Step 1: A");

        handle.flush().await;
        let stored = db.load_conversation(&conversation_id).unwrap().unwrap();
        assert_eq!(stored.messages[0].directives, message.directives);
    }

    #[tokio::test]
    async fn apply_queues_the_write_and_flush_waits_for_it() {
        let (handle, db, _rx, conversation_id) = setup(ReconcilerSettings::default());

        assert!(handle.apply(DirectiveUpdate::ImageStarted { prompt: "fox".to_string() }));
        // Nothing has yielded yet, so the writer task has not run.
        let stored = db.load_conversation(&conversation_id).unwrap().unwrap();
        assert!(stored.messages[0].directives.image_prompt.is_none());

        handle.flush().await;
        let stored = db.load_conversation(&conversation_id).unwrap().unwrap();
        assert_eq!(stored.messages[0].directives.image_prompt.as_deref(), Some("fox"));
    }

    #[tokio::test]
    async fn persistence_can_omit_search_results_and_images() {
        let (handle, db, _rx, conversation_id) = setup(ReconcilerSettings {
            persist_search_results: false,
            persist_generated_images: false,
            ..Default::default()
        });

        handle.apply(DirectiveUpdate::SearchQueued { query: "q".to_string() });
        handle.apply(DirectiveUpdate::SearchSucceeded { index: 0, results: results("A") });
        handle.apply(DirectiveUpdate::SearchChainFinished { aggregate: Some(results("A")) });
        handle.apply(DirectiveUpdate::ImageStarted { prompt: "p".to_string() });
        handle.apply(DirectiveUpdate::ImageSucceeded {
            images: vec![GeneratedImage { src: "x".to_string(), alt: None }],
        });

        handle.flush().await;
        let stored = db.load_conversation(&conversation_id).unwrap().unwrap();
        let d = &stored.messages[0].directives;
        assert!(d.search_completed);
        assert!(d.search_results.is_none());
        assert_eq!(d.multi_search, vec![SearchStep { completed: true, ..SearchStep::queued("q") }]);
        assert!(d.image_generation_completed);
        assert!(d.generated_images.is_none());

        assert!(handle.snapshot().directives.search_results.is_some());
    }

    #[tokio::test]
    async fn failures_become_error_notices() {
        let (handle, _db, rx, _) = setup(ReconcilerSettings::default());

        handle.apply(DirectiveUpdate::DirectiveStarted(DirectiveKind::TaskCreate));
        handle.apply(DirectiveUpdate::EffectFailed {
            effect: SideEffect::Task,
            error: "missing ':'".to_string(),
        });

        let message = handle.snapshot();
        let notice = message.notice_for(DirectiveKind::TaskCreate).unwrap();
        assert!(notice.is_error);
        assert_eq!(notice.text, "Could not create task: missing ':'");

        let states: Vec<_> = rx
            .drain()
            .filter_map(|event| match event {
                ChatEvent::DirectiveProgress { effect, state, .. } => Some((effect, state)),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                (SideEffect::Task, DirectiveState::Running),
                (SideEffect::Task, DirectiveState::Errored)
            ]
        );
    }

    #[tokio::test]
    async fn code_toggles_executing_and_ignores_second_block() {
        let (handle, _db, _rx, _) = setup(ReconcilerSettings::default());
        let code = ExecutableCode {
            code: "plot()".to_string(),
            language: "python".to_string(),
        };

        handle.apply(DirectiveUpdate::CodeDetected { code: code.clone() });
        assert!(handle.snapshot().directives.code_executing);

        handle.apply(DirectiveUpdate::CodeImages {
            images: vec![GeneratedImage { src: "chart.png".to_string(), alt: None }],
        });
        let d = handle.snapshot().directives;
        assert!(!d.code_executing);
        assert!(d.code_executed);

        assert!(!handle.apply(DirectiveUpdate::CodeDetected {
            code: ExecutableCode { code: "other()".to_string(), ..code.clone() }
        }));
        assert_eq!(handle.snapshot().directives.executable_code, Some(code));
    }

    #[test]
    fn ledger_is_rebuilt_from_stored_fields() {
        let mut fields = DirectiveFields::default();
        fields.search_completed = true;
        fields.multi_search = vec![SearchStep::queued("q")];
        fields.image_prompt = Some("p".to_string());
        fields.image_generation_completed = true;
        fields.image_generation_error = true;

        let ledger = ledger_from_fields(&fields);
        assert_eq!(ledger.get(&SideEffect::Search), Some(&DirectiveState::Completed));
        assert_eq!(ledger.get(&SideEffect::Image), Some(&DirectiveState::Errored));
        assert_eq!(ledger.get(&SideEffect::Page), None);
    }
}
