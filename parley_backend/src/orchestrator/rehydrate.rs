//! Restores results that were not persisted (or were lost) for messages whose
//! flags say the work already finished. Flags are never touched; only the
//! missing payloads are filled in.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use flume::Sender;

use crate::collaborators::{ConversationStore, ImageGenerator, WebSearch};
use crate::conversation::{Conversation, Message, Speaker};
use crate::events::ChatEvent;
use crate::executors::search::{aggregate_results, StepOutcome};

use super::reconciler::{DirectiveUpdate, MessageReconciler, ReconcilerHandle, ReconcilerSettings};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RehydrateReport {
    pub messages_touched: usize,
    pub searches_rerun: usize,
    pub images_regenerated: usize,
}

pub struct Rehydrator {
    search: Arc<dyn WebSearch>,
    images: Arc<dyn ImageGenerator>,
    store: Arc<dyn ConversationStore>,
    events: Sender<ChatEvent>,
    settings: ReconcilerSettings,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases a message id from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.id);
    }
}

impl Rehydrator {
    pub fn new(
        search: Arc<dyn WebSearch>,
        images: Arc<dyn ImageGenerator>,
        store: Arc<dyn ConversationStore>,
        events: Sender<ChatEvent>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            search,
            images,
            store,
            events,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn needs_rehydration(message: &Message) -> bool {
        if message.sender != Speaker::Assistant {
            return false;
        }
        let d = &message.directives;
        let single_missing = d.search_completed
            && d.search_results.is_none()
            && d.search_request.is_some()
            && (d.multi_search.is_empty() || d.multi_search.iter().any(|s| !s.is_error()));
        let steps_missing = d
            .multi_search
            .iter()
            .any(|s| s.completed && !s.is_error() && s.results.is_none());
        let images_missing = d.image_generation_completed
            && !d.image_generation_error
            && d.generated_images.is_none()
            && d.image_prompt.is_some();
        single_missing || steps_missing || images_missing
    }

    fn claim(&self, message_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(message_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            id: message_id.to_string(),
        })
    }

    /// Fill in missing results for every eligible message of `conversation`,
    /// updating it in place. A second run over the same conversation is a
    /// no-op.
    pub async fn rehydrate_conversation(&self, conversation: &mut Conversation) -> RehydrateReport {
        let mut report = RehydrateReport::default();

        for message in conversation.messages.iter_mut() {
            if !Self::needs_rehydration(message) {
                continue;
            }
            let Some(_guard) = self.claim(&message.id) else {
                tracing::debug!("Message {} is already being rehydrated", message.id);
                continue;
            };

            let handle = ReconcilerHandle::new(MessageReconciler::new(
                message.clone(),
                self.store.clone(),
                self.events.clone(),
                self.settings.clone(),
            ));
            let (searches, images) = self.rehydrate_message(message, &handle).await;
            handle.flush().await;
            if searches + images > 0 {
                report.messages_touched += 1;
                report.searches_rerun += searches;
                report.images_regenerated += images;
            }
            *message = handle.snapshot();
        }

        if report.messages_touched > 0 {
            tracing::info!(
                "Rehydrated {} message(s) in {} ({} searches, {} images)",
                report.messages_touched,
                conversation.id,
                report.searches_rerun,
                report.images_regenerated
            );
        }
        report
    }

    async fn rehydrate_message(&self, message: &Message, handle: &ReconcilerHandle) -> (usize, usize) {
        let d = &message.directives;
        let mut searches = 0;
        let mut images = 0;

        // Steps first, so a multi-step aggregate can be rebuilt from them.
        let mut outcomes = Vec::new();
        for (index, step) in d.multi_search.iter().enumerate() {
            if step.is_error() {
                outcomes.push(StepOutcome {
                    index,
                    query: step.query.clone(),
                    result: Err(step.error.clone().unwrap_or_default()),
                });
                continue;
            }
            if let Some(results) = &step.results {
                outcomes.push(StepOutcome {
                    index,
                    query: step.query.clone(),
                    result: Ok(results.clone()),
                });
                continue;
            }
            if !step.completed {
                continue;
            }
            match self.search.search_web(&step.query).await {
                Ok(results) => {
                    searches += 1;
                    handle.apply(DirectiveUpdate::SearchStepRestored {
                        index,
                        results: results.clone(),
                    });
                    outcomes.push(StepOutcome {
                        index,
                        query: step.query.clone(),
                        result: Ok(results),
                    });
                }
                Err(e) => {
                    tracing::warn!("Could not restore search '{}': {:#}", step.query, e);
                    outcomes.push(StepOutcome {
                        index,
                        query: step.query.clone(),
                        result: Err(format!("{:#}", e)),
                    });
                }
            }
        }

        if d.search_completed && d.search_results.is_none() {
            let restored = if outcomes.is_empty() {
                match d.search_request.as_deref() {
                    Some(query) => match self.search.search_web(query).await {
                        Ok(results) => {
                            searches += 1;
                            Some(results)
                        }
                        Err(e) => {
                            tracing::warn!("Could not restore search '{}': {:#}", query, e);
                            None
                        }
                    },
                    None => None,
                }
            } else {
                aggregate_results(&outcomes)
            };
            if let Some(results) = restored {
                handle.apply(DirectiveUpdate::SearchResultsRestored { results });
            }
        }

        if d.image_generation_completed && !d.image_generation_error && d.generated_images.is_none() {
            if let Some(prompt) = d.image_prompt.as_deref() {
                match self.images.generate_image(prompt).await {
                    Ok(generated) if !generated.is_empty() => {
                        images += 1;
                        handle.apply(DirectiveUpdate::ImagesRestored { images: generated });
                    }
                    Ok(_) => tracing::warn!("Image regeneration for '{}' returned nothing", prompt),
                    Err(e) => tracing::warn!("Could not regenerate image '{}': {:#}", prompt, e),
                }
            }
        }

        (searches, images)
    }
}
