use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use super::{ExecutorContext, ExecutorReport, CANCELLED};
use crate::collaborators::WebSearch;
use crate::conversation::{SearchImage, SearchResults, SearchSource};
use crate::orchestrator::reconciler::{DirectiveUpdate, SideEffect};

/// A search tag waiting its turn in the chain. `index` is its position in
/// `multi_search`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSearch {
    pub index: usize,
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub index: usize,
    pub query: String,
    pub result: Result<SearchResults, String>,
}

/// Runs every queued query strictly in order: step i+1 is only received
/// after step i is terminal. The chain ends when the queue closes.
pub struct SearchExecutor {
    search: Arc<dyn WebSearch>,
    ctx: ExecutorContext,
}

impl SearchExecutor {
    pub fn new(search: Arc<dyn WebSearch>, ctx: ExecutorContext) -> Self {
        Self { search, ctx }
    }

    pub async fn run(self, mut queue: UnboundedReceiver<QueuedSearch>) -> ExecutorReport {
        let reconciler = &self.ctx.reconciler;
        let cancel = &self.ctx.cancel;
        let mut outcomes = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = queue.recv() => item,
            };
            let Some(step) = next else {
                break;
            };

            reconciler.apply(DirectiveUpdate::SearchStarted { index: step.index });
            tracing::debug!("Search step {}: {}", step.index + 1, step.query);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CANCELLED.to_string()),
                found = self.search.search_web(&step.query) => found.map_err(|e| format!("{:#}", e)),
            };

            match &result {
                Ok(results) => {
                    reconciler.apply(DirectiveUpdate::SearchSucceeded {
                        index: step.index,
                        results: results.clone(),
                    });
                }
                Err(error) => {
                    tracing::warn!("Search step {} failed: {}", step.index + 1, error);
                    reconciler.apply(DirectiveUpdate::SearchFailed {
                        index: step.index,
                        error: error.clone(),
                    });
                }
            }
            outcomes.push(StepOutcome {
                index: step.index,
                query: step.query,
                result,
            });
        }

        if cancel.is_cancelled() {
            queue.close();
            while let Ok(step) = queue.try_recv() {
                reconciler.apply(DirectiveUpdate::SearchFailed {
                    index: step.index,
                    error: CANCELLED.to_string(),
                });
            }
        }

        reconciler.apply(DirectiveUpdate::SearchChainFinished {
            aggregate: aggregate_results(&outcomes),
        });
        tracing::info!("Search chain finished after {} step(s)", outcomes.len());

        match search_context(&outcomes) {
            Some(context) => ExecutorReport::required(SideEffect::Search, context),
            None => ExecutorReport::silent(SideEffect::Search),
        }
    }
}

/// One query: its results. Several: answers labeled by step, sources and
/// images concatenated without duplicates.
pub fn aggregate_results(outcomes: &[StepOutcome]) -> Option<SearchResults> {
    if let [single] = outcomes {
        return single.result.as_ref().ok().cloned();
    }

    let succeeded: Vec<(usize, &SearchResults)> = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok().map(|r| (o.index, r)))
        .collect();
    if succeeded.is_empty() {
        return None;
    }

    let mut aggregate = SearchResults {
        answer: succeeded
            .iter()
            .filter(|(_, r)| !r.answer.trim().is_empty())
            .map(|(index, r)| format!("Step {}: {}", index + 1, r.answer.trim()))
            .collect::<Vec<_>>()
            .join("\n\n"),
        query: outcomes
            .iter()
            .map(|o| o.query.as_str())
            .collect::<Vec<_>>()
            .join(" | "),
        ..Default::default()
    };

    for (_, results) in &succeeded {
        for source in &results.sources {
            if !aggregate.sources.iter().any(|s: &SearchSource| s.url == source.url) {
                aggregate.sources.push(source.clone());
            }
        }
        for image in &results.images {
            if !aggregate.images.iter().any(|i: &SearchImage| i.url == image.url) {
                aggregate.images.push(image.clone());
            }
        }
    }
    Some(aggregate)
}

fn search_context(outcomes: &[StepOutcome]) -> Option<String> {
    if outcomes.is_empty() {
        return None;
    }

    let mut out = String::from("Web search results:\n");
    for outcome in outcomes {
        out.push_str(&format!("\n### Step {}: {}\n", outcome.index + 1, outcome.query));
        match &outcome.result {
            Ok(results) => {
                if !results.answer.trim().is_empty() {
                    out.push_str(&format!("Answer: {}\n", results.answer.trim()));
                }
                if !results.sources.is_empty() {
                    out.push_str("Sources:\n");
                    for source in &results.sources {
                        out.push_str(&format!(
                            "- {} ({}): {}\n",
                            source.title,
                            source.url,
                            truncate(&source.content, 500)
                        ));
                    }
                }
            }
            Err(error) => out.push_str(&format!("This search failed: {}\n", error)),
        }
    }
    Some(out)
}

fn truncate(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}
