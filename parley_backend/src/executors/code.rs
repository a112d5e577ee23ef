use std::sync::Arc;

use futures_util::StreamExt;

use super::{ExecutorContext, ExecutorReport, CANCELLED};
use crate::collaborators::{ChatRequest, LanguageModel, StreamChunk};
use crate::orchestrator::accumulator::first_fenced_code;
use crate::orchestrator::reconciler::{DirectiveState, DirectiveUpdate, SideEffect};

pub const VISUALIZATION_PROMPT: &str = "You write data visualizations. Using only the data in \
the hidden context, write one self-contained Python script (matplotlib) that answers the \
user's request. Put the script in a single fenced code block, followed by one or two \
sentences describing the chart. Do not emit any directive tags.";

/// Secondary streamed request that produces visualization code (and, from
/// code-execution capable models, the rendered images).
pub struct CodeExecutor {
    model: Arc<dyn LanguageModel>,
    ctx: ExecutorContext,
}

impl CodeExecutor {
    pub fn new(model: Arc<dyn LanguageModel>, ctx: ExecutorContext) -> Self {
        Self { model, ctx }
    }

    pub async fn run_delegated(self, request: ChatRequest) -> ExecutorReport {
        let reconciler = &self.ctx.reconciler;
        let cancel = &self.ctx.cancel;

        if reconciler.state(SideEffect::CodeExecution) != DirectiveState::NotDetected {
            tracing::debug!("Code already handled this turn, skipping visualization request");
            return ExecutorReport::silent(SideEffect::CodeExecution);
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExecutorReport::silent(SideEffect::CodeExecution),
            opened = self.model.stream_message(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Visualization request failed to start: {:#}", e);
                return ExecutorReport::silent(SideEffect::CodeExecution);
            }
        };

        let mut text = String::new();
        let mut stream_error = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => {
                    stream_error = Some(format!("{:#}", e));
                    break;
                }
                Some(Ok(StreamChunk::Text(fragment))) => text.push_str(&fragment),
                Some(Ok(StreamChunk::Payload(payload))) => {
                    if let Some(content) = payload.content {
                        text.push_str(&content);
                    }
                    if let Some(code) = payload.executable_code {
                        reconciler.apply(DirectiveUpdate::CodeDetected { code });
                    }
                    if let Some(images) = payload.generated_images {
                        reconciler.apply(DirectiveUpdate::CodeImages { images });
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            reconciler.apply(DirectiveUpdate::EffectFailed {
                effect: SideEffect::CodeExecution,
                error: CANCELLED.to_string(),
            });
            return ExecutorReport::silent(SideEffect::CodeExecution);
        }

        if reconciler.state(SideEffect::CodeExecution) == DirectiveState::NotDetected {
            if let Some(code) = first_fenced_code(&text) {
                reconciler.apply(DirectiveUpdate::CodeDetected { code });
            }
        }

        match stream_error {
            Some(error) => {
                tracing::warn!("Visualization stream failed: {}", error);
                reconciler.apply(DirectiveUpdate::EffectFailed {
                    effect: SideEffect::CodeExecution,
                    error,
                });
            }
            None => {
                reconciler.apply(DirectiveUpdate::CodeFinished);
            }
        }

        let message = reconciler.snapshot();
        let Some(code) = message.directives.executable_code else {
            tracing::debug!("Visualization request produced no code");
            return ExecutorReport::silent(SideEffect::CodeExecution);
        };

        let image_count = message
            .directives
            .generated_images
            .as_ref()
            .map_or(0, Vec::len);
        let mut context = format!(
            "A visualization was prepared for the user and is already displayed \
             ({} rendered image(s)). Code:\n```{}\n{}\n```\n",
            image_count, code.language, code.code
        );
        let explanation = strip_fences(&text);
        if !explanation.is_empty() {
            context.push_str(&format!("Notes from the visualization step: {}\n", explanation));
        }
        ExecutorReport::required(SideEffect::CodeExecution, context)
    }
}

fn strip_fences(text: &str) -> String {
    let mut out = Vec::new();
    let mut in_fence = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence && !line.trim().is_empty() {
            out.push(line.trim());
        }
    }
    out.join(" ")
}
