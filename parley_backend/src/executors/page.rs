use std::sync::Arc;

use super::{ExecutorContext, ExecutorReport, CANCELLED};
use crate::collaborators::ConversationStore;
use crate::conversation::Page;
use crate::directives::DirectiveKind;
use crate::orchestrator::reconciler::{DirectiveUpdate, SideEffect};

pub struct PageExecutor {
    store: Arc<dyn ConversationStore>,
    ctx: ExecutorContext,
}

impl PageExecutor {
    pub fn new(store: Arc<dyn ConversationStore>, ctx: ExecutorContext) -> Self {
        Self { store, ctx }
    }

    pub async fn run(self, body: String) -> ExecutorReport {
        let reconciler = &self.ctx.reconciler;
        reconciler.apply(DirectiveUpdate::DirectiveStarted(DirectiveKind::Page));

        if self.ctx.cancel.is_cancelled() {
            reconciler.apply(DirectiveUpdate::EffectFailed {
                effect: SideEffect::Page,
                error: CANCELLED.to_string(),
            });
            return ExecutorReport::silent(SideEffect::Page);
        }

        let page = Page::from_markdown(&self.ctx.conversation_id, &self.ctx.message_id, &body);
        match self.store.create_page(&page) {
            Ok(()) => {
                tracing::info!("Created page '{}' ({})", page.title, page.id);
                reconciler.apply(DirectiveUpdate::PageCreated {
                    page_id: page.id,
                    title: page.title,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to create page: {:#}", e);
                reconciler.apply(DirectiveUpdate::EffectFailed {
                    effect: SideEffect::Page,
                    error: format!("{:#}", e),
                });
            }
        }
        ExecutorReport::silent(SideEffect::Page)
    }
}
