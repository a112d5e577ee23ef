use std::sync::Arc;

use super::{ExecutorContext, ExecutorReport, CANCELLED};
use crate::collaborators::FileExporter;
use crate::directives::DirectiveKind;
use crate::exporter::{sanitize_file_name, DEFAULT_FILE_NAME};
use crate::orchestrator::reconciler::{DirectiveUpdate, SideEffect};

pub struct TextFileExecutor {
    exporter: Arc<dyn FileExporter>,
    ctx: ExecutorContext,
}

impl TextFileExecutor {
    pub fn new(exporter: Arc<dyn FileExporter>, ctx: ExecutorContext) -> Self {
        Self { exporter, ctx }
    }

    pub async fn run(self, name: Option<String>, body: String) -> ExecutorReport {
        let reconciler = &self.ctx.reconciler;
        reconciler.apply(DirectiveUpdate::DirectiveStarted(DirectiveKind::TextFile));

        if self.ctx.cancel.is_cancelled() {
            reconciler.apply(DirectiveUpdate::EffectFailed {
                effect: SideEffect::TextFile,
                error: CANCELLED.to_string(),
            });
            return ExecutorReport::silent(SideEffect::TextFile);
        }

        let file_name = sanitize_file_name(name.as_deref().unwrap_or(DEFAULT_FILE_NAME));
        match self.exporter.export(&file_name, &body) {
            Ok(path) => {
                reconciler.apply(DirectiveUpdate::TextFileExported {
                    file_name,
                    path: path.to_string_lossy().into_owned(),
                });
            }
            Err(e) => {
                tracing::warn!("Failed to export {}: {:#}", file_name, e);
                reconciler.apply(DirectiveUpdate::EffectFailed {
                    effect: SideEffect::TextFile,
                    error: format!("{:#}", e),
                });
            }
        }
        ExecutorReport::silent(SideEffect::TextFile)
    }
}
