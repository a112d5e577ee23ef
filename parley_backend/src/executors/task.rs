use super::{ExecutorContext, ExecutorReport, CANCELLED};
use crate::directives::{parse_task, DirectiveKind};
use crate::orchestrator::reconciler::{DirectiveUpdate, SideEffect};

/// Records a `type:query` task on the message. Nothing is scheduled.
pub struct TaskExecutor {
    ctx: ExecutorContext,
}

impl TaskExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }

    pub async fn run(self, body: String) -> ExecutorReport {
        let reconciler = &self.ctx.reconciler;
        reconciler.apply(DirectiveUpdate::DirectiveStarted(DirectiveKind::TaskCreate));

        let parsed = if self.ctx.cancel.is_cancelled() {
            Err(anyhow::anyhow!(CANCELLED))
        } else {
            parse_task(&body)
        };

        match parsed {
            Ok(task) => {
                tracing::info!("Recorded {} task: {}", task.task_type, task.query);
                reconciler.apply(DirectiveUpdate::TaskRecorded { task });
            }
            Err(e) => {
                tracing::warn!("Rejected task directive: {:#}", e);
                reconciler.apply(DirectiveUpdate::EffectFailed {
                    effect: SideEffect::Task,
                    error: format!("{:#}", e),
                });
            }
        }
        ExecutorReport::silent(SideEffect::Task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::testing::fixture;

    #[tokio::test]
    async fn records_task_and_confirms() {
        let fixture = fixture();
        TaskExecutor::new(fixture.ctx.clone())
            .run("Research: solid state batteries".to_string())
            .await;

        let message = fixture.ctx.reconciler.snapshot();
        assert_eq!(message.directives.tasks.len(), 1);
        assert_eq!(message.directives.tasks[0].task_type, "research");
        assert_eq!(
            message.notice_for(DirectiveKind::TaskCreate).unwrap().text,
            "Created research task: solid state batteries"
        );
    }
}
