use std::sync::Arc;

use super::{ExecutorContext, ExecutorReport, CANCELLED};
use crate::directives::{parse_function_call, DirectiveKind};
use crate::functions::{FunctionOutput, FunctionRegistry};
use crate::orchestrator::reconciler::{DirectiveUpdate, SideEffect};

pub struct FunctionCallExecutor {
    registry: Arc<FunctionRegistry>,
    ctx: ExecutorContext,
}

impl FunctionCallExecutor {
    pub fn new(registry: Arc<FunctionRegistry>, ctx: ExecutorContext) -> Self {
        Self { registry, ctx }
    }

    pub async fn run(self, body: String) -> ExecutorReport {
        let reconciler = &self.ctx.reconciler;
        reconciler.apply(DirectiveUpdate::DirectiveStarted(DirectiveKind::FunctionCall));

        let invocation = match parse_function_call(&body) {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::warn!("Rejected function call '{}': {:#}", body, e);
                reconciler.apply(DirectiveUpdate::EffectFailed {
                    effect: SideEffect::FunctionCall,
                    error: format!("{:#}", e),
                });
                return ExecutorReport::silent(SideEffect::FunctionCall);
            }
        };

        let output = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => FunctionOutput::Error(CANCELLED.to_string()),
            output = self.registry.invoke(&invocation) => output,
        };
        let rendered = output.to_llm_string();

        match output {
            FunctionOutput::Error(error) => {
                tracing::warn!("Function {} failed: {}", invocation.name, error);
                reconciler.apply(DirectiveUpdate::EffectFailed {
                    effect: SideEffect::FunctionCall,
                    error,
                });
                ExecutorReport::required(
                    SideEffect::FunctionCall,
                    format!("Function {} failed: {}", invocation.name, rendered),
                )
            }
            _ => {
                tracing::debug!("Function {} returned {} bytes", invocation.name, rendered.len());
                reconciler.apply(DirectiveUpdate::FunctionCompleted {
                    name: invocation.name.clone(),
                    output: rendered.clone(),
                });
                ExecutorReport::required(
                    SideEffect::FunctionCall,
                    format!("Function {} returned:\n{}", invocation.name, rendered),
                )
            }
        }
    }
}
