use std::sync::Arc;

use super::{ExecutorContext, ExecutorReport, CANCELLED};
use crate::collaborators::ImageGenerator;
use crate::orchestrator::reconciler::{DirectiveUpdate, SideEffect};

pub struct ImageExecutor {
    images: Arc<dyn ImageGenerator>,
    ctx: ExecutorContext,
}

impl ImageExecutor {
    pub fn new(images: Arc<dyn ImageGenerator>, ctx: ExecutorContext) -> Self {
        Self { images, ctx }
    }

    pub async fn run(self, prompt: String) -> ExecutorReport {
        let reconciler = &self.ctx.reconciler;
        reconciler.apply(DirectiveUpdate::ImageStarted {
            prompt: prompt.clone(),
        });

        let result = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(CANCELLED.to_string()),
            generated = self.images.generate_image(&prompt) => match generated {
                Ok(images) if images.is_empty() => Err("no images were returned".to_string()),
                Ok(images) => Ok(images),
                Err(e) => Err(format!("{:#}", e)),
            },
        };

        match result {
            Ok(images) => {
                tracing::info!("Generated {} image(s) for '{}'", images.len(), prompt);
                reconciler.apply(DirectiveUpdate::ImageSucceeded { images });
                ExecutorReport::optional(
                    SideEffect::Image,
                    format!(
                        "An image for the prompt \"{}\" was generated and is already shown to the user.",
                        prompt
                    ),
                )
            }
            Err(error) => {
                tracing::warn!("Image generation for '{}' failed: {}", prompt, error);
                reconciler.apply(DirectiveUpdate::EffectFailed {
                    effect: SideEffect::Image,
                    error: error.clone(),
                });
                ExecutorReport::optional(
                    SideEffect::Image,
                    format!("Image generation for \"{}\" failed: {}", prompt, error),
                )
            }
        }
    }
}
