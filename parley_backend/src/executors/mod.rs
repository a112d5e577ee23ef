//! One executor per side effect. Executors receive their collaborators and a
//! [`ReconcilerHandle`] at construction, report every state change through
//! the handle, and return an [`ExecutorReport`] with whatever hidden context
//! the finalization step should see.

pub mod code;
pub mod function_call;
pub mod image;
pub mod page;
pub mod search;
pub mod task;
pub mod text_file;

pub use code::CodeExecutor;
pub use function_call::FunctionCallExecutor;
pub use image::ImageExecutor;
pub use page::PageExecutor;
pub use search::{QueuedSearch, SearchExecutor};
pub use task::TaskExecutor;
pub use text_file::TextFileExecutor;

use tokio_util::sync::CancellationToken;

use crate::orchestrator::reconciler::{ReconcilerHandle, SideEffect};

pub const CANCELLED: &str = "cancelled";

/// Per-turn state every executor needs.
#[derive(Clone)]
pub struct ExecutorContext {
    pub conversation_id: String,
    pub message_id: String,
    pub reconciler: ReconcilerHandle,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorReport {
    pub effect: SideEffect,
    pub context: Option<String>,
    /// Whether `context` alone is reason to run finalization. Image reports
    /// only ride along when something else already needs it.
    pub requires_finalization: bool,
}

impl ExecutorReport {
    pub fn silent(effect: SideEffect) -> Self {
        Self {
            effect,
            context: None,
            requires_finalization: false,
        }
    }

    pub fn required(effect: SideEffect, context: String) -> Self {
        Self {
            effect,
            context: Some(context),
            requires_finalization: true,
        }
    }

    pub fn optional(effect: SideEffect, context: String) -> Self {
        Self {
            effect,
            context: Some(context),
            requires_finalization: false,
        }
    }
}
