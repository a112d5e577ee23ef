use crate::conversation::Message;
use crate::orchestrator::reconciler::{DirectiveState, SideEffect};
use crate::orchestrator::TurnStatus;

/// Events sent from the orchestrator to the frontend.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Throttled snapshot of the in-flight assistant message.
    MessageUpdated {
        conversation_id: String,
        message: Message,
    },
    /// A new message was added to the conversation (e.g. a finalized answer).
    MessageAppended {
        conversation_id: String,
        message: Message,
    },
    DirectiveProgress {
        conversation_id: String,
        message_id: String,
        effect: SideEffect,
        state: DirectiveState,
        detail: Option<String>,
    },
    TurnCompleted {
        conversation_id: String,
        message_id: String,
        status: TurnStatus,
        response_time_ms: u64,
    },
    Error(String),
}
