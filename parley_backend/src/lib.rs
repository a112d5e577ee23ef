pub mod collaborators;
pub mod config;
pub mod conversation;
pub mod database;
pub mod directives;
pub mod display;
pub mod events;
pub mod executors;
pub mod exporter;
pub mod functions;
pub mod http_client;
pub mod image_client;
pub mod llm_client;
pub mod orchestrator;
pub mod runtime;
pub mod search_client;

pub use events::ChatEvent;
pub use orchestrator::{ChatOrchestrator, TurnOutcome, TurnStatus};
pub use runtime::{ParleyRuntime, ParleyRuntimeBuilder};
