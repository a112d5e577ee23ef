use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::config::ParleyConfig;
use crate::database::ChatDatabase;
use crate::events::ChatEvent;
use crate::exporter::DirectoryExporter;
use crate::functions::{Function, FunctionRegistry};
use crate::http_client::build_http_client;
use crate::image_client::ImageClient;
use crate::llm_client::LlmClient;
use crate::orchestrator::{
    ChatOrchestrator, OrchestratorSettings, ReconcilerSettings, Rehydrator, Services,
};
use crate::search_client::SearchClient;

pub struct ParleyRuntime {
    pub config: ParleyConfig,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub rehydrator: Arc<Rehydrator>,
    pub database: Arc<ChatDatabase>,
    pub functions: Arc<FunctionRegistry>,
}

pub struct ParleyRuntimeBuilder {
    config: ParleyConfig,
    event_tx: Sender<ChatEvent>,
    functions: Vec<Arc<dyn Function>>,
}

impl ParleyRuntimeBuilder {
    pub fn new(config: ParleyConfig, event_tx: Sender<ChatEvent>) -> Self {
        Self {
            config,
            event_tx,
            functions: Vec::new(),
        }
    }

    pub fn with_function(mut self, function: Arc<dyn Function>) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_functions<I>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Function>>,
    {
        self.functions.extend(functions);
        self
    }

    pub async fn build(self) -> Result<ParleyRuntime> {
        let config = self.config;

        let functions = Arc::new(FunctionRegistry::with_builtins().await);
        for function in self.functions {
            functions.register(function).await;
        }
        tracing::info!("Functions available: {:?}", functions.list_names().await);

        let http = build_http_client(config.request_timeout())?;
        let system_prompt = format!(
            "{}\n\nFunctions you can call with FUNCTION_CALL:\n{}",
            config.system_prompt.trim_end(),
            functions.describe().await
        );
        let model = LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            system_prompt,
            http.clone(),
        )
        .with_sampling(config.temperature, config.max_tokens);

        if config.search.api_key.is_none() {
            tracing::warn!("No search API key configured; search directives will fail");
        }
        let search = SearchClient::new(&config.search, http.clone());
        let images = ImageClient::new(&config.image, http);

        let database = Arc::new(
            ChatDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database {}", config.database_path))?,
        );
        let exporter = DirectoryExporter::new(&config.export_dir);
        tracing::info!(
            "Database at {}, exports to {}",
            config.database_path,
            config.export_dir
        );

        let services = Services {
            model: Arc::new(model),
            search: Arc::new(search),
            images: Arc::new(images),
            store: database.clone(),
            exporter: Arc::new(exporter),
            functions: functions.clone(),
        };
        let settings = OrchestratorSettings {
            model: config.llm_model.clone(),
            reconciler: ReconcilerSettings {
                ui_throttle: config.ui_throttle(),
                persist_search_results: config.persist_search_results,
                persist_generated_images: config.persist_generated_images,
            },
            visualization_keywords: config.visualization_keywords.clone(),
            ..Default::default()
        };

        let orchestrator = Arc::new(ChatOrchestrator::new(services, self.event_tx, settings));
        let rehydrator = Arc::new(orchestrator.rehydrator());

        Ok(ParleyRuntime {
            config,
            orchestrator,
            rehydrator,
            database,
            functions,
        })
    }
}

impl ParleyRuntime {
    pub async fn bootstrap(config: ParleyConfig, event_tx: Sender<ChatEvent>) -> Result<Self> {
        ParleyRuntimeBuilder::new(config, event_tx).build().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ConversationStore;
    use crate::functions::FunctionOutput;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo;

    #[async_trait]
    impl Function for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Returns its input"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn call(&self, arguments: Value) -> anyhow::Result<FunctionOutput> {
            Ok(FunctionOutput::Json(arguments))
        }
    }

    #[tokio::test]
    async fn builds_runtime_against_local_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = ParleyConfig {
            database_path: dir.path().join("db/parley.db").to_string_lossy().into_owned(),
            export_dir: dir.path().join("exports").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let (tx, _rx) = flume::unbounded();

        let runtime = ParleyRuntimeBuilder::new(config, tx)
            .with_function(Arc::new(Echo))
            .build()
            .await
            .unwrap();

        assert_eq!(
            runtime.functions.list_names().await,
            vec!["current_time", "echo", "word_count"]
        );
        assert!(runtime.orchestrator.wants_visualization("plot it"));
        assert_eq!(runtime.orchestrator.settings().model, runtime.config.llm_model);

        let conversation = runtime.database.create_conversation(None, "m").unwrap();
        assert!(runtime
            .database
            .load_conversation(&conversation.id)
            .unwrap()
            .is_some());
    }
}
