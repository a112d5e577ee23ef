use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_search_max_results")]
    pub max_results: u32,
}

fn default_search_url() -> String {
    "https://api.tavily.com".to_string()
}

fn default_search_max_results() -> u32 {
    5
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_url: default_search_url(),
            api_key: None,
            max_results: default_search_max_results(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_image_size")]
    pub size: String,
    /// When set, base64 image payloads are decoded and written here and the
    /// message references the file instead of a data URI.
    #[serde(default)]
    pub output_dir: Option<String>,
}

fn default_image_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_image_model() -> String {
    "gpt-image-1".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            api_url: default_image_url(),
            api_key: None,
            model: default_image_model(),
            size: default_image_size(),
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParleyConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub image: ImageConfig,

    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_export_dir")]
    pub export_dir: String,
    /// Store search results with the message; when off they are restored on
    /// load by the rehydrator.
    #[serde(default = "default_true")]
    pub persist_search_results: bool,
    #[serde(default = "default_true")]
    pub persist_generated_images: bool,

    // Streaming behaviour
    #[serde(default = "default_ui_throttle_ms")]
    pub ui_throttle_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_visualization_keywords")]
    pub visualization_keywords: Vec<String>,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant inside a chat client that can act on your behalf. \
     When you need a side effect, emit exactly one of these tags inline:\n\
     <SEARCHREQUEST>web search query</SEARCHREQUEST> (repeat for multi-step research)\n\
     <IMG>image prompt</IMG>\n\
     <PAGE>markdown document</PAGE>\n\
     <TEXT_FILE name=\"file.txt\">file contents</TEXT_FILE>\n\
     <TASK_CREATE>type:query</TASK_CREATE>\n\
     <FUNCTION_CALL>name(arg=\"value\")</FUNCTION_CALL>\n\
     After a search tag, stop and wait: the results will be provided to you."
        .to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("parley"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_database_path() -> String {
    data_dir().join("parley.db").to_string_lossy().into_owned()
}

fn default_export_dir() -> String {
    dirs::download_dir()
        .unwrap_or_else(|| data_dir().join("exports"))
        .to_string_lossy()
        .into_owned()
}

fn default_true() -> bool {
    true
}

fn default_ui_throttle_ms() -> u64 {
    16
}

fn default_request_timeout_secs() -> Option<u64> {
    Some(120)
}

fn default_visualization_keywords() -> Vec<String> {
    [
        "plot",
        "chart",
        "graph",
        "visualize",
        "visualise",
        "visualization",
        "diagram",
        "histogram",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            system_prompt: default_system_prompt(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            search: SearchConfig::default(),
            image: ImageConfig::default(),
            database_path: default_database_path(),
            export_dir: default_export_dir(),
            persist_search_results: true,
            persist_generated_images: true,
            ui_throttle_ms: default_ui_throttle_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            visualization_keywords: default_visualization_keywords(),
        }
    }
}

impl ParleyConfig {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("parley"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley_config.toml")
    }

    /// Load config from parley_config.toml, falling back to defaults + env vars.
    /// Environment variables override file values.
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<ParleyConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        base.with_env_overrides()
    }

    /// Save config to the config file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir {:?}", parent))?;
        }

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("PARLEY_LLM_API_URL") {
            self.llm_api_url = url;
        }
        if let Ok(model) = env::var("PARLEY_LLM_MODEL") {
            self.llm_model = model;
        }
        if let Some(key) = non_empty_env("PARLEY_LLM_API_KEY") {
            self.llm_api_key = Some(key);
        }
        if let Ok(url) = env::var("PARLEY_SEARCH_API_URL") {
            self.search.api_url = url;
        }
        if let Some(key) = non_empty_env("PARLEY_SEARCH_API_KEY") {
            self.search.api_key = Some(key);
        }
        if let Ok(url) = env::var("PARLEY_IMAGE_API_URL") {
            self.image.api_url = url;
        }
        if let Some(key) = non_empty_env("PARLEY_IMAGE_API_KEY") {
            self.image.api_key = Some(key);
        }
        if let Some(path) = non_empty_env("PARLEY_DATABASE_PATH") {
            self.database_path = path;
        }
        if let Some(dir) = non_empty_env("PARLEY_EXPORT_DIR") {
            self.export_dir = dir;
        }
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn ui_throttle(&self) -> Duration {
        Duration::from_millis(self.ui_throttle_ms)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
