/// Configuration management using figment
///
/// Loads configuration with this precedence (highest wins):
/// 1. Defaults (hardcoded)
/// 2. TOML file: beansack.toml (in working directory, or --config)
/// 3. Environment variables, unprefixed (e.g., DB_CONNECTION_STRING, EMBEDDER_CTX=4096)

use figment::{
    Figment,
    providers::{Env, Format, Toml, Serialized},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::errors::SackError;

/// Environment keys read by `Config::load`. Anything else in the environment is ignored.
const ENV_KEYS: &[&str] = &[
    "LOG_LEVEL",
    "DB_CONNECTION_STRING",
    "EMBEDDER_URL",
    "EMBEDDER_CTX",
    "EMBEDDER_API",
    "LLMSERVICE_API_KEY",
    "LLMSERVICE_BASE_URL",
    "LLMSERVICE_MODEL",
    "TOKENIZER",
    "INSTANCE_MODE",
    "PORT",
    "COLLECTION_SCHEDULE",
    "CLEANUP_SCHEDULE",
    "CLEANUP_WINDOW",
    "INTERNAL_AUTH_TOKEN",
    "BACKGROUND_TASKS",
];

/// Which surfaces the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceMode {
    /// Query API only
    Cdn,
    /// Ingest API and scheduled collection/cleanup jobs
    Indexer,
    /// Both on one listener
    Dual,
    /// Dual, plus one rectification pass at startup
    Debug,
}

impl InstanceMode {
    pub fn serves_queries(&self) -> bool {
        !matches!(self, InstanceMode::Indexer)
    }

    pub fn runs_indexer(&self) -> bool {
        !matches!(self, InstanceMode::Cdn)
    }
}

impl fmt::Display for InstanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceMode::Cdn => write!(f, "CDN"),
            InstanceMode::Indexer => write!(f, "INDEXER"),
            InstanceMode::Dual => write!(f, "DUAL"),
            InstanceMode::Debug => write!(f, "DEBUG"),
        }
    }
}

impl FromStr for InstanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CDN" => Ok(InstanceMode::Cdn),
            "INDEXER" => Ok(InstanceMode::Indexer),
            "DUAL" => Ok(InstanceMode::Dual),
            "DEBUG" => Ok(InstanceMode::Debug),
            other => Err(format!("Unknown instance mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Store DSN: postgres://... or memory://
    #[serde(default)]
    pub db_connection_string: String,

    /// Embedding service endpoint (full URL of the embedding route)
    #[serde(default)]
    pub embedder_url: String,

    /// Embedder context window in tokens; bean text is truncated to this
    #[serde(default = "default_embedder_ctx")]
    pub embedder_ctx: usize,

    /// Embedding wire format: "llamafile" or "inference"
    #[serde(default = "default_embedder_api")]
    pub embedder_api: String,

    /// API key for the OpenAI-compatible chat completion service
    #[serde(default)]
    pub llmservice_api_key: Option<String>,

    #[serde(default = "default_llmservice_base_url")]
    pub llmservice_base_url: String,

    #[serde(default = "default_llmservice_model")]
    pub llmservice_model: String,

    /// Tokenizer: HF hub repo id, path to a tokenizer.json, or "whitespace"
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,

    #[serde(default = "default_instance_mode")]
    pub instance_mode: InstanceMode,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 6-field cron expression (with seconds) for collect and rectify
    #[serde(default = "default_schedule")]
    pub collection_schedule: String,

    /// 6-field cron expression (with seconds) for cleanup
    #[serde(default = "default_schedule")]
    pub cleanup_schedule: String,

    /// Age in days after which beans, noise and nuggets are deleted
    #[serde(default = "default_cleanup_window")]
    pub cleanup_window: i64,

    /// Shared secret for the ingest API (X-API-Key). Ingest routes are off when unset.
    #[serde(default)]
    pub internal_auth_token: Option<String>,

    /// Upper bound on concurrently running background enrichment tasks
    #[serde(default = "default_background_tasks")]
    pub background_tasks: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_embedder_ctx() -> usize {
    2048
}

fn default_embedder_api() -> String {
    "llamafile".to_string()
}

fn default_llmservice_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_llmservice_model() -> String {
    "llama3-8b-8192".to_string()
}

fn default_tokenizer() -> String {
    "Xenova/gpt-4".to_string()
}

fn default_instance_mode() -> InstanceMode {
    InstanceMode::Cdn
}

fn default_port() -> u16 {
    8080
}

fn default_schedule() -> String {
    "0 0 0 * * *".to_string()
}

fn default_cleanup_window() -> i64 {
    30
}

fn default_background_tasks() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            db_connection_string: String::new(),
            embedder_url: String::new(),
            embedder_ctx: default_embedder_ctx(),
            embedder_api: default_embedder_api(),
            llmservice_api_key: None,
            llmservice_base_url: default_llmservice_base_url(),
            llmservice_model: default_llmservice_model(),
            tokenizer: default_tokenizer(),
            instance_mode: default_instance_mode(),
            port: default_port(),
            collection_schedule: default_schedule(),
            cleanup_schedule: default_schedule(),
            cleanup_window: default_cleanup_window(),
            internal_auth_token: None,
            background_tasks: default_background_tasks(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, `beansack.toml`, and environment variables
    pub fn load() -> Result<Config, SackError> {
        Self::load_from("beansack.toml")
    }

    /// Load configuration using an explicit TOML path. A missing file is not an error.
    pub fn load_from(path: &str) -> Result<Config, SackError> {
        Self::figment(path)
            .extract::<Config>()
            .map_err(|e| SackError::Config(format!("Failed to load config: {}", e)))
            .and_then(Config::validate)
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::raw().only(ENV_KEYS))
    }

    /// Reject values the rest of the system cannot run with.
    pub fn validate(self) -> Result<Config, SackError> {
        if self.db_connection_string.trim().is_empty() {
            return Err(SackError::Config(
                "DB_CONNECTION_STRING is required (postgres://... or memory://)".to_string(),
            ));
        }
        if self.embedder_url.trim().is_empty() {
            return Err(SackError::Config("EMBEDDER_URL is required".to_string()));
        }
        if self.embedder_ctx == 0 {
            return Err(SackError::Config("EMBEDDER_CTX must be positive".to_string()));
        }
        if self.background_tasks == 0 {
            return Err(SackError::Config("BACKGROUND_TASKS must be positive".to_string()));
        }
        if self.cleanup_window <= 0 {
            return Err(SackError::Config("CLEANUP_WINDOW must be a positive number of days".to_string()));
        }
        Ok(self)
    }
}
