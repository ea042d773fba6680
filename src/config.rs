use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Re-ranking weights for the retrieval engine. Kept in config rather than
/// embedded literals so they can be tuned without code changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalWeights {
    #[serde(default = "default_boost_thread")]
    pub boost_thread: f64,
    #[serde(default = "default_boost_stage")]
    pub boost_stage: f64,
    #[serde(default = "default_boost_agent_role")]
    pub boost_agent_role: f64,
    #[serde(default = "default_boost_recency")]
    pub boost_recency: f64,
    /// Candidates requested from each of the two vector searches before
    /// re-ranking.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
}

fn default_boost_thread() -> f64 {
    0.20
}

fn default_boost_stage() -> f64 {
    0.08
}

fn default_boost_agent_role() -> f64 {
    0.05
}

fn default_boost_recency() -> f64 {
    0.01
}

fn default_candidate_k() -> usize {
    60
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            boost_thread: default_boost_thread(),
            boost_stage: default_boost_stage(),
            boost_agent_role: default_boost_agent_role(),
            boost_recency: default_boost_recency(),
            candidate_k: default_candidate_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // LLM configuration (OpenAI-compatible chat completions endpoint)
    #[serde(default = "default_llm_api_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    // Embedding provider (OpenAI-compatible embeddings endpoint)
    #[serde(default = "default_embedding_api_url")]
    pub embedding_api_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_version")]
    pub embedding_version: String,
    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,

    // Conversation store
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Retrieval engine
    #[serde(default)]
    pub retrieval: RetrievalWeights,
    /// Cap applied to the retrieved context injected into generation.
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
}

fn default_llm_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4.1".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    50
}

fn default_embedding_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_embedding_version() -> String {
    "v1".to_string()
}

fn default_embedding_timeout_secs() -> u64 {
    20
}

fn default_database_path() -> String {
    "leadline.db".to_string()
}

fn default_context_max_chars() -> usize {
    1600
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_api_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_timeout_secs: default_llm_timeout_secs(),
            embedding_api_url: default_embedding_api_url(),
            embedding_model: default_embedding_model(),
            embedding_version: default_embedding_version(),
            embedding_timeout_secs: default_embedding_timeout_secs(),
            database_path: default_database_path(),
            retrieval: RetrievalWeights::default(),
            context_max_chars: default_context_max_chars(),
        }
    }
}

impl AgentConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("leadline_config.toml")
    }

    /// Load config from leadline_config.toml next to the executable, falling
    /// back to defaults. The provider key may also come from the environment.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<AgentConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    AgentConfig::default()
                }
            },
            Err(_) => AgentConfig::default(),
        };

        if config.llm_api_key.is_none() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                if !key.trim().is_empty() {
                    config.llm_api_key = Some(key);
                }
            }
        }

        config
    }
}
