use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

fn default_llm_provider() -> String {
    "ollama".to_string()
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_api_key() -> String {
    "EMPTY".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_searxng_host() -> String {
    "http://localhost:8001".to_string()
}

fn default_search_provider() -> String {
    "web".to_string()
}

fn default_max_results() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_search_timeout() -> u64 {
    30
}

fn default_max_loops() -> usize {
    3
}

fn default_mcp_command() -> String {
    "uv".to_string()
}

fn default_mcp_args() -> Vec<String> {
    vec!["run".to_string(), "arxiv-mcp-server".to_string()]
}

fn default_mcp_timeout() -> u64 {
    10
}

fn default_classifier_endpoint() -> String {
    "http://localhost:8762".to_string()
}

fn default_memory_command() -> String {
    "node".to_string()
}

fn default_memory_args() -> Vec<String> {
    vec!["dist/index.js".to_string()]
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// "ollama" or "openai_compatible"
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: default_api_key(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    #[serde(default = "default_searxng_host")]
    pub searxng_host: String,
    /// "web" routes everything to SearXNG, "mcp" prefers the academic MCP server
    #[serde(default = "default_search_provider")]
    pub provider: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_true")]
    pub fetch_full_page: bool,
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            searxng_host: default_searxng_host(),
            provider: default_search_provider(),
            max_results: default_max_results(),
            fetch_full_page: true,
            timeout_secs: default_search_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResearchConfig {
    #[serde(default = "default_max_loops")]
    pub max_web_research_loops: usize,
    #[serde(default = "default_true")]
    pub verification_enabled: bool,
    #[serde(default = "default_true")]
    pub strip_thinking_tokens: bool,
    /// When true, a fruitless URL-fetch round may downgrade the session to
    /// plain web search for subsequent rounds.
    #[serde(default)]
    pub allow_strategy_revision: bool,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        ResearchConfig {
            max_web_research_loops: default_max_loops(),
            verification_enabled: true,
            strip_thinking_tokens: true,
            allow_strategy_revision: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mcp_command")]
    pub command: String,
    #[serde(default = "default_mcp_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default = "default_mcp_timeout")]
    pub timeout_secs: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        McpConfig {
            enabled: false,
            command: default_mcp_command(),
            args: default_mcp_args(),
            env: Default::default(),
            timeout_secs: default_mcp_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    /// Optional OpenAPI-described tool server; its operations are registered
    /// as callable tools at startup.
    #[serde(default)]
    pub openapi_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            enabled: false,
            endpoint: default_classifier_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_memory_command")]
    pub command: String,
    #[serde(default = "default_memory_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            enabled: false,
            command: default_memory_command(),
            args: default_memory_args(),
            working_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        let mut config = if config_path.exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("Error parsing config.toml: {}. Using defaults.", e);
                        Config::default()
                    }
                },
                Err(e) => {
                    eprintln!("Error reading config.toml: {}. Using defaults.", e);
                    Config::default()
                }
            }
        } else {
            if let Some(parent) = config_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            Config::default()
        };

        // Environment overrides win over the file
        if let Ok(host) = std::env::var("DEEP_SCOUT_LLM_HOST") {
            config.llm.base_url = host;
        }
        if let Ok(model) = std::env::var("DEEP_SCOUT_LLM_MODEL") {
            config.llm.model = model;
        }
        if let Ok(host) = std::env::var("DEEP_SCOUT_SEARXNG_HOST") {
            config.search.searxng_host = host;
        }

        config
    }

    pub fn get_config_path() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/deep-scout/config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }

    #[allow(dead_code)]
    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/deep-scout")
        } else {
            PathBuf::from(".")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.llm.provider, "ollama");
        assert_eq!(config.research.max_web_research_loops, 3);
        assert!(config.research.verification_enabled);
        assert!(!config.research.allow_strategy_revision);
        assert_eq!(config.search.max_results, 8);
        assert!(!config.mcp.enabled);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r#"
[llm]
provider = "openai_compatible"
base_url = "http://localhost:8000/v1"

[research]
max_web_research_loops = 1
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.llm.provider, "openai_compatible");
        assert_eq!(config.llm.model, "llama3.2");
        assert_eq!(config.research.max_web_research_loops, 1);
        assert!(config.research.verification_enabled);
        assert_eq!(config.search.searxng_host, "http://localhost:8001");
    }
}
