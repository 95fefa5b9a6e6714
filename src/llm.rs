use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::progress;

macro_rules! debug_println {
    ($($arg:tt)*) => {
        if std::env::var("DEEP_SCOUT_DEBUG").is_ok() {
            println!($($arg)*);
        }
    };
}

/// Per-call options for a chat completion.
#[derive(Debug, Clone, Copy)]
pub struct InvokeOptions {
    pub temperature: f32,
    pub json_mode: bool,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        InvokeOptions {
            temperature: 0.0,
            json_mode: false,
        }
    }
}

impl InvokeOptions {
    pub fn text(temperature: f32) -> Self {
        InvokeOptions {
            temperature,
            json_mode: false,
        }
    }

    pub fn json() -> Self {
        InvokeOptions {
            temperature: 0.0,
            json_mode: true,
        }
    }
}

/// One chat-completion backend. Implementations translate a
/// (system, user) pair into whatever wire format the server expects.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, system: &str, user: &str, options: InvokeOptions) -> Result<String>;
}

/// Native Ollama `/api/chat` backend.
pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaBackend {
    pub fn new(base_url: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(OllamaBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
        })
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    async fn chat(&self, system: &str, user: &str, options: InvokeOptions) -> Result<String> {
        let mut request = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "stream": false,
            "options": {"temperature": options.temperature},
        });
        if options.json_mode {
            request["format"] = json!("json");
        }

        debug_println!("[LLM] POST {}/api/chat (json_mode: {})", self.base_url, options.json_mode);

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Ollama API error: {}", response.status()));
        }

        let parsed: OllamaChatResponse = response.json().await?;
        Ok(parsed.message.content)
    }
}

/// OpenAI-compatible `/chat/completions` backend (vLLM, LM Studio, etc).
pub struct OpenAiCompatBackend {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: String,
}

impl OpenAiCompatBackend {
    pub fn new(base_url: String, model: String, api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(OpenAiCompatBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatBackend {
    async fn chat(&self, system: &str, user: &str, options: InvokeOptions) -> Result<String> {
        let mut request = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": options.temperature,
        });
        if options.json_mode {
            request["response_format"] = json!({"type": "json_object"});
        }

        debug_println!("[LLM] POST {}/chat/completions (json_mode: {})", self.base_url, options.json_mode);

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if !self.api_key.is_empty() && self.api_key != "EMPTY" {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Chat completion API error: {}",
                response.status()
            ));
        }

        let parsed: OpenAiChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("Chat completion response had no choices"))
    }
}

/// Thin gateway used by every LLM-consuming step. The backend is selected
/// once from configuration; callers only see `invoke`.
pub struct LlmClient {
    backend: Box<dyn ChatBackend>,
    strip_thinking: bool,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig, strip_thinking: bool) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let backend: Box<dyn ChatBackend> = match config.provider.as_str() {
            "openai_compatible" => Box::new(OpenAiCompatBackend::new(
                config.base_url.clone(),
                config.model.clone(),
                config.api_key.clone(),
                timeout,
            )?),
            _ => Box::new(OllamaBackend::new(
                config.base_url.clone(),
                config.model.clone(),
                timeout,
            )?),
        };
        Ok(LlmClient {
            backend,
            strip_thinking,
        })
    }

    pub async fn invoke(&self, system: &str, user: &str, options: InvokeOptions) -> Result<String> {
        progress::log_with(progress::Kind::Llm, "LLM chat completion");
        let raw = self.backend.chat(system, user, options).await?;
        let text = if self.strip_thinking {
            strip_thinking_tokens(&raw)
        } else {
            raw
        };
        Ok(text.trim().to_string())
    }
}

/// Remove `<think>..</think>` spans emitted by reasoning models.
pub fn strip_thinking_tokens(text: &str) -> String {
    let mut out = text.to_string();
    while let (Some(start), Some(end_tag)) = (out.find("<think>"), out.find("</think>")) {
        if end_tag < start {
            break;
        }
        let end = end_tag + "</think>".len();
        out.replace_range(start..end, "");
    }
    out
}

/// Strip a surrounding markdown code fence (```json .. ``` or ``` .. ```).
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.contains("```") {
        return trimmed.to_string();
    }

    let mut content = trimmed;
    if let Some(pos) = content.find("```json") {
        content = &content[pos + "```json".len()..];
    } else if let Some(pos) = content.find("```") {
        content = &content[pos + "```".len()..];
    }
    if let Some(pos) = content.rfind("```") {
        content = &content[..pos];
    }
    content.trim().to_string()
}

/// Extract the first balanced JSON object from free-form text. Tracks string
/// and escape state so braces inside string literals don't confuse the scan.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut brace_count = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (offset, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if ch == '\\' {
            escape = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
        }
        if !in_string {
            match ch {
                '{' => brace_count += 1,
                '}' => {
                    brace_count -= 1;
                    if brace_count == 0 {
                        return Some(text[start..start + offset + ch.len_utf8()].to_string());
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Defensive parse of a JSON-bearing model response: strip fences and
/// whitespace, then try the whole text, then the first balanced object.
/// Returns `None` instead of erroring on garbage; callers supply their own
/// deterministic fallback.
pub fn parse_json_response(text: &str) -> Option<Value> {
    let cleaned = strip_code_fences(text);
    if cleaned.starts_with('{') || cleaned.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
            return Some(value);
        }
    }
    let candidate = extract_json_object(&cleaned)?;
    serde_json::from_str(&candidate).ok()
}
