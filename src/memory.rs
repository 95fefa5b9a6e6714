use anyhow::Result;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::MemoryConfig;
use crate::mcp::PROTOCOL_VERSION;
use crate::progress;

macro_rules! debug_eprintln {
    ($($arg:tt)*) => {
        if std::env::var("DEEP_SCOUT_DEBUG").is_ok() {
            eprintln!($($arg)*);
        }
    };
}

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Fire-and-forget client for the episodic memory MCP server. Each call is a
/// one-shot exchange: spawn the server, write the initialize sequence plus
/// one tools/call, read the matching response, and let the process exit.
/// Memory failures must never fail a research session, so every public
/// method degrades to a no-op after logging.
pub struct MemoryClient {
    config: MemoryConfig,
}

impl MemoryClient {
    pub fn from_config(config: &MemoryConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(MemoryClient {
            config: config.clone(),
        })
    }

    /// Store a research artifact. Best-effort: errors are logged and dropped.
    pub async fn record_research(
        &self,
        topic: &str,
        content: &str,
        memory_type: &str,
        research_loop_count: usize,
    ) {
        let arguments = json!({
            "content": content,
            "researchTopic": topic,
            "memoryType": memory_type,
            "appName": "deep-scout",
            "researchLoopCount": research_loop_count,
        });

        match self.one_shot_call("createResearchMemory", arguments).await {
            Ok(_) => {
                progress::log(format!("memory: stored {} for '{}'", memory_type, topic));
            }
            Err(e) => {
                debug_eprintln!("[Memory] capture failed (ignored): {}", e);
            }
        }
    }

    /// Retrieve memories related to a topic. Best-effort: failures return an
    /// empty list.
    pub async fn recall(&self, topic: &str, limit: usize) -> Vec<Value> {
        let arguments = json!({
            "researchTopic": topic,
            "limit": limit,
        });

        match self.one_shot_call("getResearchMemories", arguments).await {
            Ok(result) => parse_memory_list(&result),
            Err(e) => {
                debug_eprintln!("[Memory] recall failed (ignored): {}", e);
                Vec::new()
            }
        }
    }

    async fn one_shot_call(&self, tool_name: &str, arguments: Value) -> Result<Value> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut process = cmd.spawn()?;
        let mut stdin = process
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to get memory server stdin"))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to get memory server stdout"))?;

        let requests = [
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "clientInfo": {"name": "deep-scout", "version": env!("CARGO_PKG_VERSION")},
                },
            }),
            json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized",
            }),
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": tool_name, "arguments": arguments},
            }),
        ];

        let exchange = async {
            for request in &requests {
                stdin.write_all(request.to_string().as_bytes()).await?;
                stdin.write_all(b"\n").await?;
            }
            stdin.flush().await?;
            drop(stdin);

            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                let bytes = reader.read_line(&mut line).await?;
                if bytes == 0 {
                    return Err(anyhow::anyhow!("memory server closed without responding"));
                }
                let trimmed = line.trim();
                if !trimmed.starts_with('{') {
                    continue;
                }
                let Ok(response) = serde_json::from_str::<Value>(trimmed) else {
                    continue;
                };
                if response.get("id").and_then(|v| v.as_u64()) != Some(3) {
                    continue;
                }
                if let Some(error) = response.get("error") {
                    return Err(anyhow::anyhow!("memory tool call failed: {}", error));
                }
                return Ok(response.get("result").cloned().unwrap_or(Value::Null));
            }
        };

        let result = tokio::time::timeout(CALL_TIMEOUT, exchange).await;
        match result {
            Ok(outcome) => {
                let _ = process.wait().await;
                outcome
            }
            Err(_) => {
                let _ = process.start_kill();
                Err(anyhow::anyhow!("memory server timed out"))
            }
        }
    }
}

/// Memory lists come back as an MCP content block whose text is a JSON array.
fn parse_memory_list(result: &Value) -> Vec<Value> {
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| blocks.first())
        .and_then(|block| block.get("text"))
        .and_then(|t| t.as_str());

    match text {
        Some(text) => serde_json::from_str::<Vec<Value>>(text).unwrap_or_default(),
        None => result
            .as_array()
            .cloned()
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_builds_no_client() {
        let config = MemoryConfig::default();
        assert!(MemoryClient::from_config(&config).is_none());
    }

    #[test]
    fn parses_content_block_memory_list() {
        let result = json!({
            "content": [{"type": "text", "text": "[{\"content\": \"prior finding\"}]"}]
        });
        let memories = parse_memory_list(&result);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0]["content"], "prior finding");
    }

    #[test]
    fn malformed_memory_payload_yields_empty() {
        assert!(parse_memory_list(&json!({"content": [{"text": "not json"}]})).is_empty());
        assert!(parse_memory_list(&json!({})).is_empty());
    }
}
