use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::McpConfig;
use crate::progress;

macro_rules! debug_println {
    ($($arg:tt)*) => {
        if std::env::var("DEEP_SCOUT_DEBUG").is_ok() {
            println!($($arg)*);
        }
    };
}

macro_rules! debug_eprintln {
    ($($arg:tt)*) => {
        if std::env::var("DEEP_SCOUT_DEBUG").is_ok() {
            eprintln!($($arg)*);
        }
    };
}

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Deserialize)]
pub struct McpTool {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Paper {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub published: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub authors: Vec<String>,
}

/// JSON-RPC client for an MCP tool server over line-delimited stdio.
/// Handshake: `initialize` request, `notifications/initialized`, then
/// `tools/list` discovery with a hardcoded fallback tool set.
pub struct McpClient {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    tools: Vec<McpTool>,
    next_id: u64,
    timeout: Duration,
}

impl McpClient {
    pub async fn connect(config: &McpConfig) -> Result<Self> {
        debug_println!("[MCP] Starting process: {} {:?}", config.command, config.args);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut process = cmd.spawn()?;
        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to get MCP server stdin"))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to get MCP server stdout"))?;
        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to get MCP server stderr"))?;

        // Drain stderr so the child never blocks on a full pipe
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            while let Ok(bytes) = reader.read_line(&mut line).await {
                if bytes == 0 {
                    break;
                }
                if !line.trim().is_empty() {
                    debug_eprintln!("[MCP] stderr: {}", line.trim());
                }
                line.clear();
            }
        });

        let mut client = McpClient {
            process,
            stdin,
            stdout: BufReader::new(stdout),
            tools: Vec::new(),
            next_id: 0,
            timeout: Duration::from_secs(config.timeout_secs),
        };

        client.initialize().await?;
        client.discover_tools().await;

        progress::log_with(
            progress::Kind::Mcp,
            format!("MCP server connected, {} tools", client.tools.len()),
        );
        Ok(client)
    }

    async fn initialize(&mut self) -> Result<()> {
        let id = self.next_request_id();
        let init = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "clientInfo": {"name": "deep-scout", "version": env!("CARGO_PKG_VERSION")},
            },
        });
        self.send_message(&init).await?;
        let response = self.read_response(id).await?;
        debug_println!("[MCP] Initialize response: {:?}", response);

        // Notification: no id, no response expected
        let initialized = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        self.send_message(&initialized).await?;
        Ok(())
    }

    async fn discover_tools(&mut self) {
        let id = self.next_request_id();
        let list = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/list",
            "params": {},
        });

        let discovered = async {
            self.send_message(&list).await?;
            let response = self.read_response(id).await?;
            let tools_value = response
                .get("result")
                .and_then(|r| r.get("tools"))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("tools/list response missing result.tools"))?;
            let tools: Vec<McpTool> = serde_json::from_value(tools_value)?;
            Ok::<_, anyhow::Error>(tools)
        }
        .await;

        match discovered {
            Ok(tools) if !tools.is_empty() => {
                debug_println!("[MCP] {} tools discovered", tools.len());
                self.tools = tools;
            }
            Ok(_) | Err(_) => {
                debug_println!("[MCP] Tool discovery failed, using default tool set");
                self.tools = default_tool_set();
            }
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
        progress::log_with(progress::Kind::Mcp, format!("tools/call {}", name));

        let id = self.next_request_id();
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {
                "name": name,
                "arguments": arguments,
            },
        });
        self.send_message(&message).await?;
        let response = self.read_response(id).await?;

        if let Some(result) = response.get("result") {
            Ok(result.clone())
        } else if let Some(error) = response.get("error") {
            Err(anyhow::anyhow!("MCP error: {}", error))
        } else {
            Ok(response)
        }
    }

    pub async fn search_papers(&mut self, query: &str, max_results: usize) -> Result<Vec<Paper>> {
        let result = self
            .call_tool(
                "search_papers",
                json!({"query": query, "max_results": max_results}),
            )
            .await?;
        Ok(parse_papers(&result))
    }

    async fn send_message(&mut self, message: &Value) -> Result<()> {
        let msg_str = message.to_string();
        debug_println!("[MCP] -> {}", msg_str);
        self.stdin.write_all(msg_str.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read lines until a JSON-RPC response with the given id arrives.
    /// Non-JSON lines (server debug output) and unrelated notifications are
    /// skipped. On timeout the server process is killed and the call fails.
    async fn read_response(&mut self, id: u64) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut attempts = 0;

        loop {
            let mut line = String::new();
            let read = tokio::time::timeout_at(deadline, self.stdout.read_line(&mut line)).await;

            let bytes_read = match read {
                Err(_) => {
                    let _ = self.process.start_kill();
                    return Err(anyhow::anyhow!(
                        "MCP server timed out after {:?}",
                        self.timeout
                    ));
                }
                Ok(result) => result?,
            };

            if bytes_read == 0 {
                return Err(anyhow::anyhow!("MCP server disconnected unexpectedly"));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(trimmed) {
                Ok(response) => {
                    if response.get("id").and_then(|v| v.as_u64()) == Some(id) {
                        return Ok(response);
                    }
                    debug_println!("[MCP] skipping message with other id");
                }
                Err(_) => {
                    debug_println!("[MCP] skipping non-JSON output: {}", trimmed);
                }
            }

            attempts += 1;
            if attempts > 50 {
                return Err(anyhow::anyhow!("Too many attempts reading MCP response"));
            }
        }
    }
}

/// Known tool set of the academic paper server, used when `tools/list`
/// discovery fails.
pub fn default_tool_set() -> Vec<McpTool> {
    vec![
        McpTool {
            name: "search_papers".to_string(),
            description: Some("Search for academic papers on arXiv".to_string()),
            input_schema: Some(json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query for papers"},
                    "max_results": {"type": "integer", "description": "Maximum number of results", "default": 10},
                    "sort_by": {"type": "string", "enum": ["relevance", "lastUpdatedDate", "submittedDate"]},
                    "categories": {"type": "array", "items": {"type": "string"}},
                },
                "required": ["query"],
            })),
        },
        McpTool {
            name: "download_paper".to_string(),
            description: Some("Download a paper by arXiv id".to_string()),
            input_schema: Some(json!({
                "type": "object",
                "properties": {
                    "paper_id": {"type": "string", "description": "arXiv paper id"},
                },
                "required": ["paper_id"],
            })),
        },
        McpTool {
            name: "list_papers".to_string(),
            description: Some("List locally downloaded papers".to_string()),
            input_schema: Some(json!({"type": "object", "properties": {}})),
        },
        McpTool {
            name: "read_paper".to_string(),
            description: Some("Read the content of a downloaded paper".to_string()),
            input_schema: Some(json!({
                "type": "object",
                "properties": {
                    "paper_id": {"type": "string", "description": "arXiv paper id"},
                },
                "required": ["paper_id"],
            })),
        },
    ]
}

/// Paper lists arrive either directly as `{"papers": [...]}` or wrapped in
/// MCP content blocks (`result.content[0].text` holding JSON). Handle both.
pub fn parse_papers(result: &Value) -> Vec<Paper> {
    if let Some(papers) = result.get("papers").and_then(|p| p.as_array()) {
        return papers
            .iter()
            .filter_map(|p| serde_json::from_value(p.clone()).ok())
            .collect();
    }

    if let Some(text) = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| blocks.first())
        .and_then(|block| block.get("text"))
        .and_then(|t| t.as_str())
    {
        if let Ok(inner) = serde_json::from_str::<Value>(text) {
            if inner.get("papers").is_some() {
                return parse_papers(&inner);
            }
            if let Some(list) = inner.as_array() {
                return list
                    .iter()
                    .filter_map(|p| serde_json::from_value(p.clone()).ok())
                    .collect();
            }
        }
    }

    if let Some(list) = result.as_array() {
        return list
            .iter()
            .filter_map(|p| serde_json::from_value(p.clone()).ok())
            .collect();
    }

    Vec::new()
}
