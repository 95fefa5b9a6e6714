mod config;
mod intent;
mod llm;
mod mcp;
mod memory;
mod progress;
mod prompts;
mod research;
mod search;
mod sources;
mod tools;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::research::{ResearchOrchestrator, ResearchProgress};

fn progress_line(update: &ResearchProgress) -> String {
    match update {
        ResearchProgress::Started => "research started".to_string(),
        ResearchProgress::IntentClassified { strategy, confidence } => {
            format!("intent classified: {} ({:.2})", strategy, confidence)
        }
        ResearchProgress::FetchingUrl(url) => format!("fetching {}", url),
        ResearchProgress::ToolResearch => "tool-enhanced research".to_string(),
        ResearchProgress::GeneratingQuery => "generating search query".to_string(),
        ResearchProgress::Searching { loop_count, max_loops } => {
            format!("research loop {}/{}", loop_count, max_loops)
        }
        ResearchProgress::Summarizing => "summarizing findings".to_string(),
        ResearchProgress::Verifying(count) => format!("verifying {} claims", count),
        ResearchProgress::Reflecting => "reflecting on summary".to_string(),
        ResearchProgress::Finalizing => "writing final report".to_string(),
        ResearchProgress::Completed => "research completed".to_string(),
        ResearchProgress::Cancelled => "research cancelled".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let topic: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if topic.trim().is_empty() {
        eprintln!("usage: deep-scout <research topic>");
        std::process::exit(2);
    }

    let config = config::Config::load();

    // Connect the academic MCP server up front; a failed connection only
    // disables the academic path, never the session.
    let mcp_client = if config.mcp.enabled {
        match mcp::McpClient::connect(&config.mcp).await {
            Ok(client) => Some(Arc::new(Mutex::new(client))),
            Err(e) => {
                eprintln!("Warning: failed to connect MCP server: {}", e);
                None
            }
        }
    } else {
        None
    };

    let search = Arc::new(search::SearchCoordinator::new(
        config.search.searxng_host.clone(),
        Duration::from_secs(config.search.timeout_secs),
        mcp_client.clone(),
    )?);

    let mut registry = tools::ToolRegistry::new(search.clone(), mcp_client.clone());
    if let Some(openapi_url) = &config.tools.openapi_url {
        match registry.register_openapi_tools(openapi_url).await {
            Ok(count) => eprintln!("Registered {} tools from {}", count, openapi_url),
            Err(e) => eprintln!("Warning: tool discovery failed: {}", e),
        }
    }

    // Expose the MCP server's discovered tools to the LLM as well. Paper
    // search already has a builtin wrapper, so only the rest are added.
    if let Some(mcp) = &mcp_client {
        let client = mcp.lock().await;
        for tool in client.tools() {
            if tool.name == "search_papers" {
                continue;
            }
            registry.register(tools::ToolSpec {
                name: tool.name.clone(),
                description: tool.description.clone().unwrap_or_default(),
                parameters: tool
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
                kind: tools::ToolKind::McpTool,
                endpoint: None,
                method: None,
            });
        }
    }
    if std::env::var("DEEP_SCOUT_DEBUG").is_ok() {
        eprintln!("{} tools registered", registry.specs().len());
    }
    let registry = Arc::new(registry);

    let llm_client =
        llm::LlmClient::from_config(&config.llm, config.research.strip_thinking_tokens)?;

    let mut orchestrator =
        ResearchOrchestrator::new(config.clone(), llm_client, search, registry);

    let (tx, mut rx) = mpsc::unbounded_channel();
    orchestrator.set_progress_channel(tx);
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            eprintln!("[deep-scout] {}", progress_line(&update));
        }
    });

    // Ctrl-C aborts the session at the next phase boundary; the partial
    // report is still printed.
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let report = orchestrator.research(&topic).await?;
    println!("{}", report);

    if std::env::var("DEEP_SCOUT_DEBUG").is_ok() {
        for entry in progress::recent(30) {
            eprintln!("[activity] {:?}: {}", entry.kind, entry.text);
        }
    }

    Ok(())
}
