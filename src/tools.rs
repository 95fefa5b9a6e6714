use anyhow::Result;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::mcp::McpClient;
use crate::progress;
use crate::search::{SearchCoordinator, SearchProvider};

macro_rules! debug_println {
    ($($arg:tt)*) => {
        if std::env::var("DEEP_SCOUT_DEBUG").is_ok() {
            println!($($arg)*);
        }
    };
}

/// Characters of fetched page content returned through the tool interface.
const TOOL_FETCH_CONTENT_CAP: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Function,
    ExternalApi,
    McpTool,
}

/// Static registry entry; never mutated after registration.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub kind: ToolKind,
    pub endpoint: Option<String>,
    pub method: Option<String>,
}

/// Uniform result of every tool invocation. This type crosses the dispatch
/// boundary instead of errors: a failed tool is data, not an exception.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolExecution {
    fn ok(result: Value, started: Instant) -> Self {
        ToolExecution {
            success: true,
            result,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failed(error: String, started: Instant) -> Self {
        ToolExecution {
            success: false,
            result: Value::Null,
            error: Some(error),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Replace `{name}` templates in an endpoint with parameter values; returns
/// the resolved URL and the parameters that were not consumed by the path.
pub fn substitute_path_params(endpoint: &str, params: &Map<String, Value>) -> (String, Map<String, Value>) {
    let mut url = endpoint.to_string();
    let mut remaining = Map::new();
    for (key, value) in params {
        let placeholder = format!("{{{}}}", key);
        if url.contains(&placeholder) {
            url = url.replace(&placeholder, &value_to_plain_string(value));
        } else {
            remaining.insert(key.clone(), value.clone());
        }
    }
    (url, remaining)
}

fn resolve_schema_ref<'a>(spec: &'a Value, ref_path: &str) -> Option<&'a Value> {
    let name = ref_path.strip_prefix("#/components/schemas/")?;
    spec.get("components")?.get("schemas")?.get(name)
}

/// Walk an OpenAPI document and convert each operation into a tool spec.
/// `$ref` request-body schemas are resolved through the shared schema table
/// before parameter extraction.
pub fn convert_openapi_to_specs(spec: &Value, base_url: &str) -> Vec<ToolSpec> {
    let mut specs = Vec::new();
    let base = base_url.trim_end_matches('/');

    let Some(paths) = spec.get("paths").and_then(|p| p.as_object()) else {
        return specs;
    };

    for (path, path_spec) in paths {
        let Some(operations) = path_spec.as_object() else {
            continue;
        };
        for (method, operation) in operations {
            if !matches!(method.as_str(), "get" | "post" | "put" | "delete" | "patch") {
                continue;
            }

            let operation_id = operation
                .get("operationId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("{}_{}", method, path.replace('/', "_")));

            let description = operation
                .get("description")
                .or_else(|| operation.get("summary"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();

            let mut properties = Map::new();
            let mut required: Vec<Value> = Vec::new();

            if let Some(params) = operation.get("parameters").and_then(|p| p.as_array()) {
                for param in params {
                    let Some(name) = param.get("name").and_then(|n| n.as_str()) else {
                        continue;
                    };
                    let schema = param.get("schema").cloned().unwrap_or_else(|| json!({}));
                    properties.insert(
                        name.to_string(),
                        json!({
                            "type": schema.get("type").and_then(|t| t.as_str()).unwrap_or("string"),
                            "description": param.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                        }),
                    );
                    if param.get("required").and_then(|r| r.as_bool()).unwrap_or(false) {
                        required.push(json!(name));
                    }
                }
            }

            if matches!(method.as_str(), "post" | "put" | "patch") {
                let body_schema = operation
                    .get("requestBody")
                    .and_then(|b| b.get("content"))
                    .and_then(|c| c.get("application/json"))
                    .and_then(|j| j.get("schema"));

                let resolved = body_schema.and_then(|schema| {
                    if schema.get("properties").is_some() {
                        Some(schema)
                    } else {
                        schema
                            .get("$ref")
                            .and_then(|r| r.as_str())
                            .and_then(|r| resolve_schema_ref(spec, r))
                    }
                });

                if let Some(schema) = resolved {
                    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
                        for (k, v) in props {
                            properties.insert(k.clone(), v.clone());
                        }
                    }
                    if let Some(reqs) = schema.get("required").and_then(|r| r.as_array()) {
                        required.extend(reqs.iter().cloned());
                    }
                }
            }

            specs.push(ToolSpec {
                name: operation_id,
                description,
                parameters: json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }),
                kind: ToolKind::ExternalApi,
                endpoint: Some(format!("{}{}", base, path)),
                method: Some(method.to_uppercase()),
            });
        }
    }

    specs
}

/// Maps tool names to executable capabilities. Constructed once per process
/// and handed to the orchestrator by reference; there is no global registry.
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    search: Arc<SearchCoordinator>,
    mcp: Option<Arc<Mutex<McpClient>>>,
    external_client: Mutex<reqwest::Client>,
    external_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(search: Arc<SearchCoordinator>, mcp: Option<Arc<Mutex<McpClient>>>) -> Self {
        let external_timeout = Duration::from_secs(30);
        let mut registry = ToolRegistry {
            specs: Vec::new(),
            search,
            mcp,
            external_client: Mutex::new(
                reqwest::Client::builder()
                    .timeout(external_timeout)
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
            external_timeout,
        };
        registry.register_builtin_tools();
        registry
    }

    fn register_builtin_tools(&mut self) {
        self.register(ToolSpec {
            name: "web_search".to_string(),
            description: "Search the web for current information, news, and general resources"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query"},
                    "max_results": {"type": "integer", "description": "Maximum number of results", "default": 5},
                },
                "required": ["query"],
            }),
            kind: ToolKind::Function,
            endpoint: None,
            method: None,
        });

        self.register(ToolSpec {
            name: "fetch_url_content".to_string(),
            description: "Fetch and extract the text content of a web page".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "URL to fetch content from"},
                },
                "required": ["url"],
            }),
            kind: ToolKind::Function,
            endpoint: None,
            method: None,
        });

        self.register(ToolSpec {
            name: "arxiv_search".to_string(),
            description: "Search for academic papers and research publications on arXiv"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query for papers"},
                    "max_results": {"type": "integer", "description": "Maximum number of results", "default": 10},
                },
                "required": ["query"],
            }),
            kind: ToolKind::Function,
            endpoint: None,
            method: None,
        });
    }

    pub fn register(&mut self, spec: ToolSpec) {
        debug_println!("[Tools] Registered tool: {} ({:?})", spec.name, spec.kind);
        self.specs.push(spec);
    }

    /// Discover tools from an OpenAPI-described server and register each
    /// operation. Returns how many were added.
    pub async fn register_openapi_tools(&mut self, base_url: &str) -> Result<usize> {
        let url = format!("{}/openapi.json", base_url.trim_end_matches('/'));
        progress::log_with(progress::Kind::Tool, format!("discovering tools at {}", url));

        let client = self.external_client.lock().await.clone();
        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "OpenAPI document fetch failed: HTTP {}",
                response.status()
            ));
        }
        let spec: Value = response.json().await?;
        let specs = convert_openapi_to_specs(&spec, base_url);
        let count = specs.len();
        for spec in specs {
            self.register(spec);
        }
        Ok(count)
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// Catalog entries for the tool-selection prompt.
    pub fn specs_for_llm(&self) -> Vec<Value> {
        self.specs
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.parameters,
                })
            })
            .collect()
    }

    /// Execute a tool by name. Never returns an error: unknown tools,
    /// transport failures, and bad parameters all come back as a failed
    /// `ToolExecution` and the session continues.
    pub async fn execute(&self, tool_name: &str, params: &Value) -> ToolExecution {
        let started = Instant::now();
        progress::log_with(progress::Kind::Tool, format!("executing {}", tool_name));

        let outcome = self.run(tool_name, params).await;
        match outcome {
            Ok(result) => ToolExecution::ok(result, started),
            Err(e) => {
                debug_println!("[Tools] {} failed: {}", tool_name, e);
                ToolExecution::failed(e.to_string(), started)
            }
        }
    }

    async fn run(&self, tool_name: &str, params: &Value) -> Result<Value> {
        match tool_name {
            "web_search" => return self.run_web_search(params).await,
            "fetch_url_content" => return self.run_fetch_url(params).await,
            "arxiv_search" => return self.run_arxiv_search(params).await,
            _ => {}
        }

        let spec = self
            .specs
            .iter()
            .find(|s| s.name == tool_name)
            .ok_or_else(|| anyhow::anyhow!("Tool '{}' not found", tool_name))?;

        match spec.kind {
            ToolKind::ExternalApi => self.run_external(spec, params).await,
            ToolKind::McpTool => {
                let mcp = self
                    .mcp
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("No MCP server connected"))?;
                let mut client = mcp.lock().await;
                client.call_tool(&spec.name, params.clone()).await
            }
            ToolKind::Function => Err(anyhow::anyhow!(
                "Function tool '{}' has no executor",
                tool_name
            )),
        }
    }

    async fn run_web_search(&self, params: &Value) -> Result<Value> {
        let query = params
            .get("query")
            .and_then(|q| q.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing 'query' parameter"))?;
        let max_results = params
            .get("max_results")
            .and_then(|m| m.as_u64())
            .unwrap_or(5) as usize;

        let response = self
            .search
            .search(query, SearchProvider::Web, max_results, false)
            .await;

        Ok(json!({
            "query": query,
            "results_count": response.results.len(),
            "results": response.results,
        }))
    }

    async fn run_fetch_url(&self, params: &Value) -> Result<Value> {
        let url = params
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing 'url' parameter"))?;

        let fetched = self
            .search
            .fetch_url_content_directly(url)
            .await
            .ok_or_else(|| anyhow::anyhow!("Failed to fetch content from {}", url))?;

        let mut content = fetched.content;
        if content.len() > TOOL_FETCH_CONTENT_CAP {
            let mut cut = TOOL_FETCH_CONTENT_CAP;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str("...");
        }

        Ok(json!({
            "url": url,
            "title": fetched.title,
            "content": content,
        }))
    }

    async fn run_arxiv_search(&self, params: &Value) -> Result<Value> {
        let query = params
            .get("query")
            .and_then(|q| q.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing 'query' parameter"))?;
        let max_results = params
            .get("max_results")
            .and_then(|m| m.as_u64())
            .unwrap_or(10) as usize;

        let response = self
            .search
            .search(query, SearchProvider::McpAcademic, max_results, false)
            .await;

        let sources: Vec<Value> = response
            .results
            .iter()
            .map(|r| json!({"title": r.title, "url": r.url, "type": "arxiv"}))
            .collect();

        Ok(json!({
            "query": query,
            "results_count": response.results.len(),
            "papers": response.results,
            "sources": sources,
        }))
    }

    /// Call a dynamically discovered HTTP tool. The client may have been
    /// invalidated since the last call; on a failed first attempt a fresh
    /// client is built, stored for future calls, and the request retried
    /// exactly once. Clients are dropped on both paths, so no connection
    /// outlives the call that created it.
    async fn run_external(&self, spec: &ToolSpec, params: &Value) -> Result<Value> {
        let endpoint = spec
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("External tool '{}' missing endpoint", spec.name))?;
        let method = spec.method.as_deref().unwrap_or("POST");

        let empty = Map::new();
        let param_map = params.as_object().unwrap_or(&empty);
        let (url, body) = substitute_path_params(endpoint, param_map);

        let client = self.external_client.lock().await.clone();
        match self.send_external(&client, method, &url, &body).await {
            Ok(value) => Ok(value),
            Err(first_err) => {
                debug_println!(
                    "[Tools] external call failed ({}), recreating client and retrying",
                    first_err
                );
                let fresh = reqwest::Client::builder()
                    .timeout(self.external_timeout)
                    .build()?;
                *self.external_client.lock().await = fresh.clone();
                self.send_external(&fresh, method, &url, &body)
                    .await
                    .map_err(|retry_err| {
                        anyhow::anyhow!("{} (after retry: {})", first_err, retry_err)
                    })
            }
        }
    }

    async fn send_external(
        &self,
        client: &reqwest::Client,
        method: &str,
        url: &str,
        body: &Map<String, Value>,
    ) -> Result<Value> {
        progress::log_with(
            progress::Kind::Http,
            format!("HTTP {} {}", method, crate::search::host_from_url(url)),
        );
        let request = match method {
            "GET" => {
                let query: Vec<(String, String)> = body
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_plain_string(v)))
                    .collect();
                client.get(url).query(&query)
            }
            "DELETE" => client.delete(url),
            "PUT" => client.put(url).json(body),
            "PATCH" => client.patch(url).json(body),
            _ => client.post(url).json(body),
        };

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Tool server request failed: {} - {}",
                status,
                error_body
            ));
        }

        let text = response.text().await?;
        match serde_json::from_str(&text) {
            Ok(value) => Ok(value),
            Err(_) => Ok(json!({ "text": text })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry_with_host(host: String) -> ToolRegistry {
        let search = Arc::new(
            SearchCoordinator::new(host, Duration::from_secs(5), None).unwrap(),
        );
        ToolRegistry::new(search, None)
    }

    #[tokio::test]
    async fn unknown_tool_is_nonfatal() {
        let registry = registry_with_host("http://localhost:1".to_string());
        let execution = registry.execute("no_such_tool", &json!({})).await;
        assert!(!execution.success);
        assert!(execution.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_nonfatal() {
        let registry = registry_with_host("http://localhost:1".to_string());
        let execution = registry.execute("web_search", &json!({})).await;
        assert!(!execution.success);
        assert!(execution.error.unwrap().contains("query"));
    }

    #[tokio::test]
    async fn builtin_web_search_returns_results() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results": [{"title": "Rust", "url": "https://rust-lang.org", "content": "lang"}]}"#,
            )
            .create_async()
            .await;

        let registry = registry_with_host(server.url());
        let execution = registry
            .execute("web_search", &json!({"query": "rust"}))
            .await;
        assert!(execution.success);
        assert_eq!(execution.result["results_count"], 1);
        assert_eq!(
            execution.result["results"][0]["url"],
            "https://rust-lang.org"
        );
    }

    #[test]
    fn builtins_are_registered() {
        let registry = registry_with_host("http://localhost:1".to_string());
        let names: Vec<&str> = registry.specs().iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"web_search"));
        assert!(names.contains(&"fetch_url_content"));
        assert!(names.contains(&"arxiv_search"));
    }

    #[test]
    fn path_template_substitution() {
        let mut params = Map::new();
        params.insert("paper_id".to_string(), json!("2401.12345"));
        params.insert("format".to_string(), json!("text"));

        let (url, remaining) =
            substitute_path_params("http://host/papers/{paper_id}", &params);
        assert_eq!(url, "http://host/papers/2401.12345");
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key("format"));
    }

    #[test]
    fn openapi_conversion_resolves_schema_refs() {
        let spec = json!({
            "paths": {
                "/search": {
                    "post": {
                        "operationId": "search_papers_post",
                        "description": "Search papers",
                        "requestBody": {
                            "content": {
                                "application/json": {
                                    "schema": {"$ref": "#/components/schemas/search_form"}
                                }
                            }
                        }
                    }
                },
                "/papers/{paper_id}": {
                    "get": {
                        "summary": "Read one paper",
                        "parameters": [
                            {"name": "paper_id", "required": true, "schema": {"type": "string"},
                             "description": "arXiv id"}
                        ]
                    }
                }
            },
            "components": {
                "schemas": {
                    "search_form": {
                        "properties": {
                            "query": {"type": "string"},
                            "max_results": {"type": "integer"}
                        },
                        "required": ["query"]
                    }
                }
            }
        });

        let specs = convert_openapi_to_specs(&spec, "http://host/");
        assert_eq!(specs.len(), 2);

        let search = specs.iter().find(|s| s.name == "search_papers_post").unwrap();
        assert_eq!(search.kind, ToolKind::ExternalApi);
        assert_eq!(search.endpoint.as_deref(), Some("http://host/search"));
        assert_eq!(search.method.as_deref(), Some("POST"));
        assert!(search.parameters["properties"]["query"].is_object());
        assert_eq!(search.parameters["required"][0], "query");

        let read = specs.iter().find(|s| s.name == "get__papers_{paper_id}").unwrap();
        assert_eq!(read.description, "Read one paper");
        assert_eq!(read.parameters["properties"]["paper_id"]["type"], "string");
    }

    #[tokio::test]
    async fn external_tool_success_parses_json() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server
            .mock("POST", "/op")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let mut registry = registry_with_host("http://localhost:1".to_string());
        registry.register(ToolSpec {
            name: "op".to_string(),
            description: String::new(),
            parameters: json!({}),
            kind: ToolKind::ExternalApi,
            endpoint: Some(format!("{}/op", server.url())),
            method: Some("POST".to_string()),
        });

        let execution = registry.execute("op", &json!({"a": 1})).await;
        assert!(execution.success);
        assert_eq!(execution.result["ok"], true);
    }

    #[tokio::test]
    async fn external_tool_failure_retries_once_then_reports() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/op")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let mut registry = registry_with_host("http://localhost:1".to_string());
        registry.register(ToolSpec {
            name: "op".to_string(),
            description: String::new(),
            parameters: json!({}),
            kind: ToolKind::ExternalApi,
            endpoint: Some(format!("{}/op", server.url())),
            method: Some("POST".to_string()),
        });

        let execution = registry.execute("op", &json!({"a": 1})).await;
        assert!(!execution.success);
        assert!(execution.error.unwrap().contains("after retry"));
        failing.assert_async().await;
    }
}
