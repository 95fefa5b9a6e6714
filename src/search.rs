use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::mcp::McpClient;
use crate::progress;

/// Hard cap on extracted page text, bounding memory and token cost.
const MAX_PAGE_CHARS: usize = 50_000;

const USER_AGENT: &str = "deep-scout/0.1 (research assistant)";

macro_rules! debug_println {
    ($($arg:tt)*) => {
        if std::env::var("DEEP_SCOUT_DEBUG").is_ok() {
            println!($($arg)*);
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchProvider {
    Web,
    McpAcademic,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearxngResponse {
    #[serde(default)]
    results: Vec<SearxngHit>,
}

#[derive(Debug, Deserialize)]
struct SearxngHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

pub fn host_from_url(url: &str) -> String {
    let u = url.trim();
    let without_scheme = if let Some(pos) = u.find("://") {
        &u[pos + 3..]
    } else {
        u
    };
    let host = without_scheme
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or(without_scheme);
    let host = if let Some(at) = host.rfind('@') {
        &host[at + 1..]
    } else {
        host
    };
    let host = host.split(':').next().unwrap_or(host);
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("script regex"));
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("style regex"));
static CHROME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(nav|footer|header)[^>]*>.*?</(nav|footer|header)>").expect("chrome regex")
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));

/// Strip boilerplate (scripts, styles, navigation chrome) and tags from HTML,
/// decode common entities, collapse whitespace, and cap the length.
pub fn extract_text_from_html(html: &str) -> String {
    let without_scripts = SCRIPT_RE.replace_all(html, "");
    let without_styles = STYLE_RE.replace_all(&without_scripts, "");
    let without_chrome = CHROME_RE.replace_all(&without_styles, "");
    let without_tags = TAG_RE.replace_all(&without_chrome, " ");

    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    let text = WS_RE.replace_all(&decoded, " ").trim().to_string();

    if text.len() > MAX_PAGE_CHARS {
        let mut cut = MAX_PAGE_CHARS;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    } else {
        text
    }
}

fn extract_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| WS_RE.replace_all(m.as_str().trim(), " ").to_string())
        .filter(|t| !t.is_empty())
}

/// Chooses a search provider per iteration, invokes it, and degrades to the
/// plain web path on failure. Search failures are never fatal: the worst
/// outcome is an empty result set.
pub struct SearchCoordinator {
    http: reqwest::Client,
    searxng_host: String,
    mcp: Option<Arc<Mutex<McpClient>>>,
}

impl SearchCoordinator {
    pub fn new(
        searxng_host: String,
        timeout: Duration,
        mcp: Option<Arc<Mutex<McpClient>>>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(SearchCoordinator {
            http,
            searxng_host: searxng_host.trim_end_matches('/').to_string(),
            mcp,
        })
    }

    pub async fn search(
        &self,
        query: &str,
        provider: SearchProvider,
        max_results: usize,
        fetch_full_page: bool,
    ) -> SearchResponse {
        let attempt = match provider {
            SearchProvider::McpAcademic => self.mcp_search(query, max_results).await,
            SearchProvider::Web => self.web_search(query, max_results, fetch_full_page).await,
        };

        match attempt {
            Ok(response) => response,
            Err(e) => {
                progress::log_with(
                    progress::Kind::Search,
                    format!("search failed ({}), retrying via web path", e),
                );
                match self.web_search(query, max_results, fetch_full_page).await {
                    Ok(response) => response,
                    Err(e2) => {
                        progress::log_with(
                            progress::Kind::Search,
                            format!("fallback search failed: {}", e2),
                        );
                        SearchResponse::default()
                    }
                }
            }
        }
    }

    async fn web_search(
        &self,
        query: &str,
        max_results: usize,
        fetch_full_page: bool,
    ) -> Result<SearchResponse> {
        progress::log_with(
            progress::Kind::Search,
            format!("SearXNG search: {}", query),
        );

        let response = self
            .http
            .get(format!("{}/search", self.searxng_host))
            .query(&[
                ("q", query),
                ("format", "json"),
                ("engines", "google,bing,duckduckgo"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "SearXNG returned HTTP {}",
                response.status()
            ));
        }

        let parsed: SearxngResponse = response.json().await?;
        let mut results = Vec::new();
        for hit in parsed.results.into_iter().take(max_results) {
            if hit.url.is_empty() {
                continue;
            }
            let raw_content = if fetch_full_page {
                match self.fetch_page_text(&hit.url).await {
                    Some(text) => Some(text),
                    None => Some(hit.content.clone()),
                }
            } else {
                Some(hit.content.clone())
            };
            results.push(SearchResult {
                title: if hit.title.is_empty() {
                    "Unknown Title".to_string()
                } else {
                    hit.title
                },
                url: hit.url,
                content: if hit.content.is_empty() {
                    "No content available".to_string()
                } else {
                    hit.content
                },
                raw_content,
            });
        }

        debug_println!("[Search] {} results for query: {}", results.len(), query);
        Ok(SearchResponse { results })
    }

    async fn mcp_search(&self, query: &str, max_results: usize) -> Result<SearchResponse> {
        let mcp = self
            .mcp
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no MCP server configured"))?;

        progress::log_with(progress::Kind::Mcp, format!("MCP paper search: {}", query));

        let mut client = mcp.lock().await;
        let papers = client.search_papers(query, max_results).await?;

        let results = papers
            .into_iter()
            .map(|paper| {
                let url = if paper.url.is_empty() {
                    format!("https://arxiv.org/abs/{}", paper.id)
                } else {
                    paper.url
                };
                let summary = if paper.summary.is_empty() {
                    "No summary available".to_string()
                } else {
                    paper.summary
                };
                SearchResult {
                    title: paper.title,
                    url,
                    raw_content: Some(summary.clone()),
                    content: summary,
                }
            })
            .collect();

        Ok(SearchResponse { results })
    }

    async fn fetch_page_text(&self, url: &str) -> Option<String> {
        progress::log_with(progress::Kind::Fetch, format!("GET {}", host_from_url(url)));

        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            debug_println!("[Fetch] HTTP {} for {}", response.status(), url);
            return None;
        }
        let html = response.text().await.ok()?;
        let text = extract_text_from_html(&html);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Fetch a single URL's content directly, for "explain this link"
    /// requests. Returns the extracted text as a search-result shaped record
    /// so the rest of the pipeline can treat it uniformly.
    pub async fn fetch_url_content_directly(&self, url: &str) -> Option<SearchResult> {
        progress::log_with(progress::Kind::Fetch, format!("direct fetch {}", url));

        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let html = response.text().await.ok()?;
        let title = extract_title(&html).unwrap_or_else(|| format!("Content from {}", url));
        let text = extract_text_from_html(&html);
        if text.is_empty() {
            return None;
        }
        Some(SearchResult {
            title,
            url: url.to_string(),
            content: text.clone(),
            raw_content: Some(text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_extraction_strips_boilerplate() {
        let html = r#"<html><head><title>Page Title</title>
            <script>var x = 1;</script><style>body { color: red; }</style></head>
            <body><nav>menu</nav><p>Real &amp; useful content</p><footer>foot</footer></body></html>"#;
        let text = extract_text_from_html(html);
        assert!(text.contains("Real & useful content"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("color: red"));
        assert!(!text.contains("menu"));
        assert!(!text.contains("foot"));
    }

    #[test]
    fn html_extraction_caps_length() {
        let body = "word ".repeat(20_000);
        let html = format!("<html><body><p>{}</p></body></html>", body);
        let text = extract_text_from_html(&html);
        assert!(text.len() <= MAX_PAGE_CHARS + 3);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn title_extraction() {
        assert_eq!(
            extract_title("<html><title>  A  Title </title></html>").as_deref(),
            Some("A Title")
        );
        assert_eq!(extract_title("<html><body>no title</body></html>"), None);
    }

    #[test]
    fn host_from_url_strips_scheme_and_path() {
        assert_eq!(host_from_url("https://www.example.com/a/b?q=1"), "example.com");
        assert_eq!(host_from_url("http://localhost:8001/search"), "localhost");
    }

    #[tokio::test]
    async fn web_search_parses_searxng_results() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results": [
                    {"title": "Rust", "url": "https://rust-lang.org", "content": "A language"},
                    {"title": "Book", "url": "https://doc.rust-lang.org/book", "content": "The book"}
                ]}"#,
            )
            .create_async()
            .await;

        let coordinator =
            SearchCoordinator::new(server.url(), Duration::from_secs(5), None).unwrap();
        let response = coordinator
            .search("rust", SearchProvider::Web, 8, false)
            .await;
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].url, "https://rust-lang.org");
        assert_eq!(response.results[0].raw_content.as_deref(), Some("A language"));
    }

    #[tokio::test]
    async fn failing_provider_falls_back_and_never_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let coordinator =
            SearchCoordinator::new(server.url(), Duration::from_secs(5), None).unwrap();
        // MCP path has no client, so it fails; the web fallback then also
        // fails with a 500. The session still gets an empty result set.
        let response = coordinator
            .search("rust", SearchProvider::McpAcademic, 8, false)
            .await;
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn max_results_is_honored() {
        let mut server = mockito::Server::new_async().await;
        let hits: Vec<String> = (0..10)
            .map(|i| {
                format!(
                    r#"{{"title": "t{i}", "url": "https://example.com/{i}", "content": "c{i}"}}"#
                )
            })
            .collect();
        let body = format!(r#"{{"results": [{}]}}"#, hits.join(","));
        let _mock = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let coordinator =
            SearchCoordinator::new(server.url(), Duration::from_secs(5), None).unwrap();
        let response = coordinator
            .search("anything", SearchProvider::Web, 3, false)
            .await;
        assert_eq!(response.results.len(), 3);
    }
}
