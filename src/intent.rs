use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;

use crate::config::ClassifierConfig;
use crate::progress;
use crate::search::SearchProvider;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"'{}|\\^`\[\]]+"#).expect("url regex"));

static DIRECT_REQUEST_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(?:analyze|explain|summarize|review|examine)\s+(?:this\s+)?(?:url|link|page|website|article)",
        r"(?i)\b(?:what|how)\s+(?:is|does|are)\s+(?:this|that)",
        r"(?i)\btell\s+me\s+about\s+(?:this|that)",
        r"(?i)\b(?:analyze|explain|summarize|review|examine)\s+(?:this\s+)?(?:https?://|www\.)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("direct request regex"))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    WebSearch,
    UrlFetch,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::WebSearch => "web_search",
            SearchStrategy::UrlFetch => "url_fetch",
        }
    }
}

/// Produced once per session from the raw topic text; immutable thereafter.
#[derive(Debug, Clone, Default)]
pub struct InputAnalysis {
    pub has_url: bool,
    pub url: Option<String>,
    pub is_direct_fetch: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct IntentSignals {
    pub has_url: bool,
    pub is_direct_request: bool,
}

#[derive(Debug, Clone)]
pub struct IntentResult {
    pub strategy: SearchStrategy,
    pub confidence: f32,
    pub method: &'static str,
    pub signals: IntentSignals,
    /// Provider hint from the remote classifier (academic-only queries route
    /// to the MCP paper search). `None` leaves the configured provider alone.
    pub preferred_provider: Option<SearchProvider>,
}

/// Detect URLs and direct content requests in the raw topic text.
pub fn analyze_input(text: &str) -> InputAnalysis {
    let url = URL_RE.find(text).map(|m| m.as_str().to_string());
    let is_direct = DIRECT_REQUEST_RES.iter().any(|re| re.is_match(text));
    InputAnalysis {
        has_url: url.is_some(),
        url,
        is_direct_fetch: is_direct,
    }
}

/// Rule-based classification: a URL plus a direct content request routes to
/// URL fetching; everything else is a web research query.
pub fn classify_rule_based(text: &str) -> IntentResult {
    let analysis = analyze_input(text);
    let signals = IntentSignals {
        has_url: analysis.has_url,
        is_direct_request: analysis.is_direct_fetch,
    };

    if analysis.has_url && analysis.is_direct_fetch {
        IntentResult {
            strategy: SearchStrategy::UrlFetch,
            confidence: 0.95,
            method: "rule_based",
            signals,
            preferred_provider: None,
        }
    } else {
        IntentResult {
            strategy: SearchStrategy::WebSearch,
            confidence: 0.90,
            method: "rule_based",
            signals,
            preferred_provider: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteClassification {
    #[serde(default)]
    class_id: i64,
    #[serde(default)]
    class_label: String,
    #[serde(default)]
    confidence: f32,
}

/// Classifier with an optional remote model consultation for ambiguous
/// queries. The remote call can never fail the classification step: any
/// transport or parse error falls back to the rule-based result.
pub struct IntentClassifier {
    remote_endpoint: Option<String>,
    client: reqwest::Client,
}

impl IntentClassifier {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        IntentClassifier {
            remote_endpoint: config.enabled.then(|| config.endpoint.clone()),
            client,
        }
    }

    pub async fn classify(&self, text: &str) -> IntentResult {
        let rule_result = classify_rule_based(text);

        // URL inputs are decided by the rules alone; the remote model only
        // helps pick a provider for ambiguous free-text queries.
        if rule_result.signals.has_url || rule_result.confidence > 0.90 {
            return rule_result;
        }

        let Some(endpoint) = &self.remote_endpoint else {
            return rule_result;
        };

        match self.classify_remote(endpoint, text).await {
            Some(remote) if remote.confidence > 0.70 => {
                progress::log(format!(
                    "intent: remote classifier chose {} ({:.2})",
                    remote.class_label, remote.confidence
                ));
                // Class 1 is academic-only; everything else stays on the
                // hybrid web path.
                let preferred = (remote.class_id == 1).then_some(SearchProvider::McpAcademic);
                IntentResult {
                    strategy: SearchStrategy::WebSearch,
                    confidence: remote.confidence,
                    method: "remote_classifier",
                    signals: rule_result.signals,
                    preferred_provider: preferred,
                }
            }
            _ => rule_result,
        }
    }

    async fn classify_remote(&self, endpoint: &str, text: &str) -> Option<RemoteClassification> {
        let response = self
            .client
            .post(format!("{}/classify", endpoint.trim_end_matches('/')))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<RemoteClassification>().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_topic_is_web_search() {
        let result = classify_rule_based("What is quantum computing?");
        assert_eq!(result.strategy, SearchStrategy::WebSearch);
        assert!((result.confidence - 0.90).abs() < f32::EPSILON);
        assert!(!result.signals.has_url);
    }

    #[test]
    fn url_with_direct_phrase_is_url_fetch() {
        let result = classify_rule_based("summarize this https://example.com/post");
        assert_eq!(result.strategy, SearchStrategy::UrlFetch);
        assert!((result.confidence - 0.95).abs() < f32::EPSILON);
        assert!(result.signals.has_url);
        assert!(result.signals.is_direct_request);

        let analysis = analyze_input("summarize this https://example.com/post");
        assert!(analysis.is_direct_fetch);
        assert_eq!(analysis.url.as_deref(), Some("https://example.com/post"));
    }

    #[test]
    fn bare_url_without_phrase_stays_web_search() {
        let result = classify_rule_based("https://example.com benchmarks vs competitors");
        assert_eq!(result.strategy, SearchStrategy::WebSearch);
        assert!(result.signals.has_url);
        assert!(!result.signals.is_direct_request);
    }

    #[test]
    fn url_is_extracted_from_surrounding_text() {
        let analysis = analyze_input("explain this link https://arxiv.org/abs/2401.12345 please");
        assert!(analysis.has_url);
        assert_eq!(analysis.url.as_deref(), Some("https://arxiv.org/abs/2401.12345"));
        assert!(analysis.is_direct_fetch);
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_rules() {
        // Endpoint that does not exist: the transport error must not surface.
        let classifier = IntentClassifier {
            remote_endpoint: Some("http://127.0.0.1:1".to_string()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(200))
                .build()
                .unwrap(),
        };
        let result = classifier.classify("ambiguous research topic").await;
        assert_eq!(result.method, "rule_based");
        assert_eq!(result.strategy, SearchStrategy::WebSearch);
    }

    #[tokio::test]
    async fn low_confidence_remote_is_ignored() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/classify")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"class_id": 1, "class_label": "arxiv_only", "confidence": 0.5}"#)
            .create_async()
            .await;

        let classifier = IntentClassifier {
            remote_endpoint: Some(server.url()),
            client: reqwest::Client::new(),
        };
        let result = classifier.classify("ambiguous research topic").await;
        assert_eq!(result.method, "rule_based");
        assert!(result.preferred_provider.is_none());
    }

    #[tokio::test]
    async fn confident_academic_classification_prefers_mcp() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/classify")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"class_id": 1, "class_label": "arxiv_only", "confidence": 0.92}"#)
            .create_async()
            .await;

        let classifier = IntentClassifier {
            remote_endpoint: Some(server.url()),
            client: reqwest::Client::new(),
        };
        let result = classifier.classify("ambiguous research topic").await;
        assert_eq!(result.method, "remote_classifier");
        assert_eq!(result.preferred_provider, Some(SearchProvider::McpAcademic));
    }
}
