use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::intent::{analyze_input, InputAnalysis, IntentClassifier, SearchStrategy};
use crate::llm::{self, InvokeOptions, LlmClient};
use crate::mcp::McpClient;
use crate::memory::MemoryClient;
use crate::progress;
use crate::prompts;
use crate::search::{SearchCoordinator, SearchProvider};
use crate::sources;
use crate::tools::{ToolExecution, ToolRegistry};

#[derive(Debug, Clone)]
pub enum ResearchProgress {
    Started,
    IntentClassified { strategy: &'static str, confidence: f32 },
    FetchingUrl(String),
    ToolResearch,
    GeneratingQuery,
    Searching { loop_count: usize, max_loops: usize },
    Summarizing,
    Verifying(usize),
    Reflecting,
    Finalizing,
    Completed,
    Cancelled,
}

/// One executed tool call, kept for summarization context and source
/// extraction at finalization.
#[derive(Debug, Clone)]
pub struct ToolRecord {
    pub tool_name: String,
    pub execution: ToolExecution,
}

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub question: String,
    pub search_results: String,
    pub sources: String,
}

/// Mutable state of one research session, owned exclusively by the
/// orchestrator for the session's lifetime and discarded after the final
/// report is returned. The sequence fields are append-only.
#[derive(Debug)]
pub struct ResearchSession {
    pub topic: String,
    pub input_analysis: InputAnalysis,
    pub search_strategy: SearchStrategy,
    pub search_query: String,
    pub loop_count: usize,
    pub web_research_results: Vec<String>,
    pub sources_gathered: Vec<String>,
    pub tool_results: Vec<ToolRecord>,
    pub verification_questions: Vec<String>,
    pub verification_results: Vec<VerificationResult>,
    pub running_summary: String,
    pub enhanced_context: String,
    pub preferred_provider: Option<SearchProvider>,
    llm_ok_count: usize,
    llm_error_count: usize,
}

impl ResearchSession {
    pub fn new(topic: &str) -> Self {
        ResearchSession {
            topic: topic.to_string(),
            input_analysis: InputAnalysis::default(),
            search_strategy: SearchStrategy::WebSearch,
            search_query: String::new(),
            loop_count: 0,
            web_research_results: Vec::new(),
            sources_gathered: Vec::new(),
            tool_results: Vec::new(),
            verification_questions: Vec::new(),
            verification_results: Vec::new(),
            running_summary: String::new(),
            enhanced_context: String::new(),
            preferred_provider: None,
            llm_ok_count: 0,
            llm_error_count: 0,
        }
    }

    /// "Explain this link" requests skip verification and reflection.
    fn is_direct_fast_path(&self) -> bool {
        self.search_strategy == SearchStrategy::UrlFetch && self.input_analysis.is_direct_fetch
    }

    fn note_llm_ok(&mut self) {
        self.llm_ok_count += 1;
    }

    fn note_llm_error(&mut self) {
        self.llm_error_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ClassifyIntent,
    FetchUrlContent,
    ToolEnhancedResearch,
    GenerateQuery,
    WebResearch,
    SummarizeSources,
    GenerateVerificationQuestions,
    VerifyResearchClaims,
    SynthesizeWithVerification,
    ReflectOnSummary,
    FinalizeSummary,
    Done,
}

/// Web-research iterations allowed for a session. Direct URL-explain
/// requests do no additional research; other URL-fetch sessions get at most
/// one loop; plain research sessions get the configured depth.
pub fn compute_max_loops(configured: usize, strategy: SearchStrategy, is_direct_fetch: bool) -> usize {
    match strategy {
        SearchStrategy::UrlFetch => {
            if is_direct_fetch {
                0
            } else {
                configured.min(1)
            }
        }
        SearchStrategy::WebSearch => configured,
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

/// The research state machine. Sequences intent classification, tool
/// dispatch, search, summarization, verification, and reflection over a
/// single mutable session, and enforces the bounded-iteration policy.
pub struct ResearchOrchestrator {
    config: Config,
    llm: LlmClient,
    search: Arc<SearchCoordinator>,
    registry: Arc<ToolRegistry>,
    intent: IntentClassifier,
    memory: Option<MemoryClient>,
    progress_tx: Option<mpsc::UnboundedSender<ResearchProgress>>,
    cancel: CancellationToken,
}

impl ResearchOrchestrator {
    pub fn new(
        config: Config,
        llm: LlmClient,
        search: Arc<SearchCoordinator>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let intent = IntentClassifier::from_config(&config.classifier);
        let memory = MemoryClient::from_config(&config.memory);
        ResearchOrchestrator {
            config,
            llm,
            search,
            registry,
            intent,
            memory,
            progress_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config, mcp: Option<Arc<Mutex<McpClient>>>) -> Result<Self> {
        let llm = LlmClient::from_config(&config.llm, config.research.strip_thinking_tokens)?;
        let search = Arc::new(SearchCoordinator::new(
            config.search.searxng_host.clone(),
            Duration::from_secs(config.search.timeout_secs),
            mcp.clone(),
        )?);
        let registry = Arc::new(ToolRegistry::new(search.clone(), mcp));
        Ok(Self::new(config.clone(), llm, search, registry))
    }

    pub fn set_progress_channel(&mut self, tx: mpsc::UnboundedSender<ResearchProgress>) {
        self.progress_tx = Some(tx);
    }

    /// Token callers can use to abort the session at the next suspension
    /// point. A cancelled session returns a labeled partial report.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn send_progress(&self, update: ResearchProgress) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(update);
        }
    }

    /// Run one session to completion and return the final report text.
    pub async fn research(&self, topic: &str) -> Result<String> {
        let session = self.research_session(topic).await?;
        Ok(session.running_summary)
    }

    /// Like `research`, but returns the whole session for callers that want
    /// the gathered material alongside the report.
    pub async fn research_session(&self, topic: &str) -> Result<ResearchSession> {
        let mut session = ResearchSession::new(topic);
        self.send_progress(ResearchProgress::Started);
        progress::log(format!("research started: {}", topic));

        if let Some(memory) = &self.memory {
            let memories = memory.recall(topic, 3).await;
            if !memories.is_empty() {
                session.enhanced_context.push_str("\n<Prior Research>\n");
                for memory_entry in &memories {
                    if let Some(content) = memory_entry.get("content").and_then(|c| c.as_str()) {
                        session
                            .enhanced_context
                            .push_str(&format!("- {}\n", truncate_chars(content, 500)));
                    }
                }
                session.enhanced_context.push_str("</Prior Research>\n");
            }
        }

        let mut phase = Phase::ClassifyIntent;
        while phase != Phase::Done {
            if self.cancel.is_cancelled() {
                self.send_progress(ResearchProgress::Cancelled);
                session.running_summary = cancelled_report(&session);
                return Ok(session);
            }
            phase = self.step(phase, &mut session).await?;
        }

        self.send_progress(ResearchProgress::Completed);
        progress::log(format!(
            "research complete: {} loops, {} LLM calls ok, {} failed",
            session.loop_count, session.llm_ok_count, session.llm_error_count
        ));

        if let Some(memory) = &self.memory {
            memory
                .record_research(
                    topic,
                    &session.running_summary,
                    "final_report",
                    session.loop_count,
                )
                .await;
        }

        Ok(session)
    }

    async fn step(&self, phase: Phase, session: &mut ResearchSession) -> Result<Phase> {
        match phase {
            Phase::ClassifyIntent => self.classify_intent(session).await,
            Phase::FetchUrlContent => self.fetch_url_content(session).await,
            Phase::ToolEnhancedResearch => self.tool_enhanced_research(session).await,
            Phase::GenerateQuery => self.generate_query(session).await,
            Phase::WebResearch => self.web_research(session).await,
            Phase::SummarizeSources => self.summarize_sources(session).await,
            Phase::GenerateVerificationQuestions => {
                self.generate_verification_questions(session).await
            }
            Phase::VerifyResearchClaims => self.verify_research_claims(session).await,
            Phase::SynthesizeWithVerification => self.synthesize_with_verification(session).await,
            Phase::ReflectOnSummary => self.reflect_on_summary(session).await,
            Phase::FinalizeSummary => self.finalize_summary(session).await,
            Phase::Done => Ok(Phase::Done),
        }
    }

    fn max_loops(&self, session: &ResearchSession) -> usize {
        compute_max_loops(
            self.config.research.max_web_research_loops,
            session.search_strategy,
            session.input_analysis.is_direct_fetch,
        )
    }

    fn provider_for(&self, session: &ResearchSession) -> SearchProvider {
        if self.config.search.provider == "mcp" {
            return SearchProvider::McpAcademic;
        }
        session.preferred_provider.unwrap_or(SearchProvider::Web)
    }

    async fn classify_intent(&self, session: &mut ResearchSession) -> Result<Phase> {
        session.input_analysis = analyze_input(&session.topic);
        let intent = self.intent.classify(&session.topic).await;
        session.search_strategy = intent.strategy;
        session.preferred_provider = intent.preferred_provider;

        self.send_progress(ResearchProgress::IntentClassified {
            strategy: intent.strategy.as_str(),
            confidence: intent.confidence,
        });
        progress::log(format!(
            "intent: {} ({:.2}, {})",
            intent.strategy.as_str(),
            intent.confidence,
            intent.method
        ));

        Ok(match session.search_strategy {
            SearchStrategy::UrlFetch => Phase::FetchUrlContent,
            SearchStrategy::WebSearch => Phase::ToolEnhancedResearch,
        })
    }

    async fn fetch_url_content(&self, session: &mut ResearchSession) -> Result<Phase> {
        let next = if session.input_analysis.is_direct_fetch {
            Phase::SummarizeSources
        } else {
            Phase::ToolEnhancedResearch
        };

        let Some(url) = session.input_analysis.url.clone() else {
            progress::log_with(progress::Kind::Fetch, "no URL found for content fetch");
            return Ok(next);
        };

        self.send_progress(ResearchProgress::FetchingUrl(url.clone()));

        match self.search.fetch_url_content_directly(&url).await {
            Some(result) => {
                let results = [result];
                session
                    .web_research_results
                    .push(sources::deduplicate_and_format_sources(&results, 2000, true));
                session
                    .sources_gathered
                    .push(sources::format_sources(&results));
            }
            None => {
                progress::log_with(
                    progress::Kind::Fetch,
                    format!("failed to extract content from {}", url),
                );
            }
        }

        Ok(next)
    }

    async fn tool_enhanced_research(&self, session: &mut ResearchSession) -> Result<Phase> {
        self.send_progress(ResearchProgress::ToolResearch);

        let specs = self.registry.specs_for_llm();
        if specs.is_empty() {
            return Ok(Phase::GenerateQuery);
        }

        let catalog = specs
            .iter()
            .map(|spec| {
                format!(
                    "- {}: {}",
                    spec["name"].as_str().unwrap_or(""),
                    spec["description"].as_str().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt =
            prompts::tool_selection_prompt(&session.topic, &session.running_summary, &catalog);
        let response = self
            .llm
            .invoke(
                "You are a helpful research assistant. You can use tools by responding with JSON tool calls.",
                &prompt,
                InvokeOptions::text(0.1),
            )
            .await;

        let response_text = match response {
            Ok(text) => {
                session.note_llm_ok();
                text
            }
            Err(e) => {
                session.note_llm_error();
                progress::log_with(progress::Kind::Tool, format!("tool selection failed: {}", e));
                String::new()
            }
        };

        let parsed_calls = llm::parse_json_response(&response_text)
            .and_then(|v| v.get("tool_calls").and_then(|t| t.as_array()).cloned());

        match parsed_calls {
            Some(calls) if calls.is_empty() => {
                // The model decided no tools are needed; keep its analysis
                // as context for the summarizer.
                if !response_text.trim().is_empty() {
                    session.enhanced_context.push_str(&format!(
                        "\n--- LLM Analysis ---\n{}\n",
                        response_text.trim()
                    ));
                }
            }
            Some(calls) => {
                for call in calls {
                    let Some(name) = call.get("name").and_then(|n| n.as_str()) else {
                        continue;
                    };
                    let args = call
                        .get("arguments")
                        .or_else(|| call.get("args"))
                        .cloned()
                        .unwrap_or_else(|| json!({}));
                    self.run_tool_step(session, name, args).await;
                }
            }
            None => {
                // No parseable tool calls: run the standard pair directly so
                // the session still gathers material.
                let topic = session.topic.clone();
                self.run_tool_step(
                    session,
                    "web_search",
                    json!({"query": topic, "max_results": 3}),
                )
                .await;
                let topic = session.topic.clone();
                self.run_tool_step(
                    session,
                    "arxiv_search",
                    json!({"query": topic, "max_results": 3}),
                )
                .await;
            }
        }

        Ok(Phase::GenerateQuery)
    }

    async fn run_tool_step(&self, session: &mut ResearchSession, name: &str, args: Value) {
        let execution = self.registry.execute(name, &args).await;

        if execution.success {
            progress::log_with(
                progress::Kind::Tool,
                format!("{} completed in {} ms", name, execution.duration_ms),
            );
            let result_text = execution.result.to_string();
            session.enhanced_context.push_str(&format!(
                "\n--- Tool: {} ---\nParameters: {}\nResult: {}\n",
                name,
                args,
                truncate_chars(&result_text, 1000)
            ));
        } else {
            progress::log_with(
                progress::Kind::Tool,
                format!(
                    "tool {} failed: {}",
                    name,
                    execution.error.as_deref().unwrap_or("unknown error")
                ),
            );
        }

        session.tool_results.push(ToolRecord {
            tool_name: name.to_string(),
            execution,
        });
    }

    async fn generate_query(&self, session: &mut ResearchSession) -> Result<Phase> {
        self.send_progress(ResearchProgress::GeneratingQuery);

        let date = prompts::current_date();
        // Already-fetched URL content grounds the query, but the generated
        // query must stay scoped to the original topic.
        let topic_context = match session.web_research_results.first() {
            Some(fetched) => format!(
                "{}\n\nContent already fetched for this topic (generate a query for \
complementary information about the SAME topic):\n{}",
                session.topic,
                truncate_chars(fetched, 2000)
            ),
            None => session.topic.clone(),
        };
        let system = prompts::query_writer_prompt(&topic_context, &date);

        session.search_query = match self
            .llm
            .invoke(&system, "Generate a query for web search:", InvokeOptions::json())
            .await
        {
            Ok(content) => {
                session.note_llm_ok();
                llm::parse_json_response(&content)
                    .and_then(|value| extract_query_field(&value))
                    .unwrap_or_else(|| session.topic.clone())
            }
            Err(e) => {
                session.note_llm_error();
                progress::log(format!("query generation failed: {}", e));
                session.topic.clone()
            }
        };

        Ok(Phase::WebResearch)
    }

    async fn web_research(&self, session: &mut ResearchSession) -> Result<Phase> {
        let max_loops = self.max_loops(session);
        self.send_progress(ResearchProgress::Searching {
            loop_count: session.loop_count + 1,
            max_loops,
        });

        let query = if session.search_query.trim().is_empty() {
            session.topic.clone()
        } else {
            session.search_query.clone()
        };
        let provider = self.provider_for(session);

        let response = self
            .search
            .search(
                &query,
                provider,
                self.config.search.max_results,
                self.config.search.fetch_full_page,
            )
            .await;

        if self.config.research.allow_strategy_revision
            && response.results.is_empty()
            && session.search_strategy == SearchStrategy::UrlFetch
        {
            progress::log("empty result set; revising strategy to plain web search");
            session.search_strategy = SearchStrategy::WebSearch;
        }

        session
            .sources_gathered
            .push(sources::format_sources(&response.results));
        session
            .web_research_results
            .push(sources::deduplicate_and_format_sources(
                &response.results,
                1000,
                self.config.search.fetch_full_page,
            ));
        session.loop_count += 1;

        Ok(Phase::SummarizeSources)
    }

    async fn summarize_sources(&self, session: &mut ResearchSession) -> Result<Phase> {
        self.send_progress(ResearchProgress::Summarizing);

        let most_recent = session
            .web_research_results
            .last()
            .cloned()
            .unwrap_or_default();

        let mut tool_context = String::new();
        if !session.tool_results.is_empty() {
            tool_context.push_str("\n<Tool Results>\n");
            for record in &session.tool_results {
                let result_text = record.execution.result.to_string();
                tool_context.push_str(&format!(
                    "Tool: {}\nResult: {}\n\n",
                    record.tool_name,
                    truncate_chars(&result_text, 500)
                ));
            }
            tool_context.push_str("</Tool Results>\n");
        }
        if !session.enhanced_context.is_empty() {
            tool_context.push_str(&format!(
                "\n<Enhanced Context>\n{}\n</Enhanced Context>\n",
                session.enhanced_context
            ));
        }

        let human = if session.running_summary.is_empty() {
            format!(
                "<Web Research Context>\n{}\n</Web Research Context>\n\n{}Create a summary \
using the web research context and tool results on this topic:\n<User Input>\n{}\n</User Input>",
                most_recent, tool_context, session.topic
            )
        } else {
            format!(
                "<Existing Summary>\n{}\n</Existing Summary>\n\n<New Web Research>\n{}\n\
</New Web Research>\n\n{}Update the existing summary with the new web research and tool \
results on this topic:\n<User Input>\n{}\n</User Input>",
                session.running_summary, most_recent, tool_context, session.topic
            )
        };

        match self
            .llm
            .invoke(
                &prompts::summarizer_prompt(&session.topic),
                &human,
                InvokeOptions::text(0.0),
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                session.note_llm_ok();
                session.running_summary = text;
            }
            Ok(_) => {
                session.running_summary = degraded_summary(session, &most_recent);
            }
            Err(e) => {
                session.note_llm_error();
                progress::log(format!("summarization failed, using digest: {}", e));
                session.running_summary = degraded_summary(session, &most_recent);
            }
        }

        Ok(if session.is_direct_fast_path() {
            Phase::FinalizeSummary
        } else {
            Phase::GenerateVerificationQuestions
        })
    }

    async fn generate_verification_questions(
        &self,
        session: &mut ResearchSession,
    ) -> Result<Phase> {
        if !self.config.research.verification_enabled {
            return Ok(Phase::VerifyResearchClaims);
        }
        if session.running_summary.is_empty() || !session.verification_questions.is_empty() {
            return Ok(Phase::VerifyResearchClaims);
        }

        let system = prompts::verification_questions_prompt(&session.topic, &session.running_summary);
        match self
            .llm
            .invoke(
                &system,
                "Generate verification questions for the research summary.",
                InvokeOptions::json(),
            )
            .await
        {
            Ok(content) => {
                session.note_llm_ok();
                if let Some(value) = llm::parse_json_response(&content) {
                    if let Some(questions) = value
                        .get("verification_questions")
                        .and_then(|q| q.as_array())
                    {
                        for question in questions.iter().take(5) {
                            if let Some(text) = question.as_str() {
                                session.verification_questions.push(text.to_string());
                            }
                        }
                    }
                }
            }
            Err(e) => {
                session.note_llm_error();
                progress::log_with(
                    progress::Kind::Verify,
                    format!("question generation failed, skipping verification: {}", e),
                );
            }
        }

        Ok(Phase::VerifyResearchClaims)
    }

    async fn verify_research_claims(&self, session: &mut ResearchSession) -> Result<Phase> {
        if session.is_direct_fast_path() || session.verification_questions.is_empty() {
            return Ok(Phase::SynthesizeWithVerification);
        }

        // At most the first three questions, each a narrow search: fewer
        // results, shorter snippets. Branches are independent, so they fan
        // out concurrently; one failed question never aborts the rest.
        let questions: Vec<String> = session
            .verification_questions
            .iter()
            .take(3)
            .cloned()
            .collect();
        self.send_progress(ResearchProgress::Verifying(questions.len()));
        progress::log_with(
            progress::Kind::Verify,
            format!("verifying {} claims", questions.len()),
        );

        let searches = questions.into_iter().map(|question| {
            let search = self.search.clone();
            async move {
                let response = search.search(&question, SearchProvider::Web, 2, false).await;
                VerificationResult {
                    search_results: sources::deduplicate_and_format_sources(
                        &response.results,
                        500,
                        false,
                    ),
                    sources: sources::format_sources(&response.results),
                    question,
                }
            }
        });

        let results = futures_util::future::join_all(searches).await;
        session.verification_results.extend(results);

        Ok(Phase::SynthesizeWithVerification)
    }

    async fn synthesize_with_verification(&self, session: &mut ResearchSession) -> Result<Phase> {
        if session.is_direct_fast_path() || session.verification_results.is_empty() {
            return Ok(Phase::ReflectOnSummary);
        }

        let mut verification_context = String::new();
        for (i, result) in session.verification_results.iter().enumerate() {
            verification_context.push_str(&format!(
                "\n--- Verification {} ---\nQuestion: {}\nFindings: {}\n",
                i + 1,
                result.question,
                result.search_results
            ));
        }

        let human = format!(
            "<Original Summary>\n{}\n</Original Summary>\n\n<Verification Results>\n{}\n\
</Verification Results>\n\nSynthesize the original summary with the verification results \
into an improved, more accurate summary with appropriate confidence indicators.",
            session.running_summary, verification_context
        );
        let system = prompts::verification_synthesis_prompt(
            &session.topic,
            session.running_summary.len(),
        );

        match self
            .llm
            .invoke(&system, &human, InvokeOptions::text(0.1))
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                session.note_llm_ok();
                session.running_summary = text;
            }
            Ok(_) => {}
            Err(e) => {
                session.note_llm_error();
                progress::log_with(
                    progress::Kind::Verify,
                    format!("synthesis failed, keeping original summary: {}", e),
                );
            }
        }

        Ok(Phase::ReflectOnSummary)
    }

    async fn reflect_on_summary(&self, session: &mut ResearchSession) -> Result<Phase> {
        if session.is_direct_fast_path() {
            session.search_query.clear();
            return Ok(self.route_after_reflection(session));
        }

        self.send_progress(ResearchProgress::Reflecting);

        let system = prompts::reflection_prompt(&session.topic, &session.running_summary);
        let human = format!(
            "Analyze the summary and generate a follow-up query that stays focused on the \
original research topic: {}",
            session.topic
        );

        match self.llm.invoke(&system, &human, InvokeOptions::json()).await {
            Ok(content) => {
                session.note_llm_ok();
                match llm::parse_json_response(&content) {
                    Some(value) => {
                        let is_sufficient = value
                            .get("is_sufficient")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        if is_sufficient {
                            progress::log_with(
                                progress::Kind::Reflect,
                                "summary judged sufficient, finishing",
                            );
                            session.search_query.clear();
                        } else {
                            session.search_query = extract_follow_up_query(&value)
                                .unwrap_or_else(|| {
                                    format!("More information about {}", session.topic)
                                });
                        }
                    }
                    None => {
                        session.search_query = format!("Tell me more about {}", session.topic);
                    }
                }
            }
            Err(e) => {
                session.note_llm_error();
                progress::log_with(progress::Kind::Reflect, format!("reflection failed: {}", e));
                session.search_query = format!("Tell me more about {}", session.topic);
            }
        }

        Ok(self.route_after_reflection(session))
    }

    fn route_after_reflection(&self, session: &ResearchSession) -> Phase {
        if session.search_query.is_empty() || session.loop_count >= self.max_loops(session) {
            Phase::FinalizeSummary
        } else {
            Phase::WebResearch
        }
    }

    async fn finalize_summary(&self, session: &mut ResearchSession) -> Result<Phase> {
        self.send_progress(ResearchProgress::Finalizing);
        progress::log_with(progress::Kind::Report, "generating final report");

        let mut unique_sources =
            sources::dedupe_source_lines(session.sources_gathered.iter().map(|s| s.as_str()));
        for tool_source in extract_tool_sources(&session.tool_results) {
            if !unique_sources.contains(&tool_source) {
                unique_sources.push(tool_source);
            }
        }

        let research_context = session
            .web_research_results
            .iter()
            .enumerate()
            .map(|(i, result)| {
                format!("<Research Round {}>\n{}\n</Research Round {}>", i + 1, result, i + 1)
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let sources_context = if unique_sources.is_empty() {
            "No specific sources available.".to_string()
        } else {
            unique_sources.join("\n")
        };

        let human = format!(
            "<Research Summary>\n{}\n</Research Summary>\n\n<Web Research Results>\n{}\n\
</Web Research Results>\n\n<Sources>\n{}\n</Sources>\n\nGenerate a comprehensive research \
report that synthesizes all of this information into a professional document.",
            session.running_summary, research_context, sources_context
        );
        let system =
            prompts::report_prompt(&session.topic, &prompts::current_date(), session.loop_count);

        let generated = match self
            .llm
            .invoke(&system, &human, InvokeOptions::text(0.3))
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                session.note_llm_ok();
                text
            }
            Ok(_) => degraded_report(session),
            Err(e) => {
                session.note_llm_error();
                if session.llm_ok_count == 0 {
                    // Nothing reached the backend for the whole session; no
                    // further progress is possible.
                    return Err(anyhow::anyhow!("LLM backend unreachable: {}", e));
                }
                progress::log_with(
                    progress::Kind::Report,
                    format!("report generation failed, assembling from summary: {}", e),
                );
                degraded_report(session)
            }
        };

        session.running_summary = assemble_final_report(generated, &unique_sources);
        Ok(Phase::Done)
    }
}

/// Convenience entry point: build an orchestrator from configuration and run
/// one session. This is the produced `run_research(topic, config)` surface.
#[allow(dead_code)]
pub async fn run_research(topic: &str, config: &Config) -> Result<String> {
    let orchestrator = ResearchOrchestrator::from_config(config, None)?;
    orchestrator.research(topic).await
}

fn extract_query_field(value: &Value) -> Option<String> {
    match value.get("query") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Array(list)) => list
            .iter()
            .find_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn extract_follow_up_query(value: &Value) -> Option<String> {
    match value.get("follow_up_queries") {
        Some(Value::Array(list)) => list
            .iter()
            .find_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn degraded_summary(session: &ResearchSession, most_recent: &str) -> String {
    let material = if !most_recent.trim().is_empty() {
        most_recent
    } else if !session.enhanced_context.trim().is_empty() {
        &session.enhanced_context
    } else {
        "No research material was gathered."
    };
    format!(
        "Summary generation was unavailable; raw research digest for \"{}\":\n\n{}",
        session.topic,
        truncate_chars(material, 2000)
    )
}

fn degraded_report(session: &ResearchSession) -> String {
    format!(
        "# Research Notes: {}\n\n{}",
        session.topic, session.running_summary
    )
}

fn cancelled_report(session: &ResearchSession) -> String {
    let partial = if session.running_summary.is_empty() {
        "No summary was produced before cancellation."
    } else {
        session.running_summary.as_str()
    };
    format!(
        "# Research Cancelled\n\nThe session for \"{}\" was cancelled before completion.\n\n\
## Partial Findings\n\n{}",
        session.topic, partial
    )
}

/// Pull paper/source links out of recorded tool results. Academic search
/// results carry `sources` or `papers` arrays, sometimes nested one level
/// under `result`.
fn extract_tool_sources(records: &[ToolRecord]) -> Vec<String> {
    let mut formatted = Vec::new();
    for record in records {
        if !record.execution.success {
            continue;
        }
        collect_sources_from_value(&record.execution.result, &mut formatted);
        if let Some(inner) = record.execution.result.get("result") {
            collect_sources_from_value(inner, &mut formatted);
        }
    }
    formatted
}

fn collect_sources_from_value(value: &Value, out: &mut Vec<String>) {
    if let Some(sources) = value.get("sources").and_then(|s| s.as_array()) {
        for source in sources {
            let Some(url) = source.get("url").and_then(|u| u.as_str()) else {
                continue;
            };
            let title = source
                .get("title")
                .and_then(|t| t.as_str())
                .unwrap_or("Untitled Source");
            let is_arxiv = source.get("type").and_then(|t| t.as_str()) == Some("arxiv");
            let line = if is_arxiv {
                format!("**{}**: [{}]({}) (ArXiv Paper)", title, url, url)
            } else {
                format!("**{}**: [{}]({})", title, url, url)
            };
            if !out.contains(&line) {
                out.push(line);
            }
        }
        return;
    }

    if let Some(papers) = value.get("papers").and_then(|p| p.as_array()) {
        for paper in papers {
            let Some(url) = paper.get("url").and_then(|u| u.as_str()) else {
                continue;
            };
            let title = paper
                .get("title")
                .and_then(|t| t.as_str())
                .unwrap_or("ArXiv Paper");
            let line = format!("**{}**: [{}]({}) (ArXiv Paper)", title, url, url);
            if !out.contains(&line) {
                out.push(line);
            }
        }
    }
}

fn classify_source_line(url: &str) -> (&'static str, &'static str) {
    if url.contains("arxiv.org") {
        ("High", "Peer-Reviewed Preprint")
    } else if ["ieee.org", "acm.org", "nature.com", "science.org"]
        .iter()
        .any(|d| url.contains(d))
    {
        ("High", "Academic Publication")
    } else if ["github.com", "docs.", "readthedocs"]
        .iter()
        .any(|d| url.contains(d))
    {
        ("Medium", "Technical Documentation")
    } else if url.contains("medium.com") || url.contains("blog") {
        ("Medium", "Blog Post")
    } else if ["news", "reuters", "bloomberg"].iter().any(|d| url.contains(d)) {
        ("Medium", "News Source")
    } else {
        ("Medium", "Web Source")
    }
}

/// Standardize the sources header, append a sources section when the model
/// omitted one, and close with the disclaimer footer.
fn assemble_final_report(generated: String, unique_sources: &[String]) -> String {
    let mut report = generated;

    // Longest/most-specific patterns first so substrings never mangle an
    // already-standard header.
    for pattern in [
        "### Sources:",
        "### Sources & References",
        "Sources & References",
        "## Sources:",
        "## Sources",
        "Sources:",
    ] {
        if report.contains(pattern) {
            report = report.replace(pattern, "### Sources:");
            break;
        }
    }

    let mut sections = vec![report];

    if !sections[0].contains("### Sources:") && !unique_sources.is_empty() {
        sections.push(String::new());
        sections.push("### Sources:".to_string());
        sections.push(String::new());
        for source in unique_sources {
            let line = source.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(pos) = line.find(": http") {
                let title = line[..pos].trim_start_matches('•').trim();
                let url = line[pos + 2..].trim();
                let (reliability, source_type) = classify_source_line(url);
                sections.push(format!(
                    "* **{}**: {} (Reliability: {} - {})",
                    title, url, reliability, source_type
                ));
            } else {
                sections.push(format!("* {}", line));
            }
        }
    }

    if !sections[0].contains("---") {
        sections.push(String::new());
        sections.push("---".to_string());
        sections.push(String::new());
        sections.push(
            "*This research report was generated by an automated deep-research pipeline. \
The information presented is based on publicly available sources and should be verified \
for critical applications.*"
                .to_string(),
        );
    }

    sections.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(server_url: &str, max_loops: usize) -> Config {
        let mut config = Config::default();
        config.llm.base_url = server_url.to_string();
        config.llm.timeout_secs = 5;
        config.search.searxng_host = server_url.to_string();
        config.search.fetch_full_page = false;
        config.search.timeout_secs = 5;
        config.research.max_web_research_loops = max_loops;
        config
    }

    /// One canned chat body that satisfies every JSON-consuming phase: an
    /// empty tool-call list, a query, no verification questions, and a
    /// sufficient-summary verdict.
    fn canned_chat_body() -> String {
        let content = json!({
            "tool_calls": [],
            "query": "quantum computing overview",
            "verification_questions": [],
            "is_sufficient": true,
            "knowledge_gap": "",
            "follow_up_queries": []
        })
        .to_string();
        json!({"message": {"role": "assistant", "content": content}}).to_string()
    }

    #[test]
    fn max_loops_policy() {
        assert_eq!(compute_max_loops(3, SearchStrategy::WebSearch, false), 3);
        assert_eq!(compute_max_loops(3, SearchStrategy::UrlFetch, true), 0);
        assert_eq!(compute_max_loops(3, SearchStrategy::UrlFetch, false), 1);
        assert_eq!(compute_max_loops(0, SearchStrategy::UrlFetch, false), 0);
        assert_eq!(compute_max_loops(0, SearchStrategy::WebSearch, false), 0);
    }

    #[test]
    fn query_field_extraction_handles_string_and_list() {
        assert_eq!(
            extract_query_field(&json!({"query": "a question"})).as_deref(),
            Some("a question")
        );
        assert_eq!(
            extract_query_field(&json!({"query": ["first", "second"]})).as_deref(),
            Some("first")
        );
        assert!(extract_query_field(&json!({"query": ""})).is_none());
        assert!(extract_query_field(&json!({"other": 1})).is_none());
    }

    #[test]
    fn follow_up_query_extraction() {
        assert_eq!(
            extract_follow_up_query(&json!({"follow_up_queries": ["next q"]})).as_deref(),
            Some("next q")
        );
        assert_eq!(
            extract_follow_up_query(&json!({"follow_up_queries": "single"})).as_deref(),
            Some("single")
        );
        assert!(extract_follow_up_query(&json!({"follow_up_queries": []})).is_none());
    }

    #[test]
    fn report_assembly_appends_annotated_sources_and_footer() {
        let sources = vec![
            "• An arXiv Paper: https://arxiv.org/abs/2401.1".to_string(),
            "• Some Site: https://example.com/page".to_string(),
        ];
        let report = assemble_final_report("# Title\n\nBody text.".to_string(), &sources);

        assert!(report.contains("### Sources:"));
        assert!(report.contains(
            "* **An arXiv Paper**: https://arxiv.org/abs/2401.1 (Reliability: High - Peer-Reviewed Preprint)"
        ));
        assert!(report
            .contains("* **Some Site**: https://example.com/page (Reliability: Medium - Web Source)"));
        assert!(report.contains("---"));
        assert!(report.contains("automated deep-research pipeline"));
    }

    #[test]
    fn report_assembly_standardizes_existing_header() {
        let generated = "# Title\n\n## Sources\n\n* existing".to_string();
        let report = assemble_final_report(generated, &["• A: https://a".to_string()]);
        assert!(report.contains("### Sources:"));
        // The model already provided a sources section, so nothing is appended.
        assert!(!report.contains("Reliability:"));
    }

    #[test]
    fn tool_source_extraction_handles_nested_shapes() {
        let records = vec![
            ToolRecord {
                tool_name: "arxiv_search".to_string(),
                execution: ToolExecution {
                    success: true,
                    result: json!({
                        "sources": [
                            {"title": "Paper A", "url": "https://arxiv.org/abs/1", "type": "arxiv"}
                        ]
                    }),
                    error: None,
                    duration_ms: 1,
                },
            },
            ToolRecord {
                tool_name: "wrapped".to_string(),
                execution: ToolExecution {
                    success: true,
                    result: json!({
                        "result": {"papers": [{"title": "Paper B", "url": "https://arxiv.org/abs/2"}]}
                    }),
                    error: None,
                    duration_ms: 1,
                },
            },
            ToolRecord {
                tool_name: "failed".to_string(),
                execution: ToolExecution {
                    success: false,
                    result: Value::Null,
                    error: Some("boom".to_string()),
                    duration_ms: 1,
                },
            },
        ];

        let sources = extract_tool_sources(&records);
        assert_eq!(sources.len(), 2);
        assert!(sources[0].contains("Paper A"));
        assert!(sources[1].contains("Paper B"));
    }

    #[tokio::test]
    async fn end_to_end_single_loop_session() {
        let mut server = mockito::Server::new_async().await;
        let _chat = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(canned_chat_body())
            .create_async()
            .await;
        let _search = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results": [{"title": "Quantum Primer", "url": "https://example.com/quantum", "content": "Qubits explained"}]}"#,
            )
            .create_async()
            .await;

        let config = test_config(&server.url(), 1);
        let orchestrator = ResearchOrchestrator::from_config(&config, None).unwrap();
        let session = orchestrator
            .research_session("What is quantum computing?")
            .await
            .unwrap();

        assert_eq!(session.loop_count, 1);
        assert_eq!(session.search_strategy, SearchStrategy::WebSearch);
        assert_eq!(session.web_research_results.len(), 1);
        assert!(session.verification_questions.is_empty());
        assert!(session.verification_results.is_empty());
        assert!(!session.running_summary.is_empty());
        assert!(session.running_summary.contains("### Sources:"));
        assert!(session.running_summary.contains("example.com/quantum"));
    }

    #[tokio::test]
    async fn loop_count_never_exceeds_max_loops() {
        let mut server = mockito::Server::new_async().await;
        // Reflection always asks for more research; the bound must stop it.
        let content = json!({
            "tool_calls": [],
            "query": "follow-up query",
            "verification_questions": [],
            "is_sufficient": false,
            "follow_up_queries": ["keep digging"]
        })
        .to_string();
        let _chat = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"message": {"role": "assistant", "content": content}}).to_string())
            .create_async()
            .await;
        let _search = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"results": [{"title": "T", "url": "https://example.com/t", "content": "c"}]}"#)
            .create_async()
            .await;

        let config = test_config(&server.url(), 2);
        let orchestrator = ResearchOrchestrator::from_config(&config, None).unwrap();
        let session = orchestrator
            .research_session("bounded iteration test")
            .await
            .unwrap();

        assert_eq!(session.loop_count, 2);
        assert!(!session.running_summary.is_empty());
    }

    #[tokio::test]
    async fn direct_url_request_takes_fast_path() {
        let mut server = mockito::Server::new_async().await;
        let _chat = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(canned_chat_body())
            .create_async()
            .await;
        let _page = server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html><head><title>Test Page</title></head><body><p>Quantum facts live here.</p></body></html>")
            .create_async()
            .await;

        let config = test_config(&server.url(), 3);
        let orchestrator = ResearchOrchestrator::from_config(&config, None).unwrap();
        let topic = format!("summarize this {}/page", server.url());
        let session = orchestrator.research_session(&topic).await.unwrap();

        assert_eq!(session.search_strategy, SearchStrategy::UrlFetch);
        assert!(session.input_analysis.is_direct_fetch);
        assert_eq!(session.loop_count, 0);
        // Verification and reflection are never entered on the fast path.
        assert!(session.verification_questions.is_empty());
        assert!(session.verification_results.is_empty());
        assert!(!session.running_summary.is_empty());
    }

    #[tokio::test]
    async fn search_outage_does_not_abort_the_session() {
        let mut server = mockito::Server::new_async().await;
        let _chat = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(canned_chat_body())
            .create_async()
            .await;
        let _search = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let config = test_config(&server.url(), 1);
        let orchestrator = ResearchOrchestrator::from_config(&config, None).unwrap();
        let session = orchestrator
            .research_session("resilience test")
            .await
            .unwrap();

        assert_eq!(session.loop_count, 1);
        assert!(!session.running_summary.is_empty());
    }

    #[tokio::test]
    async fn run_research_surface_returns_report() {
        let mut server = mockito::Server::new_async().await;
        let _chat = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(canned_chat_body())
            .create_async()
            .await;
        let _search = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"results": [{"title": "T", "url": "https://example.com/t", "content": "c"}]}"#)
            .create_async()
            .await;

        let config = test_config(&server.url(), 1);
        let report = run_research("surface test", &config).await.unwrap();
        assert!(!report.is_empty());
    }

    #[tokio::test]
    async fn cancellation_yields_labeled_partial_report() {
        let config = test_config("http://localhost:1", 1);
        let orchestrator = ResearchOrchestrator::from_config(&config, None).unwrap();
        orchestrator.cancellation_token().cancel();

        let report = orchestrator.research("a cancelled topic").await.unwrap();
        assert!(report.contains("Research Cancelled"));
        assert!(report.contains("a cancelled topic"));
    }

    #[tokio::test]
    async fn unreachable_llm_propagates_fatal_error() {
        // Port 1 refuses connections; every LLM call fails, which is the one
        // fatal configuration case.
        let config = test_config("http://127.0.0.1:1", 0);
        let orchestrator = ResearchOrchestrator::from_config(&config, None).unwrap();
        let result = orchestrator.research("unreachable backend").await;
        assert!(result.is_err());
    }
}
