//! Prompt templates for every LLM-consuming step. Each builder returns the
//! fully formatted system prompt; the caller supplies the human message.

/// Current date as "Month DD, YYYY" (UTC), used to bias searches toward
/// recent material.
pub fn current_date() -> String {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    // Civil-date conversion, days-from-epoch form
    let days_since_epoch = (timestamp / 86400) as i64;
    let z = days_since_epoch + 719468;
    let era = (if z >= 0 { z } else { z - 146096 }) / 146097;
    let doe = (z - era * 146097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if m <= 2 { y + 1 } else { y };

    let month_names = [
        "January",
        "February",
        "March",
        "April",
        "May",
        "June",
        "July",
        "August",
        "September",
        "October",
        "November",
        "December",
    ];
    format!("{} {}, {}", month_names[(m - 1) as usize], d, year)
}

pub fn query_writer_prompt(research_topic: &str, date: &str) -> String {
    format!(
        "Your goal is to generate a focused web search query that stays strictly within \
the scope of the original research topic.

Original Research Topic: {research_topic}

Instructions:
- Every query must directly relate to the original research topic above
- Prefer a single focused query covering one specific aspect of the topic
- The query should ensure the most current information is gathered. The current date is {date}
- Do not drift to tangential subjects; if the topic names specific products, people, or \
organizations, keep the focus on those entities

Format your response as a JSON object with these exact keys:
- \"rationale\": brief explanation of why this query is relevant to the original topic
- \"query\": the search query string

Example:
{{\"rationale\": \"Current benchmark data is needed to compare the two systems.\", \
\"query\": \"macOS vs Windows performance benchmarks 2025\"}}

Respond ONLY with the JSON object."
    )
}

pub fn summarizer_prompt(research_topic: &str) -> String {
    format!(
        "You are a research scientist producing a comprehensive running summary for the \
topic: {research_topic}

When creating a NEW summary:
1. Highlight the most relevant information from the search results
2. Write coherent, flowing paragraphs that build understanding systematically

When EXTENDING an existing summary:
1. Compare the new information with the existing summary
2. Integrate related new information into the relevant paragraphs
3. Add genuinely new but relevant information as new paragraphs
4. Skip anything unrelated to the user's topic
5. Ensure the final output differs from the input summary

Guidelines:
- Write in prose paragraphs, not bullet fragments
- Include concrete details, metrics, and examples where the sources provide them
- Do not make up information; only use what appears in the provided material
- Start directly with the summary, without preamble, titles, or XML tags"
    )
}

pub fn reflection_prompt(research_topic: &str, summaries: &str) -> String {
    format!(
        "You are an expert research assistant analyzing summaries about \"{research_topic}\".

Instructions:
- Identify knowledge gaps or areas needing deeper exploration WITHIN the original topic scope
- If the summaries are sufficient to answer the user's question, do not generate a follow-up query
- Any follow-up query must be self-contained, web-searchable, and directly related to: {research_topic}

Format your response as a JSON object with these exact keys:
- \"is_sufficient\": true or false
- \"knowledge_gap\": what information about the original topic is missing
- \"follow_up_queries\": a list with one specific question addressing the gap

Example:
{{\"is_sufficient\": false, \"knowledge_gap\": \"No coverage of energy costs\", \
\"follow_up_queries\": [\"quantum computer energy consumption 2025\"]}}

Summaries:
{summaries}"
    )
}

pub fn report_prompt(research_topic: &str, date: &str, research_loop_count: usize) -> String {
    format!(
        "You are an expert research analyst writing a professional research report.

Research Topic: {research_topic}
Current Date: {date}
Research Loops Completed: {research_loop_count}

Requirements:
1. Start with a descriptive report title as an H1 header (# Title)
2. Use ## for main sections: Executive Summary, Key Findings & Analysis, Technical \
Details, Current Developments, Implications & Recommendations, Research Methodology
3. Support claims with the provided material and mark confidence naturally in the text: \
\"confirmed by multiple sources\", \"according to [source]\", \"preliminary evidence \
suggests\", \"conflicting reports indicate\"
4. End with a \"### Sources:\" section listing each source as \
* **Source Title**: URL (Reliability: High/Medium/Low - Source Type)
5. Go beyond summarizing: provide analysis, implications, and actionable recommendations

The final document should read as a report suitable for technical audiences."
    )
}

pub fn verification_questions_prompt(research_topic: &str, current_summary: &str) -> String {
    format!(
        "You are an expert fact-checker generating verification questions for research findings.

Generate 3-5 specific verification questions that would help validate key claims in the \
summary below. Focus on factual claims that can be independently verified through web \
search; prioritize the most important or controversial statements; avoid trivial questions.

Format your response as a JSON object:
{{\"verification_questions\": [\"question 1\", \"question 2\", \"question 3\"]}}

Research Topic: {research_topic}
Current Summary:
{current_summary}"
    )
}

pub fn verification_synthesis_prompt(research_topic: &str, summary_length: usize) -> String {
    format!(
        "You are a research analyst synthesizing findings with verification results.

Update the research summary by incorporating the verification results: correct claims \
contradicted by verification, add important information discovered during verification, \
and present multiple perspectives when sources disagree.

For each key claim, attach a confidence indicator naturally within the text:
- \"confirmed by multiple sources\" for strong verification
- \"according to [source]\" for single-source claims
- \"preliminary evidence suggests\" for weak evidence
- \"conflicting reports indicate\" for contradictory evidence

Maintain the original structure and flow of the summary.

Research Topic: {research_topic}
Original Summary Length: {summary_length} characters"
    )
}

pub fn tool_selection_prompt(research_topic: &str, running_summary: &str, catalog: &str) -> String {
    let context = if running_summary.is_empty() {
        "Starting fresh research"
    } else {
        running_summary
    };
    format!(
        "You are a research assistant with access to tools. Your task is to gather \
comprehensive information about: {research_topic}

Available tools:
{catalog}

Guidance:
- Use 'web_search' for general information, current events, news, and factual queries
- Use 'arxiv_search' ONLY for research papers, scientific studies, and academic topics
- Be selective: do not use arxiv_search for basic factual questions
- For simple greetings or non-research input, use no tools

Current research context: {context}

Respond with a JSON object in this exact format:
{{\"tool_calls\": [{{\"name\": \"tool_name\", \"arguments\": {{\"param\": \"value\"}}}}]}}

Examples:
- Research question: {{\"tool_calls\": [{{\"name\": \"web_search\", \"arguments\": \
{{\"query\": \"quantum computing research\", \"max_results\": 3}}}}]}}
- No tools needed: {{\"tool_calls\": []}}

Respond ONLY with the JSON object, no other text."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_date_is_formatted() {
        let date = current_date();
        // "Month DD, YYYY"
        assert!(date.contains(", 2"));
        let month = date.split(' ').next().unwrap();
        assert!([
            "January",
            "February",
            "March",
            "April",
            "May",
            "June",
            "July",
            "August",
            "September",
            "October",
            "November",
            "December"
        ]
        .contains(&month));
    }

    #[test]
    fn prompts_embed_the_topic() {
        let topic = "perovskite solar cells";
        assert!(query_writer_prompt(topic, "May 1, 2025").contains(topic));
        assert!(summarizer_prompt(topic).contains(topic));
        assert!(reflection_prompt(topic, "summary").contains(topic));
        assert!(report_prompt(topic, "May 1, 2025", 2).contains(topic));
        assert!(verification_questions_prompt(topic, "summary").contains(topic));
        assert!(verification_synthesis_prompt(topic, 100).contains("100 characters"));
        assert!(tool_selection_prompt(topic, "", "- web_search").contains(topic));
    }
}
