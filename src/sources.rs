use std::collections::HashSet;

use crate::search::SearchResult;

/// Merge search results into a formatted context block, keeping the first
/// occurrence per URL in encounter order. Content is truncated to
/// `max_chars_per_source` with an explicit marker. When `fetch_full_page` is
/// set and raw page content is present it is preferred over the snippet.
pub fn deduplicate_and_format_sources(
    results: &[SearchResult],
    max_chars_per_source: usize,
    fetch_full_page: bool,
) -> String {
    let mut seen_urls: HashSet<&str> = HashSet::new();
    let mut formatted = String::from("Sources:\n\n");

    for source in results {
        if !seen_urls.insert(source.url.as_str()) {
            continue;
        }

        formatted.push_str(&format!("Source: {}\n===\n", source.title));

        let content = if fetch_full_page {
            source
                .raw_content
                .as_deref()
                .filter(|c| !c.is_empty())
                .unwrap_or(&source.content)
        } else {
            &source.content
        };

        if content.len() > max_chars_per_source {
            let mut cut = max_chars_per_source;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            formatted.push_str(&content[..cut]);
            formatted.push_str("...");
        } else {
            formatted.push_str(content);
        }
        formatted.push_str("\n\n");
    }

    formatted
}

/// Bullet list of `title: url` pairs for the citations section.
pub fn format_sources(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No sources found.".to_string();
    }
    results
        .iter()
        .map(|source| format!("• {}: {}", source.title, source.url))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Line-level deduplication across the whole session: per-iteration source
/// blocks are concatenated over time, so the same `title: url` line can
/// recur. First-seen order is preserved.
pub fn dedupe_source_lines<'a, I>(blocks: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: HashSet<&str> = HashSet::new();
    let mut unique = Vec::new();
    for block in blocks {
        for line in block.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed == "No sources found." {
                continue;
            }
            if seen.insert(line) {
                unique.push(line.to_string());
            }
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(title: &str, url: &str, content: &str) -> SearchResult {
        SearchResult {
            title: title.to_string(),
            url: url.to_string(),
            content: content.to_string(),
            raw_content: None,
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let results = vec![
            result("First A", "https://a", "content a1"),
            result("B", "https://b", "content b"),
            result("Second A", "https://a", "content a2"),
        ];
        let formatted = deduplicate_and_format_sources(&results, 1000, false);

        assert_eq!(formatted.matches("https://a").count(), 0); // URLs not in body
        assert_eq!(formatted.matches("Source: First A").count(), 1);
        assert_eq!(formatted.matches("Source: Second A").count(), 0);
        assert_eq!(formatted.matches("Source: B").count(), 1);

        let a_pos = formatted.find("First A").unwrap();
        let b_pos = formatted.find("Source: B").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn content_is_truncated_with_marker() {
        let results = vec![result("Long", "https://long", &"x".repeat(500))];
        let formatted = deduplicate_and_format_sources(&results, 100, false);
        assert!(formatted.contains(&format!("{}...", "x".repeat(100))));
        assert!(!formatted.contains(&"x".repeat(101)));
    }

    #[test]
    fn raw_content_preferred_when_fetching_full_pages() {
        let mut source = result("Page", "https://p", "snippet");
        source.raw_content = Some("full page text".to_string());
        let formatted = deduplicate_and_format_sources(&[source.clone()], 1000, true);
        assert!(formatted.contains("full page text"));

        let snippet_only = deduplicate_and_format_sources(&[source], 1000, false);
        assert!(snippet_only.contains("snippet"));
        assert!(!snippet_only.contains("full page text"));
    }

    #[test]
    fn empty_raw_content_falls_back_to_snippet() {
        let mut source = result("Page", "https://p", "snippet");
        source.raw_content = Some(String::new());
        let formatted = deduplicate_and_format_sources(&[source], 1000, true);
        assert!(formatted.contains("snippet"));
    }

    #[test]
    fn bullet_list_formatting() {
        let results = vec![
            result("Rust", "https://rust-lang.org", ""),
            result("Book", "https://doc.rust-lang.org", ""),
        ];
        let formatted = format_sources(&results);
        assert_eq!(
            formatted,
            "• Rust: https://rust-lang.org\n• Book: https://doc.rust-lang.org"
        );
        assert_eq!(format_sources(&[]), "No sources found.");
    }

    #[test]
    fn session_level_line_dedup() {
        let block_one = "• Rust: https://rust-lang.org\n• Book: https://doc.rust-lang.org";
        let block_two = "• Rust: https://rust-lang.org\n• Nomicon: https://doc.rust-lang.org/nomicon";
        let unique = dedupe_source_lines([block_one, block_two]);
        assert_eq!(unique.len(), 3);
        assert_eq!(unique[0], "• Rust: https://rust-lang.org");
        assert_eq!(unique[2], "• Nomicon: https://doc.rust-lang.org/nomicon");
    }
}
