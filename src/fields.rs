//! Heuristic extraction of searchable field names from a rule query.
//!
//! This is deliberately not a query-language-aware parser: two token
//! patterns are enough to surface the fields a rule touches, and false
//! positives are acceptable supplementary metadata.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Upper bound on extracted field names per rule.
const MAX_FIELDS: usize = 20;

/// Dotted-path identifiers: `process.name`, `event.action`, `host.os.family`.
static DOTTED_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9_]+(?:\.[A-Za-z0-9_-]+)+\b").unwrap());

/// Bareword keys immediately followed by a colon: `message:`, `port:`.
static KEY_COLON: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Za-z0-9_.]+:").unwrap());

/// Extract up to [`MAX_FIELDS`] candidate field names from query text.
///
/// Deterministic for a given input: matches are collected in pattern order,
/// then insertion order, with duplicates, whitespace-bearing tokens, and
/// tokens shorter than 3 characters discarded.
pub fn extract_fields(query: &str) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<String> = Vec::new();

    let candidates = DOTTED_PATH
        .find_iter(query)
        .chain(KEY_COLON.find_iter(query))
        .map(|m| m.as_str().trim_end_matches(':').to_string());

    for candidate in candidates {
        if out.len() >= MAX_FIELDS {
            break;
        }
        if candidate.len() < 3 || candidate.chars().any(char::is_whitespace) {
            continue;
        }
        if seen.insert(candidate.clone()) {
            out.push(candidate);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_paths_extracted() {
        let fields = extract_fields(r#"process.name : "cmd.exe" and host.os.family : "windows""#);
        assert!(fields.contains(&"process.name".to_string()));
        assert!(fields.contains(&"host.os.family".to_string()));
    }

    #[test]
    fn test_colon_keys_extracted() {
        let fields = extract_fields("message: failed and source_port: 22");
        assert!(fields.contains(&"message".to_string()));
        assert!(fields.contains(&"source_port".to_string()));
    }

    #[test]
    fn test_short_tokens_dropped() {
        let fields = extract_fields("id: 4 and ab: x");
        assert!(!fields.contains(&"id".to_string()));
        assert!(!fields.contains(&"ab".to_string()));
    }

    #[test]
    fn test_no_whitespace_and_no_trailing_colon() {
        let fields = extract_fields("user.name: root and event.category: process");
        for f in &fields {
            assert!(!f.contains(char::is_whitespace), "whitespace in {:?}", f);
            assert!(!f.ends_with(':'), "trailing colon in {:?}", f);
        }
    }

    #[test]
    fn test_deduplicated() {
        let fields = extract_fields("process.name : a or process.name : b");
        assert_eq!(
            fields.iter().filter(|f| *f == "process.name").count(),
            1
        );
    }

    #[test]
    fn test_capped_at_twenty() {
        let query: String = (0..40)
            .map(|i| format!("category{i}.field{i} : {i}"))
            .collect::<Vec<_>>()
            .join(" and ");
        let fields = extract_fields(&query);
        assert_eq!(fields.len(), 20);
    }

    #[test]
    fn test_empty_query() {
        assert!(extract_fields("").is_empty());
    }
}
