//! Progressive search/replace matching (§4.J-patch), shared by `patch_file`
//! and `multi_edit`. Strategies are tried in order; the first that matches
//! wins.

use strsim::normalized_levenshtein;

const FUZZY_THRESHOLD: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    Exact,
    TrimmedLineEndings,
    WhitespaceNormalized,
    Fuzzy,
}

#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
    pub match_method: Option<MatchMethod>,
}

/// Apply one `search` → `replace` edit to `document`, trying exact,
/// trimmed-line-ending, whitespace-normalized, then fuzzy matching in turn.
pub fn apply_search_replace(document: &str, search: &str, replace: &str) -> PatchOutcome {
    if let Some(content) = exact_match(document, search, replace) {
        return PatchOutcome { success: true, content, error: None, match_method: Some(MatchMethod::Exact) };
    }
    if let Some(content) = trimmed_line_endings_match(document, search, replace) {
        return PatchOutcome {
            success: true,
            content,
            error: None,
            match_method: Some(MatchMethod::TrimmedLineEndings),
        };
    }
    if let Some(content) = whitespace_normalized_match(document, search, replace) {
        return PatchOutcome {
            success: true,
            content,
            error: None,
            match_method: Some(MatchMethod::WhitespaceNormalized),
        };
    }
    if let Some(content) = fuzzy_match(document, search, replace) {
        return PatchOutcome { success: true, content, error: None, match_method: Some(MatchMethod::Fuzzy) };
    }
    PatchOutcome {
        success: false,
        content: document.to_string(),
        error: Some(format!(
            "no match found for search text (first 100 chars): {}",
            search.chars().take(100).collect::<String>()
        )),
        match_method: None,
    }
}

fn exact_match(document: &str, search: &str, replace: &str) -> Option<String> {
    if document.contains(search) {
        Some(document.replacen(search, replace, 1))
    } else {
        None
    }
}

fn trimmed_line_endings_match(document: &str, search: &str, replace: &str) -> Option<String> {
    let doc_lines: Vec<&str> = document.lines().collect();
    let search_lines: Vec<String> = search.lines().map(|l| l.trim_end().to_string()).collect();
    if search_lines.is_empty() {
        return None;
    }
    let n = search_lines.len();
    for start in 0..=doc_lines.len().saturating_sub(n) {
        let window: Vec<String> = doc_lines[start..start + n].iter().map(|l| l.trim_end().to_string()).collect();
        if window == search_lines {
            let mut rebuilt_lines: Vec<String> = doc_lines.iter().map(|l| l.to_string()).collect();
            let replace_lines: Vec<&str> = replace.lines().collect();
            rebuilt_lines.splice(start..start + n, replace_lines.iter().map(|l| l.to_string()));
            return Some(rebuilt_lines.join("\n"));
        }
    }
    None
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn whitespace_normalized_match(document: &str, search: &str, replace: &str) -> Option<String> {
    let doc_lines: Vec<&str> = document.lines().collect();
    let n = search.lines().count().max(1);
    let normalized_search = normalize_whitespace(search);

    for window_len in [n.saturating_sub(1).max(1), n, n + 2] {
        if window_len == 0 || window_len > doc_lines.len() {
            continue;
        }
        for start in 0..=doc_lines.len() - window_len {
            let window = doc_lines[start..start + window_len].join("\n");
            if normalize_whitespace(&window) == normalized_search {
                let mut rebuilt_lines: Vec<String> = doc_lines.iter().map(|l| l.to_string()).collect();
                let replace_lines: Vec<&str> = replace.lines().collect();
                rebuilt_lines.splice(start..start + window_len, replace_lines.iter().map(|l| l.to_string()));
                return Some(rebuilt_lines.join("\n"));
            }
        }
    }
    None
}

fn fuzzy_match(document: &str, search: &str, replace: &str) -> Option<String> {
    let doc_lines: Vec<&str> = document.lines().collect();
    let n = search.lines().count().max(1);
    if n > doc_lines.len() {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for start in 0..=doc_lines.len() - n {
        let window = doc_lines[start..start + n].join("\n");
        let ratio = normalized_levenshtein(&window, search);
        if best.map(|(_, best_ratio)| ratio > best_ratio).unwrap_or(true) {
            best = Some((start, ratio));
        }
    }

    let (start, ratio) = best?;
    if ratio < FUZZY_THRESHOLD {
        return None;
    }
    let mut rebuilt_lines: Vec<String> = doc_lines.iter().map(|l| l.to_string()).collect();
    let replace_lines: Vec<&str> = replace.lines().collect();
    rebuilt_lines.splice(start..start + n, replace_lines.iter().map(|l| l.to_string()));
    Some(rebuilt_lines.join("\n"))
}

#[derive(Debug, Clone)]
pub struct Edit {
    pub search: String,
    pub replace: String,
}

#[derive(Debug, Clone)]
pub struct MultiEditOutcome {
    pub success: bool,
    pub content: String,
    pub applied_edits: usize,
    pub failed_index: Option<usize>,
    pub error: Option<String>,
}

/// Thread edit _k_'s output into edit _k+1_'s input; on the first failure,
/// stop and report how many edits had already succeeded (§8 invariant 5).
pub fn apply_multi_edit(document: &str, edits: &[Edit]) -> MultiEditOutcome {
    let mut content = document.to_string();
    for (index, edit) in edits.iter().enumerate() {
        let outcome = apply_search_replace(&content, &edit.search, &edit.replace);
        if !outcome.success {
            return MultiEditOutcome {
                success: false,
                content,
                applied_edits: index,
                failed_index: Some(index),
                error: outcome.error,
            };
        }
        content = outcome.content;
    }
    MultiEditOutcome {
        success: true,
        content,
        applied_edits: edits.len(),
        failed_index: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_replaces_first_occurrence() {
        let outcome = apply_search_replace("fn a() {}\nfn a() {}", "fn a() {}", "fn b() {}");
        assert!(outcome.success);
        assert_eq!(outcome.match_method, Some(MatchMethod::Exact));
        assert_eq!(outcome.content, "fn b() {}\nfn a() {}");
    }

    #[test]
    fn trimmed_line_endings_tolerates_trailing_whitespace() {
        let document = "fn a() {  \n    1 + 1  \n}";
        let search = "fn a() {\n    1 + 1\n}";
        let outcome = apply_search_replace(document, search, "fn a() {\n    2 + 2\n}");
        assert!(outcome.success);
        assert_eq!(outcome.match_method, Some(MatchMethod::TrimmedLineEndings));
        assert!(outcome.content.contains("2 + 2"));
    }

    #[test]
    fn whitespace_normalized_tolerates_reindentation() {
        let document = "fn a() {\n        1   +   1\n}";
        let search = "fn a() {\n    1 + 1\n}";
        let outcome = apply_search_replace(document, search, "fn a() {\n    2 + 2\n}");
        assert!(outcome.success);
        assert_eq!(outcome.match_method, Some(MatchMethod::WhitespaceNormalized));
    }

    #[test]
    fn fuzzy_matches_near_identical_blocks_above_threshold() {
        let document = "fn compute(x: i32) -> i32 {\n    return x * 2;\n}";
        let search = "fn compute(x: i32) -> i32 {\n    return x * 2\n}";
        let outcome = apply_search_replace(document, search, "fn compute(x: i32) -> i32 {\n    return x * 3;\n}");
        assert!(outcome.success);
        assert!(matches!(
            outcome.match_method,
            Some(MatchMethod::WhitespaceNormalized) | Some(MatchMethod::Fuzzy)
        ));
        assert!(outcome.content.contains("x * 3"));
    }

    #[test]
    fn below_threshold_fails_with_no_match_error() {
        let outcome = apply_search_replace("completely unrelated content here", "totally different text block", "x");
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn replacement_text_always_appears_in_successful_output() {
        let document = "line one\nline two\nline three";
        let outcome = apply_search_replace(document, "line two", "the replacement");
        assert!(outcome.content.contains("the replacement"));
    }

    #[test]
    fn multi_edit_applies_sequentially_and_threads_output() {
        let document = "a\nb\nc";
        let edits = vec![
            Edit { search: "a".to_string(), replace: "x".to_string() },
            Edit { search: "b".to_string(), replace: "y".to_string() },
        ];
        let outcome = apply_multi_edit(document, &edits);
        assert!(outcome.success);
        assert_eq!(outcome.content, "x\ny\nc");
        assert_eq!(outcome.applied_edits, 2);
    }

    #[test]
    fn multi_edit_reports_failure_index_and_partial_progress() {
        let document = "a\nb\nc";
        let edits = vec![
            Edit { search: "a".to_string(), replace: "x".to_string() },
            Edit { search: "nonexistent text".to_string(), replace: "y".to_string() },
            Edit { search: "c".to_string(), replace: "z".to_string() },
        ];
        let outcome = apply_multi_edit(document, &edits);
        assert!(!outcome.success);
        assert_eq!(outcome.applied_edits, 1);
        assert_eq!(outcome.failed_index, Some(1));
    }
}
