use once_cell::sync::Lazy;
use regex::Regex;

static LIST_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-*•]+|\(?\d+[.):]|Q\d+[.):]|#+)\s*")
        .expect("invalid list marker regex")
});

/// Cut `text` to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Turn a generated list (one item per line) into clean question texts.
///
/// List markers and surrounding quotes are removed, blank lines and lead-in
/// lines ending in `:` dropped, and at most `limit` entries returned in
/// generation order.
pub fn parse_question_list(raw: &str, limit: usize) -> Vec<String> {
    raw.lines()
        .map(|line| {
            let stripped = LIST_MARKER.replace(line, "");
            stripped
                .trim()
                .trim_matches(|c| c == '"' || c == '\'' || c == '*')
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty() && !line.ends_with(':'))
        .take(limit)
        .collect()
}
