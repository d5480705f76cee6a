//! Text normalization helpers shared by matching, hashing and id derivation

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "into", "is",
    "it", "of", "on", "or", "the", "to", "use", "using", "with", "your",
];

/// Lowercase, alphanumeric-only, single-spaced form used for title comparison
pub fn normalize_title(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collapse every whitespace run into a single space and trim
///
/// Digests are computed over this form so that reflowed text does not count as an edit.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// URL/id-safe slug: `Configure Azure Files!` → `configure-azure-files`
pub fn slugify(text: &str) -> String {
    normalize_title(text).replace(' ', "-")
}

/// Significant tokens (stopwords and one-letter tokens removed)
pub fn significant_tokens(text: &str) -> HashSet<String> {
    normalize_title(text)
        .split(' ')
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}
