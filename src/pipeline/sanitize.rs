//! Helpers for normalizing document metadata.

use std::collections::HashSet;

/// Category assigned when a document does not supply one.
pub const DEFAULT_CATEGORY: &str = "general";

/// Trim whitespace and drop empty strings.
pub(crate) fn sanitize_string(value: Option<String>) -> Option<String> {
    value.and_then(|input| {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Normalize a category, falling back to [`DEFAULT_CATEGORY`].
pub fn sanitize_category(value: Option<String>) -> String {
    sanitize_string(value)
        .map(|category| category.to_lowercase())
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
}

/// Trim, lower-case and dedupe tags, dropping empties. Order of first appearance is kept.
pub fn sanitize_tags(values: Vec<String>) -> Vec<String> {
    let mut unique = HashSet::new();
    let mut sanitized = Vec::new();
    for tag in values {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_lowercase();
        if unique.insert(lower.clone()) {
            sanitized.push(lower);
        }
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_trims_and_defaults() {
        assert_eq!(sanitize_category(Some("  Web ".into())), "web");
        assert_eq!(sanitize_category(Some("   ".into())), DEFAULT_CATEGORY);
        assert_eq!(sanitize_category(None), DEFAULT_CATEGORY);
    }

    #[test]
    fn tags_are_uniquified_and_trimmed() {
        let tags = sanitize_tags(vec![
            "SQL".into(),
            " injection".into(),
            "sql".into(),
            "".into(),
        ]);
        assert_eq!(tags, vec!["sql".to_string(), "injection".to_string()]);
    }

    #[test]
    fn sanitize_string_drops_blank_values() {
        assert_eq!(sanitize_string(Some(" notes ".into())), Some("notes".into()));
        assert!(sanitize_string(Some("\n".into())).is_none());
    }
}
