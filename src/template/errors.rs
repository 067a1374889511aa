//! Template error types and typo suggestions

use thiserror::Error;

/// Template evaluation errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Expression could not be parsed
    #[error("syntax error in '{expression}': {message}")]
    SyntaxError { expression: String, message: String },

    /// Expression parsed but failed to evaluate
    #[error("expression error in '{expression}': {message}")]
    ExpressionError { expression: String, message: String },
}

impl TemplateError {
    /// Create a syntax error
    pub fn syntax(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SyntaxError {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Create an expression error
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExpressionError {
            expression: expression.into(),
            message: message.into(),
        }
    }
}

/// Suggest a correction for a typo using Levenshtein distance
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let mut best_match = None;
    let mut best_distance = usize::MAX;
    let max_distance = (typo.len() / 2).max(2); // Allow up to half the length in edits

    for candidate in candidates {
        let distance = levenshtein_distance(typo, candidate);
        if distance < best_distance && distance <= max_distance {
            best_distance = distance;
            best_match = Some(candidate.to_string());
        }
    }

    best_match
}

/// Calculate Levenshtein distance between two strings
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    // Single rolling row instead of the full matrix
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0usize; b_chars.len() + 1];

    for (i, ca) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("research-step", "reserch-step"), 1);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("abc", ""), 3);
        assert_eq!(levenshtein_distance("same", "same"), 0);
    }

    #[test]
    fn test_suggest_correction() {
        let candidates = ["research-step", "analysis-step", "summary-step"];

        assert_eq!(
            suggest_correction("analysys-step", &candidates),
            Some("analysis-step".into())
        );
        assert_eq!(suggest_correction("completely_different", &candidates), None);
        assert_eq!(suggest_correction("anything", &[]), None);
    }

    #[test]
    fn test_error_display() {
        let err = TemplateError::syntax("steps.a >", "unexpected end of input");
        let msg = err.to_string();
        assert!(msg.contains("syntax error"));
        assert!(msg.contains("steps.a >"));
    }
}
