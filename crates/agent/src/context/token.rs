//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. This
//! approximation is accurate within ~10% for BPE tokenizers on English
//! text. The session rotation threshold uses provider-reported usage
//! instead; this estimator only shapes per-layer context budgets, so a
//! deployment can swap the counter here without touching the builder.

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Truncate text to roughly `budget` tokens, cutting on a char boundary
/// so the result is always valid UTF-8. Keeps the head of the text.
pub fn truncate_to_tokens(text: &str, budget: usize) -> &str {
    let max_bytes = budget.saturating_mul(4);
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn truncate_within_budget_is_identity() {
        assert_eq!(truncate_to_tokens("short", 10), "short");
    }

    #[test]
    fn truncate_keeps_head() {
        let text = "a".repeat(100);
        let cut = truncate_to_tokens(&text, 5);
        assert_eq!(cut.len(), 20);
    }

    #[test]
    fn truncate_never_splits_multibyte() {
        // 'ğ' is 2 bytes; a budget landing mid-char must back off
        let text = "ğğğğğğğğğğ"; // 20 bytes
        let cut = truncate_to_tokens(text, 3); // 12 bytes → boundary at 12
        assert!(cut.len() <= 12);
        assert!(std::str::from_utf8(cut.as_bytes()).is_ok());
    }
}
