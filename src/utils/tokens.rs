// src/utils/tokens.rs
// Token counting with a BPE encoder and a deterministic fallback

use once_cell::sync::Lazy;
use tiktoken_rs::{CoreBPE, cl100k_base};

static TOKENIZER: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

/// Deterministic, thread-safe token counter.
///
/// Uses the cl100k_base BPE when the encoder initializes; otherwise falls
/// back to `ceil(bytes / 4)`. Both paths are pure functions of the input,
/// so counts are stable across calls and threads. No I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter;

impl TokenCounter {
    pub fn new() -> Self {
        Self
    }

    /// Count tokens in `text`. Empty text counts as zero.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match TOKENIZER.as_ref() {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len().div_ceil(4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(TokenCounter::new().count(""), 0);
    }

    #[test]
    fn test_nonempty_is_positive() {
        let counter = TokenCounter::new();
        assert!(counter.count("a") >= 1);
        assert!(counter.count("hello world") >= 2);
    }

    #[test]
    fn test_deterministic() {
        let counter = TokenCounter::new();
        let text = "fn main() { println!(\"memory service\"); }";
        assert_eq!(counter.count(text), counter.count(text));
    }

    #[test]
    fn test_monotonic_in_repetition() {
        let counter = TokenCounter::new();
        let once = counter.count("binary search algorithm ");
        let four = counter.count(&"binary search algorithm ".repeat(4));
        assert!(four > once);
    }
}
