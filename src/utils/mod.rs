// src/utils/mod.rs
// Shared utilities: token counting, text processing, caching, cost tracking

pub mod cache;
pub mod cost;
pub mod text;
pub mod tokens;

use sha2::{Digest, Sha256};

/// First 16 hex chars of the SHA-256 of the input - the cache-key shape
/// used across the embedding, search and fusion caches.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Truncate a string at a char boundary, appending an ellipsis when cut.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_stable() {
        assert_eq!(short_hash("hello"), short_hash("hello"));
        assert_ne!(short_hash("hello"), short_hash("world"));
        assert_eq!(short_hash("hello").len(), 16);
    }

    #[test]
    fn test_truncate_chars_multibyte_safe() {
        let s = "记忆管理服务";
        assert_eq!(truncate_chars(s, 10), s);
        assert_eq!(truncate_chars(s, 3), "记忆管...");
    }
}
