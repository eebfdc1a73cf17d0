// src/utils/text.rs
// Text cleaning, normalization, keyword extraction and chunking

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use super::tokens::TokenCounter;

static HTML_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
static URLS: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").expect("static regex"));
static EMAILS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("static regex")
});
static REPEATED_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([.!?]){2,}").expect("static regex"));
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").expect("static regex"));
static NEWLINE_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*(\n[ \t]*)+").expect("static regex"));
static WORDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("static regex"));
static SENTENCES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?。！？]+").expect("static regex"));

static STOPWORDS_EN: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does",
        "did", "will", "would", "could", "should", "may", "might", "can", "this", "that", "these",
        "those",
    ]
    .into_iter()
    .collect()
});

static STOPWORDS_ZH: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "的", "了", "在", "是", "我", "有", "和", "就", "不", "人", "都", "一", "他", "她", "它",
        "们", "这", "那", "与", "为", "上", "下", "中", "而",
    ]
    .into_iter()
    .collect()
});

/// Text processor - cleaning, quality checks, keyword extraction, chunking.
///
/// All operations are pure; `normalize` is idempotent
/// (`normalize(normalize(x)) == normalize(x)`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TextProcessor {
    counter: TokenCounter,
}

impl TextProcessor {
    pub fn new() -> Self {
        Self {
            counter: TokenCounter::new(),
        }
    }

    /// Clean and normalize text: NFKC, strip HTML tags / URLs / emails,
    /// collapse whitespace runs, limit consecutive newlines to two, trim.
    pub fn normalize(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let text: String = text.nfkc().collect();
        let text = HTML_TAGS.replace_all(&text, "");
        let text = URLS.replace_all(&text, "");
        let text = EMAILS.replace_all(&text, "");
        let text = REPEATED_PUNCT.replace_all(&text, "$1");
        let text = BLANK_RUNS.replace_all(&text, " ");
        let text = NEWLINE_RUNS.replace_all(&text, "\n\n");

        // Trim trailing blanks per line, then the whole string
        text.lines()
            .map(|l| l.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Count tokens (delegates to TokenCounter).
    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Quality gate: reject degenerate content.
    ///
    /// False when the normalized text is shorter than 5 chars, dominated by
    /// one repeated character (>30%), mostly digits (>50%), mostly
    /// punctuation (>30%), or carries no meaningful word outside the
    /// stop-set.
    pub fn is_meaningful(&self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.chars().count() < 5 {
            return false;
        }

        let lower = trimmed.to_lowercase();
        if self.has_too_many_repeats(&lower)
            || self.has_too_many_digits(&lower)
            || self.has_too_many_special_chars(&lower)
        {
            return false;
        }

        self.contains_meaningful_words(&lower)
    }

    fn has_too_many_repeats(&self, text: &str) -> bool {
        let total = text.chars().count();
        if total < 10 {
            return false;
        }

        let mut char_counts: HashMap<char, usize> = HashMap::new();
        for c in text.chars().filter(|c| c.is_alphanumeric()) {
            *char_counts.entry(c).or_insert(0) += 1;
        }
        if let Some(max) = char_counts.values().max() {
            if *max as f64 / total as f64 > 0.3 {
                return true;
            }
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() > 1 {
            let mut word_counts: HashMap<&str, usize> = HashMap::new();
            for w in words.iter().filter(|w| w.chars().count() > 2) {
                *word_counts.entry(*w).or_insert(0) += 1;
            }
            if let Some(max) = word_counts.values().max() {
                if *max as f64 / words.len() as f64 > 0.3 {
                    return true;
                }
            }
        }

        false
    }

    fn has_too_many_digits(&self, text: &str) -> bool {
        let total = text.chars().count();
        if total == 0 {
            return false;
        }
        let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
        digits as f64 / total as f64 > 0.5
    }

    fn has_too_many_special_chars(&self, text: &str) -> bool {
        let total = text.chars().count();
        if total == 0 {
            return false;
        }
        let special = text
            .chars()
            .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
            .count();
        special as f64 / total as f64 > 0.3
    }

    fn contains_meaningful_words(&self, text: &str) -> bool {
        let words: Vec<&str> = WORDS.find_iter(text).map(|m| m.as_str()).collect();
        if words.is_empty() {
            return false;
        }
        let meaningful = words
            .iter()
            .filter(|w| w.chars().count() > 2 && !STOPWORDS_EN.contains(**w))
            .count();
        meaningful as f64 / words.len() as f64 > 0.1
    }

    /// Extract up to `max_keywords` keywords ordered by descending frequency.
    ///
    /// Only alphanumeric tokens longer than two chars outside the English
    /// and CJK stop-sets qualify. Ties break by first occurrence.
    pub fn extract_keywords(&self, text: &str, max_keywords: usize) -> Vec<String> {
        if text.is_empty() || max_keywords == 0 {
            return Vec::new();
        }

        let lower = text.to_lowercase();
        let mut freq: HashMap<&str, usize> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();

        for m in WORDS.find_iter(&lower) {
            let word = m.as_str();
            if word.chars().count() <= 2
                || STOPWORDS_EN.contains(word)
                || STOPWORDS_ZH.contains(word)
            {
                continue;
            }
            let entry = freq.entry(word).or_insert(0);
            if *entry == 0 {
                order.push(word);
            }
            *entry += 1;
        }

        let mut ranked: Vec<(usize, &str)> = order
            .iter()
            .enumerate()
            .map(|(i, w)| (i, *w))
            .collect();
        ranked.sort_by(|(ia, wa), (ib, wb)| freq[wb].cmp(&freq[wa]).then(ia.cmp(ib)));

        ranked
            .into_iter()
            .take(max_keywords)
            .map(|(_, w)| w.to_string())
            .collect()
    }

    /// Truncate text to at most `max_tokens`, keeping whole sentences when
    /// `preserve_sentences` is set, otherwise char-proportionally.
    pub fn truncate_to_tokens(
        &self,
        text: &str,
        max_tokens: usize,
        preserve_sentences: bool,
    ) -> String {
        if text.is_empty() || self.count_tokens(text) <= max_tokens {
            return text.to_string();
        }

        if preserve_sentences {
            let mut result = String::new();
            for sentence in SENTENCES.split(text) {
                let sentence = sentence.trim();
                if sentence.is_empty() {
                    continue;
                }
                let candidate = format!("{}{}. ", result, sentence);
                if self.count_tokens(&candidate) > max_tokens {
                    break;
                }
                result = candidate;
            }
            result.trim().to_string()
        } else {
            // 1 token is roughly 4 chars
            text.chars().take(max_tokens * 4).collect()
        }
    }

    /// Split text into chunks of at most `max_chunk_tokens`, paragraph-first
    /// then sentence-first, with an optional token-overlap prefix taken from
    /// the tail of the previous chunk.
    pub fn split_into_chunks(
        &self,
        text: &str,
        max_chunk_tokens: usize,
        overlap_tokens: usize,
    ) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        if self.count_tokens(text) <= max_chunk_tokens {
            return vec![text.to_string()];
        }

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for paragraph in text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            let para_tokens = self.count_tokens(paragraph);

            if para_tokens > max_chunk_tokens {
                // Oversized paragraph: flush and split by sentence
                if !current.is_empty() {
                    chunks.push(current.trim().to_string());
                    current.clear();
                    current_tokens = 0;
                }
                for sentence in SENTENCES.split(paragraph) {
                    let sentence = sentence.trim();
                    if sentence.is_empty() {
                        continue;
                    }
                    let sentence_tokens = self.count_tokens(sentence);
                    if current_tokens + sentence_tokens > max_chunk_tokens {
                        if !current.is_empty() {
                            chunks.push(current.trim().to_string());
                        }
                        current = format!("{}. ", sentence);
                        current_tokens = sentence_tokens;
                    } else {
                        current.push_str(sentence);
                        current.push_str(". ");
                        current_tokens += sentence_tokens;
                    }
                }
            } else if current_tokens + para_tokens > max_chunk_tokens {
                if !current.is_empty() {
                    chunks.push(current.trim().to_string());
                }
                // Seed the next chunk with overlap from the previous one
                if overlap_tokens > 0 && !chunks.is_empty() {
                    let overlap =
                        self.truncate_to_tokens(&chunks[chunks.len() - 1], overlap_tokens, true);
                    current = format!("{}\n\n{}", overlap, paragraph);
                } else {
                    current = paragraph.to_string();
                }
                current_tokens = self.count_tokens(&current);
            } else {
                if current.is_empty() {
                    current = paragraph.to_string();
                } else {
                    current.push_str("\n\n");
                    current.push_str(paragraph);
                }
                current_tokens += para_tokens;
            }
        }

        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }

        chunks
    }
}
