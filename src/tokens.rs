/// Token counting and token-bounded truncation
///
/// Backed by a HuggingFace `tokenizers` model. The same counter is shared by the
/// ingest pipeline (text truncation), the embedder (batch planning) and the
/// extractor (prompt stuffing), so every budget is measured the same way.

use ahash::AHashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tokenizers::{models::wordlevel::WordLevel, pre_tokenizers::whitespace::Whitespace, Tokenizer};

use crate::errors::SackError;

#[derive(Clone)]
pub struct TokenCounter {
    tokenizer: Arc<Tokenizer>,
}

impl TokenCounter {
    /// Load a tokenizer by name.
    ///
    /// - an existing file path is read as a `tokenizer.json`
    /// - `"whitespace"` builds an offline word-level tokenizer
    /// - anything else is fetched from the HuggingFace hub
    pub fn load(name: &str) -> Result<Self, SackError> {
        if name == "whitespace" {
            return Self::whitespace();
        }
        let tokenizer = if Path::new(name).is_file() {
            Tokenizer::from_file(name)
        } else {
            Tokenizer::from_pretrained(name, None)
        }
        .map_err(|e| SackError::Config(format!("Failed to load tokenizer '{}': {}", name, e)))?;

        Ok(Self::from_tokenizer(tokenizer))
    }

    /// Word-level tokenizer where every whitespace/punctuation separated word is one token.
    pub fn whitespace() -> Result<Self, SackError> {
        let mut vocab = AHashMap::new();
        vocab.insert("<unk>".to_string(), 0_u32);

        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .map_err(|e| SackError::Config(format!("Failed to build whitespace tokenizer: {}", e)))?;
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace));

        Ok(Self::from_tokenizer(tokenizer))
    }

    pub fn from_tokenizer(tokenizer: Tokenizer) -> Self {
        TokenCounter { tokenizer: Arc::new(tokenizer) }
    }

    pub fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(e) => {
                // Roughly four characters per token on English prose
                tracing::warn!(error = %e, "Tokenization failed, estimating token count");
                text.chars().count().div_ceil(4)
            }
        }
    }

    pub fn count_all<S: AsRef<str>>(&self, texts: &[S]) -> usize {
        texts.iter().map(|t| self.count(t.as_ref())).sum()
    }

    /// Cut `text` to at most `max_tokens` tokens. Text already within budget is returned unchanged.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let encoding = match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding,
            Err(e) => {
                // A token is never shorter than one character
                tracing::warn!(error = %e, "Tokenization failed, truncating by characters");
                return text.chars().take(max_tokens).collect();
            }
        };

        let offsets = encoding.get_offsets();
        if offsets.len() <= max_tokens {
            return text.to_string();
        }
        if max_tokens == 0 {
            return String::new();
        }

        let mut end = offsets[max_tokens - 1].1.min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

/// Split `0..counts.len()` into contiguous ranges whose token sums fit `budget`.
///
/// Overflowing ranges are halved at the midpoint until they fit; a single text
/// that is too long on its own still gets a range of its own.
pub fn split_to_fit(counts: &[usize], budget: usize) -> Vec<Range<usize>> {
    fn split(counts: &[usize], range: Range<usize>, budget: usize, out: &mut Vec<Range<usize>>) {
        let total: usize = counts[range.clone()].iter().sum();
        if total <= budget || range.len() <= 1 {
            out.push(range);
            return;
        }
        let mid = range.start + range.len() / 2;
        split(counts, range.start..mid, budget, out);
        split(counts, mid..range.end, budget, out);
    }

    let mut out = Vec::new();
    if !counts.is_empty() {
        split(counts, 0..counts.len(), budget, &mut out);
    }
    out
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_whitespace_words() {
        let tokens = TokenCounter::whitespace().unwrap();
        assert_eq!(tokens.count("the quick brown fox"), 4);
        assert_eq!(tokens.count(""), 0);
        assert_eq!(tokens.count_all(&["one two", "three"]), 3);
    }

    #[test]
    fn test_truncate_keeps_short_text() {
        let tokens = TokenCounter::whitespace().unwrap();
        let text = "markets rallied on friday";
        assert_eq!(tokens.truncate(text, 10), text);
        assert_eq!(tokens.truncate(text, 4), text);
    }

    #[test]
    fn test_truncate_cuts_at_token_boundary() {
        let tokens = TokenCounter::whitespace().unwrap();
        let truncated = tokens.truncate("markets rallied on friday afternoon", 3);
        assert_eq!(truncated, "markets rallied on");
        assert_eq!(tokens.count(&truncated), 3);
    }

    #[test]
    fn test_truncate_multibyte_text() {
        let tokens = TokenCounter::whitespace().unwrap();
        let truncated = tokens.truncate("café déjà vu über alles", 2);
        assert_eq!(truncated, "café déjà");
    }

    #[test]
    fn test_split_to_fit_halves_until_fit() {
        assert_eq!(split_to_fit(&[3, 3, 3, 3], 100), vec![0..4]);
        assert_eq!(split_to_fit(&[3, 3, 3, 3], 6), vec![0..2, 2..4]);
        assert_eq!(split_to_fit(&[3, 3, 3, 3], 5), vec![0..1, 1..2, 2..3, 3..4]);
        // an oversized single text still gets its own range
        assert_eq!(split_to_fit(&[50, 1], 10), vec![0..1, 1..2]);
        assert!(split_to_fit(&[], 10).is_empty());
    }

    #[test]
    fn test_load_whitespace_by_name() {
        let tokens = TokenCounter::load("whitespace").unwrap();
        assert_eq!(tokens.count("a b c"), 3);
    }
}
