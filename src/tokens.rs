//! Token counting for context budgets.
//!
//! Uses the cl100k_base tokenizer. Local models tokenize differently, so the
//! counts are an estimate; they only need to be stable and roughly right.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!(error = %e, "failed to load cl100k_base; falling back to chars/4 estimate");
        None
    }
});

/// Count tokens in text.
pub fn count_tokens(text: &str) -> usize {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Keep at most `max_tokens` leading tokens of `text`.
///
/// Returns the input unchanged when it already fits.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    match BPE.as_ref() {
        Some(bpe) => {
            let tokens = bpe.encode_with_special_tokens(text);
            if tokens.len() <= max_tokens {
                return text.to_string();
            }
            bpe.decode(tokens[..max_tokens].to_vec()).unwrap_or_else(|_| {
                text.chars().take(max_tokens.saturating_mul(4)).collect()
            })
        }
        None => text.chars().take(max_tokens.saturating_mul(4)).collect(),
    }
}
