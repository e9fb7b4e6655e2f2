//! Question variant generation.
//!
//! Asks the backend for `count` reworded versions of a base question, grounded
//! in retrieved course context, and parses the numbered list it returns.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::context::{join_passages, ContextError, ContextProvider};
use crate::evaluate::EvaluatorConfig;
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message, ProviderError};
use crate::prompts::escape_xml_chars;
use crate::tokens::truncate_to_tokens;

pub const DEFAULT_VARIANT_COUNT: usize = 5;
pub const MAX_VARIANT_COUNT: usize = 50;

static NUMBERED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+[:.)]\s*(.+)$").expect("Invalid numbered line regex"));

#[derive(Debug, Error)]
pub enum VariantError {
    #[error("base question must not be blank")]
    EmptyQuestion,
    #[error("variant count must be between 1 and {MAX_VARIANT_COUNT}, got {0}")]
    InvalidCount(usize),
    #[error("context retrieval failed: {0}")]
    Context(#[from] ContextError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("backend returned no numbered variants")]
    NoVariants,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantSet {
    pub base_question: String,
    pub variants: Vec<String>,
    /// Unparsed backend output.
    pub raw: String,
}

const VARIANT_SYSTEM: &str = "You are a problem designer who writes distinct variants of \
educational questions. Each variant keeps the core concept of the original but changes the \
numbers, the scenario and the wording so answers cannot be shared between students. Every \
variant must stand alone without referring to the original or to other variants.";

/// Deterministic user prompt for `count` variants of `base_question`.
pub fn variant_prompt(base_question: &str, context: &str, count: usize) -> String {
    format!(
        "Use the following context to guide your variants:\n\
         <context>\n{context}\n</context>\n\n\
         Original question:\n<question>\n{question}\n</question>\n\n\
         Write exactly {count} variants. Put each variant on its own line, numbered \
         like this:\n1: <first variant>\n2: <second variant>\n\n\
         Do not add any other text.",
        context = escape_xml_chars(context),
        question = escape_xml_chars(base_question.trim()),
    )
}

/// Numbered lines of `text`, trimmed, in order.
pub fn extract_variants(text: &str) -> Vec<String> {
    NUMBERED_LINE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub async fn generate_variants(
    gateway: &dyn ChatGateway,
    context: &dyn ContextProvider,
    base_question: &str,
    count: usize,
    config: &EvaluatorConfig,
) -> Result<VariantSet, VariantError> {
    if base_question.trim().is_empty() {
        return Err(VariantError::EmptyQuestion);
    }
    if count == 0 || count > MAX_VARIANT_COUNT {
        return Err(VariantError::InvalidCount(count));
    }

    let passages = context.retrieve(base_question).await?;
    let mut joined = join_passages(&passages);
    if let Some(max) = config.max_context_tokens {
        joined = truncate_to_tokens(&joined, max);
    }

    let messages = vec![
        Message::system(VARIANT_SYSTEM),
        Message::user(variant_prompt(base_question, &joined, count)),
    ];
    let mut request = ChatRequest::new(config.model.clone(), messages, Attribution::new("variants::generate"))
        .sampling(config.sampling);
    if let Some(max) = config.max_output_tokens {
        request = request.max_tokens(max);
    }

    let response = gateway.chat(request).await?;
    let mut variants = extract_variants(&response.content);
    if variants.is_empty() {
        return Err(VariantError::NoVariants);
    }
    if variants.len() != count {
        tracing::warn!(requested = count, returned = variants.len(), "variant count mismatch");
        variants.truncate(count);
    }

    Ok(VariantSet {
        base_question: base_question.trim().to_string(),
        variants,
        raw: response.content,
    })
}
