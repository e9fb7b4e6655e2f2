//! Context retrieval: the passages a judge is allowed to look at.
//!
//! Retrieval itself (embedding, vector search, chunk selection) lives in an
//! external service. This module only defines the seam and two providers:
//! an HTTP client for a retrieval service and a fixed in-memory provider.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONTEXT_URL: &str = "http://localhost:8000";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("context http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to read context file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("context configuration error: {0}")]
    Config(String),
}

/// Source of context passages for a retrieval query.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// An empty result means "no context", not an error.
    async fn retrieve(&self, query: &str) -> Result<Vec<String>, ContextError>;
}

/// Retrieval query for one dimension of one subject.
pub fn context_query(subject_name: &str, dimension: &str, secondary_name: Option<&str>) -> String {
    match secondary_name {
        Some(secondary) => {
            format!("Evaluate {subject_name} in comparison to {secondary} on {dimension}.")
        }
        None => format!("Evaluate {subject_name} on {dimension}."),
    }
}

/// Join passages for embedding in a prompt.
pub fn join_passages(passages: &[String]) -> String {
    passages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// HTTP PROVIDER
// =============================================================================

#[derive(Serialize)]
struct QueryBody<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    context: Option<ContextField>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContextField {
    One(String),
    Many(Vec<String>),
}

/// Client for a retrieval service exposing `POST /api/query`.
#[derive(Debug, Clone)]
pub struct HttpContextProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContextProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ContextError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ContextError::Config("context URL must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ContextError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    /// `RUBRIC_CONTEXT_URL`, defaulting to a local retrieval service.
    pub fn from_env() -> Result<Self, ContextError> {
        let url = std::env::var("RUBRIC_CONTEXT_URL").unwrap_or_else(|_| DEFAULT_CONTEXT_URL.into());
        Self::new(url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ContextProvider for HttpContextProvider {
    async fn retrieve(&self, query: &str) -> Result<Vec<String>, ContextError> {
        let response = self
            .client
            .post(format!("{}/api/query", self.base_url))
            .json(&QueryBody { query })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ContextError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let parsed: QueryResponse = response.json().await?;
        let passages = match parsed.context {
            Some(ContextField::One(s)) => vec![s],
            Some(ContextField::Many(v)) => v,
            None => Vec::new(),
        };
        Ok(passages
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect())
    }
}

// =============================================================================
// STATIC PROVIDER
// =============================================================================

/// Returns the same passages for every query.
#[derive(Debug, Clone, Default)]
pub struct StaticContextProvider {
    passages: Vec<String>,
}

impl StaticContextProvider {
    pub fn new(passages: Vec<String>) -> Self {
        Self { passages }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// The whole file is one passage.
    pub fn from_file(path: &Path) -> Result<Self, ContextError> {
        let text = std::fs::read_to_string(path).map_err(|source| ContextError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(vec![text]))
    }
}

#[async_trait]
impl ContextProvider for StaticContextProvider {
    async fn retrieve(&self, _query: &str) -> Result<Vec<String>, ContextError> {
        Ok(self.passages.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_phrasing() {
        assert_eq!(
            context_query("Dr. Rao", "Punctuality", None),
            "Evaluate Dr. Rao on Punctuality."
        );
        assert_eq!(
            context_query("cv.pdf", "Overall Fit", Some("jd.pdf")),
            "Evaluate cv.pdf in comparison to jd.pdf on Overall Fit."
        );
    }

    #[test]
    fn passages_join_with_single_space() {
        let joined = join_passages(&["  first ".into(), "".into(), "second".into()]);
        assert_eq!(joined, "first second");
    }

    #[tokio::test]
    async fn static_provider_ignores_query() {
        let provider = StaticContextProvider::new(vec!["a".into(), "b".into()]);
        assert_eq!(provider.retrieve("anything").await.unwrap(), vec!["a", "b"]);
        assert!(StaticContextProvider::empty().retrieve("x").await.unwrap().is_empty());
    }
}
