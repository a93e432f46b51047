// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collaborator trait definitions.
//!
//! The engine consumes LLM completion, embedding generation and RAG search
//! through these narrow interfaces; concrete HTTP clients live in the
//! `llm-flow-providers` crate.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Get provider name.
    fn name(&self) -> &str;

    /// Check if provider is healthy.
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Embedding provider trait.
///
/// Vectors are returned to the engine but never serialized into the
/// variable scope; downstream steps see job metadata only.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a single input text.
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError>;

    /// Get provider name.
    fn name(&self) -> &str;
}

/// RAG search provider trait (vector-store collaborator, usually MCP-backed).
#[async_trait]
pub trait RagProvider: Send + Sync {
    /// Run a similarity search against a named server.
    async fn search(&self, request: RagRequest) -> Result<RagResponse, ProviderError>;

    /// Get provider name.
    fn name(&self) -> &str;
}

/// Completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model name.
    pub model: String,

    /// Prompt text.
    pub prompt: String,

    /// System prompt (optional).
    pub system: Option<String>,

    /// Temperature (0.0 - 2.0).
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,

    /// Per-request timeout.
    #[serde(skip)]
    pub timeout: Option<Duration>,

    /// Additional parameters.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text.
    pub text: String,

    /// Model used.
    pub model: String,

    /// Tokens used.
    pub tokens_used: Option<u32>,

    /// Additional metadata.
    #[serde(flatten)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Model name.
    pub model: String,

    /// Input text.
    pub input: String,

    /// Requested vector dimensions, when the model supports it.
    pub dimensions: Option<u32>,
}

/// Embedding response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// Job identifier assigned by the provider.
    pub job_id: String,

    /// Model used.
    pub model: String,

    /// Generated vectors, one per input chunk.
    pub vectors: Vec<Vec<f32>>,

    /// Vector dimensionality.
    pub dimensions: u32,
}

/// RAG search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagRequest {
    /// Target server identifier.
    pub server: String,

    /// Query text.
    pub query: String,

    /// Pre-computed query vector, when an earlier embeddings step
    /// produced one.
    pub query_vector: Option<Vec<f32>>,

    /// Maximum results to return.
    pub top_k: Option<u32>,
}

/// A single RAG search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagHit {
    /// Document identifier.
    pub id: String,

    /// Matched text.
    pub text: String,

    /// Similarity score.
    pub score: f32,
}

/// RAG search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagResponse {
    /// Ranked hits.
    pub hits: Vec<RagHit>,
}

/// Provider error.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    /// Authentication error.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        /// Server-advised wait, when present.
        retry_after: Option<Duration>,
    },

    /// Requested model does not exist on this provider.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request exceeded the provider's size limit.
    #[error("Request too large: {0}")]
    RequestTooLarge(String),

    /// Provider-side 5xx error.
    #[error("Provider error [{status}]: {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Error body.
        message: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Timeout error.
    #[error("Request timed out")]
    Timeout,

    /// Unknown error.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Whether this error is transient and eligible for retry or
    /// provider fallback.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::HttpError(_) => true,
            ProviderError::RateLimitExceeded { .. } => true,
            ProviderError::ServerError { status, .. } => *status >= 500,
            ProviderError::Timeout => true,
            ProviderError::AuthError(_) => false,
            ProviderError::ModelNotFound(_) => false,
            ProviderError::InvalidRequest(_) => false,
            ProviderError::RequestTooLarge(_) => false,
            ProviderError::SerializationError(_) => false,
            ProviderError::Unknown(_) => false,
        }
    }

    /// Server-advised retry delay for rate-limit responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimitExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether provider fallback should advance past this error even
    /// though it is permanent (a different provider may carry the model).
    pub fn is_fallback_eligible(&self) -> bool {
        self.is_transient() || matches!(self, ProviderError::ModelNotFound(_))
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Registered collaborators, keyed by provider name.
#[derive(Default)]
pub struct ProviderSet {
    llm: DashMap<String, Arc<dyn LlmProvider>>,
    embedding: DashMap<String, Arc<dyn EmbeddingProvider>>,
    rag: DashMap<String, Arc<dyn RagProvider>>,
}

impl ProviderSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an LLM provider.
    pub fn register_llm(&self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.llm.insert(name.into(), provider);
    }

    /// Registers an embedding provider.
    pub fn register_embedding(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn EmbeddingProvider>,
    ) {
        self.embedding.insert(name.into(), provider);
    }

    /// Registers a RAG provider.
    pub fn register_rag(&self, name: impl Into<String>, provider: Arc<dyn RagProvider>) {
        self.rag.insert(name.into(), provider);
    }

    /// Looks up an LLM provider by name.
    pub fn llm(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.llm.get(name).map(|entry| entry.value().clone())
    }

    /// Looks up an embedding provider by name.
    pub fn embedding(&self, name: &str) -> Option<Arc<dyn EmbeddingProvider>> {
        self.embedding.get(name).map(|entry| entry.value().clone())
    }

    /// Looks up a RAG provider by name.
    pub fn rag(&self, name: &str) -> Option<Arc<dyn RagProvider>> {
        self.rag.get(name).map(|entry| entry.value().clone())
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("llm", &self.llm.len())
            .field("embedding", &self.embedding.len())
            .field("rag", &self.rag.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimitExceeded { retry_after: None }.is_transient());
        assert!(ProviderError::ServerError {
            status: 503,
            message: "overloaded".to_string()
        }
        .is_transient());
        assert!(ProviderError::HttpError("connection refused".to_string()).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(!ProviderError::AuthError("bad key".to_string()).is_transient());
        assert!(!ProviderError::ModelNotFound("gpt-99".to_string()).is_transient());
        assert!(!ProviderError::RequestTooLarge("1M tokens".to_string()).is_transient());
    }

    #[test]
    fn test_model_not_found_is_fallback_eligible() {
        let err = ProviderError::ModelNotFound("claude-99".to_string());
        assert!(!err.is_transient());
        assert!(err.is_fallback_eligible());
    }

    #[test]
    fn test_retry_after() {
        let err = ProviderError::RateLimitExceeded {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(ProviderError::Timeout.retry_after(), None);
    }
}
