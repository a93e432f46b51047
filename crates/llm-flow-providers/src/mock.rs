// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scripted in-memory providers.
//!
//! Deterministic collaborators for engine tests and offline workflow
//! dry-runs: responses are served from a queue, a handler closure, or a
//! default, in that order.

use crate::traits::{
    CompletionRequest, CompletionResponse, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse,
    LlmProvider, ProviderError, RagHit, RagProvider, RagRequest, RagResponse,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

type Handler =
    Box<dyn Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static>;

/// Scripted LLM provider.
pub struct MockProvider {
    name: String,
    queue: Mutex<VecDeque<Result<String, ProviderError>>>,
    handler: Option<Handler>,
    default: Option<String>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    /// Creates a mock with no scripted responses.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            handler: None,
            default: None,
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queues a successful response.
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.queue.lock().push_back(Ok(text.into()));
        self
    }

    /// Queues a failure.
    pub fn with_error(self, error: ProviderError) -> Self {
        self.queue.lock().push_back(Err(error));
        self
    }

    /// Sets a handler consulted when the queue is empty.
    pub fn with_handler(
        mut self,
        handler: impl Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Sets a default response served when queue and handler are
    /// exhausted.
    pub fn with_default(mut self, text: impl Into<String>) -> Self {
        self.default = Some(text.into());
        self
    }

    /// Adds an artificial delay before each response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Number of completions served.
    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.prompts.lock().push(request.prompt.clone());

        let scripted = self.queue.lock().pop_front();
        let text = match scripted {
            Some(result) => result?,
            None => match &self.handler {
                Some(handler) => handler(&request)?,
                None => self.default.clone().ok_or_else(|| {
                    ProviderError::Unknown(format!(
                        "mock '{}' has no scripted response for: {}",
                        self.name, request.prompt
                    ))
                })?,
            },
        };

        Ok(CompletionResponse {
            text,
            model: request.model,
            tokens_used: None,
            metadata: std::collections::HashMap::new(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Deterministic embedding provider: fixed-dimension vectors derived
/// from the input bytes.
pub struct MockEmbeddingProvider {
    dimensions: u32,
}

impl MockEmbeddingProvider {
    /// Creates a mock embedding provider.
    pub fn new(dimensions: u32) -> Self {
        Self { dimensions }
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new(8)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        let dimensions = request.dimensions.unwrap_or(self.dimensions);
        let bytes = request.input.as_bytes();
        let vector: Vec<f32> = (0..dimensions)
            .map(|i| {
                let byte = bytes.get(i as usize % bytes.len().max(1)).copied().unwrap_or(0);
                byte as f32 / 255.0
            })
            .collect();

        Ok(EmbeddingResponse {
            job_id: format!("mock-embed-{}", bytes.len()),
            model: request.model,
            vectors: vec![vector],
            dimensions,
        })
    }

    fn name(&self) -> &str {
        "mock-embedding"
    }
}

/// RAG provider returning a fixed hit list.
pub struct MockRagProvider {
    hits: Vec<RagHit>,
}

impl MockRagProvider {
    /// Creates a mock RAG provider serving the given hits.
    pub fn new(hits: Vec<RagHit>) -> Self {
        Self { hits }
    }
}

#[async_trait]
impl RagProvider for MockRagProvider {
    async fn search(&self, request: RagRequest) -> Result<RagResponse, ProviderError> {
        let top_k = request.top_k.unwrap_or(self.hits.len() as u32) as usize;
        Ok(RagResponse {
            hits: self.hits.iter().take(top_k).cloned().collect(),
        })
    }

    fn name(&self) -> &str {
        "mock-rag"
    }
}
