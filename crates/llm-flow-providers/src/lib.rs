// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM, embedding and retrieval provider integrations for llm-flow.

pub mod anthropic;
pub mod mock;
pub mod openai;
pub mod traits;

// Re-exports
pub use anthropic::AnthropicProvider;
pub use mock::{MockEmbeddingProvider, MockProvider, MockRagProvider};
pub use openai::OpenAIProvider;
pub use traits::{CompletionRequest, CompletionResponse, LlmProvider, ProviderError};

use llm_flow_core::Engine;
use std::sync::Arc;
use tracing::debug;

/// Registers every provider whose API key is present in the process
/// environment (`ANTHROPIC_API_KEY`, `OPENAI_API_KEY`).
pub fn register_from_env(mut engine: Engine) -> Engine {
    if let Ok(provider) = AnthropicProvider::from_env() {
        debug!("Registered anthropic provider from environment");
        engine = engine.with_provider("anthropic", Arc::new(provider));
    }
    if let Ok(provider) = OpenAIProvider::from_env() {
        debug!("Registered openai provider from environment");
        let provider = Arc::new(provider);
        engine = engine
            .with_provider("openai", provider.clone())
            .with_embedding_provider("openai", provider);
    }
    engine
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
