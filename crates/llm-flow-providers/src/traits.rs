// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider trait definitions (re-exported from core).

// Re-export collaborator traits from core to maintain compatibility
pub use llm_flow_core::providers::{
    CompletionRequest, CompletionResponse, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse,
    LlmProvider, ProviderError, RagHit, RagProvider, RagRequest, RagResponse,
};
