// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core workflow orchestration engine for declarative AI pipelines.
//!
//! Workflows are YAML documents describing a DAG of steps that call LLM
//! providers, compose other workflows, generate embeddings, search
//! vector stores, reach multi-provider consensus, or iterate a child
//! workflow until an LLM-evaluated condition is met.
//!
//! # Example
//!
//! ```no_run
//! use llm_flow_core::{Engine, Registry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> llm_flow_core::Result<()> {
//! let registry = Registry::load("config/workflows")?;
//! let engine = Engine::new(registry);
//! let outcome = engine
//!     .run("review/deep", "analyze this diff", CancellationToken::new())
//!     .await?;
//! println!("{}", outcome.final_output);
//! # Ok(())
//! # }
//! ```

pub mod compose;
pub mod consensus;
pub mod context;
pub mod dag;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod interpolate;
pub mod loops;
pub mod metrics;
pub mod model;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod scope;
pub mod validate;

pub use context::EffectiveContext;
pub use engine::{Engine, RunOutcome};
pub use error::{Diagnostic, FlowError, Result, Severity};
pub use model::{
    AggregationRule, Consensus, ExecutionContext, Loop, ProviderRef, Step, TemplateCall, Workflow,
    MAX_COMPOSITION_DEPTH, SCHEMA_TAG,
};
pub use providers::{
    CompletionRequest, CompletionResponse, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse,
    LlmProvider, ProviderError, ProviderSet, RagHit, RagProvider, RagRequest, RagResponse,
};
pub use registry::Registry;
pub use scheduler::StepStatus;
pub use scope::Scope;
