// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Effective execution-context resolution.
//!
//! Field-wise layering: engine defaults ← workflow `execution:` ← step
//! overrides ← (for consensus) per-execution overrides. A step that sets
//! a single `provider`/`model` pair replaces an inherited chain outright.

use crate::error::{FlowError, Result};
use crate::model::{ExecutionContext, LogLevel, OnErrorPolicy, ProviderRef};
use std::time::Duration;

/// Engine default temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Engine default max tokens.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
/// Engine default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Engine default worker count under parallel scheduling.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Fully resolved execution configuration for one step or loop.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveContext {
    /// Ordered provider chain; never empty.
    pub providers: Vec<ProviderRef>,
    /// MCP server identifiers.
    pub servers: Vec<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Max tokens to generate.
    pub max_tokens: u32,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Logging level.
    pub logging: LogLevel,
    /// Bounded-parallel scheduling enabled.
    pub parallel: bool,
    /// Worker count.
    pub max_workers: usize,
    /// Scheduler failure policy.
    pub on_error: OnErrorPolicy,
}

impl EffectiveContext {
    /// Resolves the effective context for a step by layering its
    /// overrides over the workflow defaults.
    pub fn resolve(
        workflow: &ExecutionContext,
        step: Option<&ExecutionContext>,
        step_name: &str,
    ) -> Result<Self> {
        let providers = resolve_chain(workflow, step).ok_or_else(|| FlowError::StepFailed {
            step: step_name.to_string(),
            message: "no provider configured at workflow or step level".to_string(),
        })?;

        let temperature = step
            .and_then(|c| c.temperature)
            .or(workflow.temperature)
            .unwrap_or(DEFAULT_TEMPERATURE);
        let max_tokens = step
            .and_then(|c| c.max_tokens)
            .or(workflow.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let timeout = step
            .and_then(|c| c.timeout_seconds)
            .or(workflow.timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        let logging = step
            .and_then(|c| c.logging)
            .or(workflow.logging)
            .unwrap_or(LogLevel::Info);
        let servers = step
            .map(|c| c.servers.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| workflow.servers.clone());
        let parallel = workflow.parallel.unwrap_or(false);
        let max_workers = step
            .and_then(|c| c.max_workers)
            .or(workflow.max_workers)
            .unwrap_or(DEFAULT_MAX_WORKERS);
        let on_error = workflow.on_error.unwrap_or(OnErrorPolicy::CancelAll);

        Ok(Self {
            providers,
            servers,
            temperature,
            max_tokens,
            timeout,
            logging,
            parallel,
            max_workers,
            on_error,
        })
    }

    /// Layers a single-execution override (a consensus execution or a
    /// loop evaluator) atop this context, producing a one-entry chain.
    pub fn for_execution(&self, exec: &ProviderRef) -> Self {
        let mut ctx = self.clone();
        ctx.providers = vec![exec.clone()];
        if let Some(t) = exec.temperature {
            ctx.temperature = t;
        }
        if let Some(m) = exec.max_tokens {
            ctx.max_tokens = m;
        }
        if let Some(s) = exec.timeout_seconds {
            ctx.timeout = Duration::from_secs(s);
        }
        ctx
    }
}

/// Computes the provider chain for a level pair. Step single pair >
/// step chain > workflow single pair > workflow chain; `None` when no
/// level configures a provider.
fn resolve_chain(
    workflow: &ExecutionContext,
    step: Option<&ExecutionContext>,
) -> Option<Vec<ProviderRef>> {
    if let Some(step) = step {
        if let Some(single) = single_pair(step) {
            return Some(vec![single]);
        }
        if !step.providers.is_empty() {
            return Some(step.providers.clone());
        }
    }
    if let Some(single) = single_pair(workflow) {
        return Some(vec![single]);
    }
    if !workflow.providers.is_empty() {
        return Some(workflow.providers.clone());
    }
    None
}

fn single_pair(ctx: &ExecutionContext) -> Option<ProviderRef> {
    match (&ctx.provider, &ctx.model) {
        (Some(provider), Some(model)) => Some(ProviderRef {
            provider: provider.clone(),
            model: model.clone(),
            temperature: None,
            max_tokens: None,
            timeout_seconds: None,
        }),
        _ => None,
    }
}
