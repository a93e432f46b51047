// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-step execution dispatch.
//!
//! Resolves the effective context, interpolates the step's inputs and
//! invokes the selected execution mode. Workers call into this module
//! with an owned snapshot of the scope; results flow back to the
//! scheduler, which is the only writer of the live scope.

use crate::compose;
use crate::consensus::run_consensus;
use crate::context::{EffectiveContext, DEFAULT_MAX_WORKERS};
use crate::engine::Engine;
use crate::error::{Diagnostic, FlowError, Result};
use crate::interpolate;
use crate::loops::run_loop;
use crate::metrics;
use crate::model::{Loop, Step, Workflow};
use crate::providers::{EmbeddingRequest, RagRequest};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::scope::Scope;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A DAG node handed to the dispatcher.
#[derive(Debug, Clone)]
pub(crate) enum NodeSpec {
    /// A `steps:` entry.
    Step(Step),
    /// A `loops:` entry with its resolved name.
    Loop {
        /// The loop block.
        loop_: Loop,
        /// Node name.
        name: String,
    },
}

impl NodeSpec {
    /// Node name.
    pub fn name(&self) -> &str {
        match self {
            NodeSpec::Step(step) => &step.name,
            NodeSpec::Loop { name, .. } => name,
        }
    }
}

/// Result of one node execution, applied to the scope by the scheduler.
#[derive(Debug, Default)]
pub(crate) struct StepOutcome {
    /// The node's string output.
    pub text: String,
    /// Provider that produced a `run` output.
    pub provider: Option<String>,
    /// Runtime diagnostics (evaluator verdicts, partial failures).
    pub diagnostics: Vec<Diagnostic>,
    /// Raw vectors from an `embeddings` step, held for follow-on
    /// vector-search steps; never serialized into the scope.
    pub vectors: Option<Vec<Vec<f32>>>,
    /// Additional scope entries (outputs extraction, loop accumulate).
    pub extra_entries: Vec<(String, String)>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Mode label for metrics.
    pub mode: &'static str,
}

/// Executes a node with an owned scope snapshot.
pub(crate) async fn execute_node(
    engine: Engine,
    workflow: Arc<Workflow>,
    reg_name: String,
    node: NodeSpec,
    scope: Scope,
    vector_seed: Option<Vec<Vec<f32>>>,
    depth: usize,
    cancel: CancellationToken,
) -> Result<StepOutcome> {
    let start = Instant::now();
    let mut outcome = match &node {
        NodeSpec::Loop { loop_, name } => {
            execute_top_loop(&engine, &workflow, &reg_name, loop_, name, &scope, depth, &cancel)
                .await?
        }
        NodeSpec::Step(step) => {
            let policy = step
                .on_error
                .as_ref()
                .map(RetryPolicy::from_step_policy)
                .unwrap_or_default();
            let executor = RetryExecutor::new(policy);

            if let Some(for_each) = &step.for_each {
                execute_for_each(
                    &engine,
                    &workflow,
                    &reg_name,
                    step,
                    for_each,
                    &scope,
                    &vector_seed,
                    depth,
                    &cancel,
                )
                .await?
            } else {
                executor
                    .execute(|| {
                        execute_single(
                            &engine,
                            &workflow,
                            &reg_name,
                            step,
                            &scope,
                            &vector_seed,
                            depth,
                            &cancel,
                        )
                    })
                    .await?
            }
        }
    };

    outcome.duration = start.elapsed();
    metrics::STEP_DURATION
        .with_label_values(&[outcome.mode])
        .observe(outcome.duration.as_secs_f64());

    // Named output extraction: each entry sees the scope plus the step's
    // own result.
    if let NodeSpec::Step(step) = &node {
        if !step.outputs.is_empty() {
            let mut extraction_scope = scope.clone();
            extraction_scope.set("result", outcome.text.clone());
            for (key, template) in &step.outputs {
                let value = interp(template, &extraction_scope, &step.name)?;
                outcome.extra_entries.push((key.clone(), value));
            }
        }
    }

    info!(
        step = %node.name(),
        mode = outcome.mode,
        duration_ms = outcome.duration.as_millis() as u64,
        "Step completed"
    );
    Ok(outcome)
}

/// Executes a top-level loop node.
#[allow(clippy::too_many_arguments)]
async fn execute_top_loop(
    engine: &Engine,
    workflow: &Arc<Workflow>,
    reg_name: &str,
    loop_: &Loop,
    name: &str,
    scope: &Scope,
    depth: usize,
    cancel: &CancellationToken,
) -> Result<StepOutcome> {
    let ctx = EffectiveContext::resolve(&workflow.execution, None, name)?;
    loop_outcome(engine, reg_name, loop_, name, &ctx, scope, depth, cancel).await
}

#[allow(clippy::too_many_arguments)]
async fn loop_outcome(
    engine: &Engine,
    reg_name: &str,
    loop_: &Loop,
    name: &str,
    ctx: &EffectiveContext,
    scope: &Scope,
    depth: usize,
    cancel: &CancellationToken,
) -> Result<StepOutcome> {
    let run = run_loop(engine, reg_name, loop_, name, ctx, scope, depth, cancel.clone()).await?;

    let mut extra_entries = vec![("loop.iteration".to_string(), run.iterations.to_string())];
    if let Some(accumulate) = &loop_.accumulate {
        let history = serde_json::to_string(&run.history).unwrap_or_default();
        extra_entries.push((accumulate.clone(), history));
    }

    let mut diagnostics = run.diagnostics;
    diagnostics.push(Diagnostic::info(
        name.to_string(),
        format!(
            "loop exited after {} iteration(s): {}",
            run.iterations,
            run.exit_reason.as_str()
        ),
    ));

    Ok(StepOutcome {
        text: run.output,
        provider: None,
        diagnostics,
        vectors: None,
        extra_entries,
        duration: Duration::ZERO,
        mode: "loop",
    })
}

/// Expands a `for_each` step: one instance per item, run concurrently
/// under the effective worker bound, outputs collected as a JSON array
/// in item order.
#[allow(clippy::too_many_arguments)]
async fn execute_for_each(
    engine: &Engine,
    workflow: &Arc<Workflow>,
    reg_name: &str,
    step: &Step,
    for_each: &str,
    scope: &Scope,
    vector_seed: &Option<Vec<Vec<f32>>>,
    depth: usize,
    cancel: &CancellationToken,
) -> Result<StepOutcome> {
    let materialized = interp(for_each, scope, &step.name)?;
    let items = parse_items(&materialized);
    debug!(step = %step.name, items = items.len(), "Expanding for_each");

    let item_name = step.item_name.as_deref().unwrap_or("item");
    let workers = step
        .max_workers
        .or(workflow.execution.max_workers)
        .unwrap_or(DEFAULT_MAX_WORKERS);
    let semaphore = Arc::new(Semaphore::new(workers));

    let instances = items.iter().enumerate().map(|(index, item)| {
        let mut instance_scope = scope.clone();
        instance_scope.set(item_name, item.clone());
        instance_scope.set("index", index.to_string());
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| FlowError::Cancelled)?;
            execute_single(
                engine,
                workflow,
                reg_name,
                step,
                &instance_scope,
                vector_seed,
                depth,
                cancel,
            )
            .await
        }
    });

    let results = futures::future::join_all(instances).await;
    let mut texts = Vec::with_capacity(results.len());
    let mut diagnostics = Vec::new();
    let mut provider = None;
    for result in results {
        let outcome = result?;
        texts.push(outcome.text);
        diagnostics.extend(outcome.diagnostics);
        provider = provider.or(outcome.provider);
    }

    Ok(StepOutcome {
        text: serde_json::to_string(&texts).unwrap_or_default(),
        provider,
        diagnostics,
        vectors: None,
        extra_entries: Vec::new(),
        duration: Duration::ZERO,
        mode: "for_each",
    })
}

/// Parses a materialized `for_each` expression: a JSON array when it
/// parses as one, otherwise one item per non-empty line.
fn parse_items(materialized: &str) -> Vec<String> {
    if let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(materialized) {
        return values
            .into_iter()
            .map(|value| match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
    }
    materialized
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Executes one step instance in its selected mode.
#[allow(clippy::too_many_arguments)]
async fn execute_single(
    engine: &Engine,
    workflow: &Arc<Workflow>,
    reg_name: &str,
    step: &Step,
    scope: &Scope,
    vector_seed: &Option<Vec<Vec<f32>>>,
    depth: usize,
    cancel: &CancellationToken,
) -> Result<StepOutcome> {
    if let Some(prompt) = &step.run {
        let ctx = step_context(workflow, step)?;
        let prompt = interp(prompt, scope, &step.name)?;
        let outcome = crate::fallback::complete_with_fallback(
            engine.providers(),
            &ctx,
            &prompt,
            None,
            cancel,
        )
        .await?;
        let diagnostics = outcome
            .failed
            .iter()
            .map(|(provider, error)| {
                Diagnostic::warning(
                    step.name.clone(),
                    format!("provider '{}' failed ({}), fell back", provider, error),
                )
            })
            .collect();
        return Ok(StepOutcome {
            text: outcome.response.text,
            provider: Some(outcome.provider),
            diagnostics,
            mode: "run",
            ..Default::default()
        });
    }

    if let Some(template) = &step.template {
        let mut with = std::collections::BTreeMap::new();
        for (key, value_template) in &template.with {
            with.insert(key.clone(), interp(value_template, scope, &step.name)?);
        }
        let child = compose::invoke_child(
            engine,
            reg_name,
            &template.workflow,
            with,
            depth,
            cancel.clone(),
        )
        .await?;
        return Ok(StepOutcome {
            text: child.output,
            diagnostics: child.diagnostics,
            mode: "template",
            ..Default::default()
        });
    }

    if let Some(embeddings) = &step.embeddings {
        let ctx = step_context(workflow, step)?;
        let entry = &ctx.providers[0];
        let provider = engine.providers().embedding(&entry.provider).ok_or_else(|| {
            FlowError::StepFailed {
                step: step.name.clone(),
                message: format!("embedding provider '{}' not registered", entry.provider),
            }
        })?;
        let input = interp(&embeddings.input, scope, &step.name)?;
        let request = EmbeddingRequest {
            model: embeddings.model.clone().unwrap_or_else(|| entry.model.clone()),
            input,
            dimensions: embeddings.dimensions,
        };
        let response = provider
            .embed(request)
            .await
            .map_err(|e| FlowError::from_provider(&entry.provider, e))?;

        // Downstream prompts see job metadata only; the vectors stay
        // behind an internal handle keyed by the step name.
        let metadata = serde_json::json!({
            "job_id": response.job_id,
            "model": response.model,
            "dimensions": response.dimensions,
            "chunks": response.vectors.len(),
        });
        return Ok(StepOutcome {
            text: metadata.to_string(),
            vectors: Some(response.vectors),
            mode: "embeddings",
            ..Default::default()
        });
    }

    if let Some(consensus) = &step.consensus {
        let ctx = consensus_context(workflow, step)?;
        let prompt = interp(&consensus.prompt, scope, &step.name)?;
        let (json, diagnostics) = run_consensus(
            engine.providers(),
            &ctx,
            consensus,
            &prompt,
            &step.name,
            cancel,
        )
        .await?;
        return Ok(StepOutcome {
            text: json,
            diagnostics,
            mode: "consensus",
            ..Default::default()
        });
    }

    if let Some(loop_) = &step.loop_ {
        let ctx = step_context(workflow, step)?;
        return loop_outcome(
            engine, reg_name, loop_, &step.name, &ctx, scope, depth, cancel,
        )
        .await;
    }

    if let Some(rag) = &step.rag {
        let provider = engine.providers().rag(&rag.server).ok_or_else(|| {
            FlowError::StepFailed {
                step: step.name.clone(),
                message: format!("RAG server '{}' not registered", rag.server),
            }
        })?;
        let query = interp(&rag.query, scope, &step.name)?;
        let query_vector = vector_seed
            .as_ref()
            .and_then(|vectors| vectors.first().cloned());
        let request = RagRequest {
            server: rag.server.clone(),
            query,
            query_vector,
            top_k: rag.top_k,
        };
        let response = provider
            .search(request)
            .await
            .map_err(|e| FlowError::from_provider(&rag.server, e))?;
        return Ok(StepOutcome {
            text: serde_json::to_string(&response.hits).unwrap_or_default(),
            mode: "rag",
            ..Default::default()
        });
    }

    // Unreachable after validation.
    Err(FlowError::StepFailed {
        step: step.name.clone(),
        message: "step has no execution mode".to_string(),
    })
}

fn step_context(workflow: &Workflow, step: &Step) -> Result<EffectiveContext> {
    EffectiveContext::resolve(&workflow.execution, Some(&step.overrides()), &step.name)
}

/// Consensus executions carry their own providers, so a missing
/// workflow/step chain falls back to the execution list itself.
fn consensus_context(workflow: &Workflow, step: &Step) -> Result<EffectiveContext> {
    match step_context(workflow, step) {
        Ok(ctx) => Ok(ctx),
        Err(_) => {
            let mut overrides = step.overrides();
            overrides.providers = step
                .consensus
                .as_ref()
                .map(|c| c.executions.clone())
                .unwrap_or_default();
            EffectiveContext::resolve(&workflow.execution, Some(&overrides), &step.name)
        }
    }
}

fn interp(template: &str, scope: &Scope, step: &str) -> Result<String> {
    interpolate::interpolate(template, scope).map_err(|missing| FlowError::Interpolation {
        step: step.to_string(),
        key: missing.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_items_json_array() {
        assert_eq!(parse_items(r#"["a", "b"]"#), vec!["a", "b"]);
        assert_eq!(parse_items(r#"[1, 2]"#), vec!["1", "2"]);
    }

    #[test]
    fn test_parse_items_lines_fallback() {
        assert_eq!(parse_items("alpha\n\n  beta  \n"), vec!["alpha", "beta"]);
        assert!(parse_items("").is_empty());
    }
}
