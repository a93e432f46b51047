// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Iterative loop controller.
//!
//! Executes a child workflow repeatedly with loop-scoped variables and
//! asks an LLM after each iteration whether the natural-language `until`
//! condition is met. The evaluator sees the condition and the output as
//! separate fields; the output is never substituted into the condition
//! text. The first YES/NO token decides, case-insensitively; anything
//! else counts as NO and is recorded in diagnostics.

use crate::compose;
use crate::consensus::normalize_vote;
use crate::context::EffectiveContext;
use crate::engine::Engine;
use crate::error::{Diagnostic, FlowError, Result};
use crate::fallback::complete_with_fallback;
use crate::interpolate;
use crate::metrics;
use crate::model::{Loop, OnFailurePolicy};
use crate::scope::Scope;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry budget per iteration under `on_failure: retry`.
const ITERATION_RETRY_BUDGET: u32 = 3;

/// Why a loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The evaluator answered YES.
    ConditionMet,
    /// The iteration cap was reached.
    MaxIterations,
}

impl ExitReason {
    /// Stable label for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConditionMet => "condition_met",
            Self::MaxIterations => "max_iterations",
        }
    }
}

/// Result of a completed loop.
#[derive(Debug)]
pub(crate) struct LoopRun {
    /// Final output (the last successful iteration's output).
    pub output: String,
    /// Per-iteration outputs, in order.
    pub history: Vec<String>,
    /// Number of iterations executed.
    pub iterations: u32,
    /// Why the loop exited.
    pub exit_reason: ExitReason,
    /// Evaluator verdicts and failure records.
    pub diagnostics: Vec<Diagnostic>,
}

/// Runs a loop to completion.
pub(crate) async fn run_loop(
    engine: &Engine,
    calling_reg_name: &str,
    loop_: &Loop,
    name: &str,
    ctx: &EffectiveContext,
    caller_scope: &Scope,
    depth: usize,
    cancel: CancellationToken,
) -> Result<LoopRun> {
    let mut iteration: u32 = 1;
    let mut last_output = String::new();
    let mut history: Vec<String> = Vec::new();
    let mut diagnostics = Vec::new();

    let eval_ctx = match &loop_.evaluator {
        Some(evaluator) => ctx.for_execution(evaluator),
        None => ctx.clone(),
    };

    loop {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        // Loop-scoped variables visible to the child's input templates.
        let mut scope = caller_scope.clone();
        scope.set("loop.iteration", iteration.to_string());
        scope.set("loop.output", last_output.clone());
        scope.set("loop.last.output", last_output.clone());
        scope.set("loop.history", history.join("\n---\n"));

        let mut with: BTreeMap<String, String> = BTreeMap::new();
        for (key, template) in &loop_.with {
            let value = interpolate::interpolate(template, &scope).map_err(|missing| {
                FlowError::Interpolation {
                    step: name.to_string(),
                    key: missing.0,
                }
            })?;
            with.insert(key.clone(), value);
        }

        debug!(loop_name = %name, iteration, "Starting loop iteration");
        metrics::LOOP_ITERATIONS.with_label_values(&[name]).inc();

        let mut attempts = 0u32;
        let outcome = loop {
            let result = compose::invoke_child(
                engine,
                calling_reg_name,
                &loop_.workflow,
                with.clone(),
                depth,
                cancel.clone(),
            )
            .await;
            match result {
                Ok(child) => break Some(child),
                Err(FlowError::Cancelled) => return Err(FlowError::Cancelled),
                Err(err) => match loop_.on_failure {
                    OnFailurePolicy::Halt => return Err(err),
                    OnFailurePolicy::Continue => {
                        warn!(loop_name = %name, iteration, error = %err, "Iteration failed, continuing");
                        diagnostics.push(Diagnostic::warning(
                            name.to_string(),
                            format!("iteration {} failed: {}", iteration, err),
                        ));
                        break None;
                    }
                    OnFailurePolicy::Retry => {
                        attempts += 1;
                        if attempts > ITERATION_RETRY_BUDGET {
                            return Err(err);
                        }
                        warn!(
                            loop_name = %name,
                            iteration,
                            attempts,
                            error = %err,
                            "Iteration failed, retrying"
                        );
                    }
                },
            }
        };

        if let Some(child) = outcome {
            diagnostics.extend(child.diagnostics);
            history.push(child.output.clone());
            last_output = child.output;

            // Ask the evaluator whether the condition is met. This runs
            // on the final iteration too; at the cap the verdict is
            // recorded but cannot extend the loop.
            let verdict = evaluate_condition(
                engine,
                &eval_ctx,
                &loop_.until,
                &last_output,
                name,
                iteration,
                &mut diagnostics,
                &cancel,
            )
            .await?;

            if verdict {
                info!(loop_name = %name, iteration, "Loop condition met");
                return Ok(LoopRun {
                    output: last_output,
                    history,
                    iterations: iteration,
                    exit_reason: ExitReason::ConditionMet,
                    diagnostics,
                });
            }
        }

        if iteration == loop_.max_iterations {
            info!(loop_name = %name, iteration, "Loop reached max_iterations");
            return Ok(LoopRun {
                output: last_output,
                history,
                iterations: iteration,
                exit_reason: ExitReason::MaxIterations,
                diagnostics,
            });
        }
        iteration += 1;
    }
}

/// Runs the YES/NO evaluator call and parses the verdict.
#[allow(clippy::too_many_arguments)]
async fn evaluate_condition(
    engine: &Engine,
    eval_ctx: &EffectiveContext,
    condition: &str,
    output: &str,
    name: &str,
    iteration: u32,
    diagnostics: &mut Vec<Diagnostic>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let prompt = format!(
        "Evaluate this condition: {}. Output to evaluate: {}. \
         Answer YES if the condition is met, NO otherwise.",
        condition, output
    );

    let outcome =
        complete_with_fallback(engine.providers(), eval_ctx, &prompt, None, cancel).await?;
    let raw = outcome.response.text.clone();
    let token = normalize_vote(&raw);

    let verdict = match token.as_str() {
        "YES" => true,
        "NO" => false,
        _ => {
            warn!(loop_name = %name, iteration, raw = %raw, "Unparseable evaluator output, treating as NO");
            diagnostics.push(
                Diagnostic::warning(
                    name.to_string(),
                    format!(
                        "iteration {}: unparseable evaluator output '{}', treated as NO",
                        iteration,
                        raw.trim()
                    ),
                )
                .with_hint("the until condition should elicit a YES or NO answer"),
            );
            false
        }
    };

    diagnostics.push(Diagnostic::info(
        name.to_string(),
        format!(
            "iteration {}: evaluator answered {}",
            iteration,
            if verdict { "YES" } else { "NO" }
        ),
    ));
    Ok(verdict)
}
