// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Child workflow invocation.
//!
//! A child runs in a fresh execution: its scope holds only the resolved
//! `with:` entries and the synthesized `input`. The parent receives the
//! child's final output and nothing else. Recursion is bounded by
//! [`MAX_COMPOSITION_DEPTH`](crate::model::MAX_COMPOSITION_DEPTH); the
//! cap counts total workflow depth across template calls and loop bodies.

use crate::engine::Engine;
use crate::error::{Diagnostic, FlowError, Result};
use crate::model::MAX_COMPOSITION_DEPTH;
use crate::registry::registry_dir;
use crate::scope::Scope;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of a child invocation.
#[derive(Debug)]
pub(crate) struct ChildRun {
    /// The child's final output.
    pub output: String,
    /// Diagnostics bubbled up from the child execution.
    pub diagnostics: Vec<Diagnostic>,
}

/// Invokes `child_name` (resolved against `calling_reg_name`'s directory)
/// with the already-interpolated `with` map as its sole input.
pub(crate) async fn invoke_child(
    engine: &Engine,
    calling_reg_name: &str,
    child_name: &str,
    with: BTreeMap<String, String>,
    depth: usize,
    cancel: CancellationToken,
) -> Result<ChildRun> {
    if depth + 1 > MAX_COMPOSITION_DEPTH {
        return Err(FlowError::CompositionDepthExceeded {
            workflow: child_name.to_string(),
            max_depth: MAX_COMPOSITION_DEPTH,
        });
    }

    let calling_dir = registry_dir(calling_reg_name);
    let (reg_name, workflow) = engine.registry().resolve(child_name, calling_dir)?;
    debug!(child = %reg_name, caller = %calling_reg_name, depth, "Invoking child workflow");

    let scope = Scope::for_child(&with, workflow.env.clone());
    let run = engine
        .execute_workflow(workflow, reg_name.clone(), scope, depth + 1, cancel)
        .await?;

    // A child that did not complete cleanly is a failure of the calling
    // step; its partial outputs stay isolated in the child execution.
    if let Some(failure) = run.failure {
        return Err(FlowError::StepFailed {
            step: reg_name,
            message: failure,
        });
    }

    info!(child = %reg_name, "Child workflow completed");
    Ok(ChildRun {
        output: run.final_output,
        diagnostics: run.diagnostics,
    })
}
