// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The workflow engine.
//!
//! Holds the registry and the registered collaborators; each `run`
//! invocation owns its own execution state. Validation errors block
//! execution entirely; runtime step failures produce a [`RunOutcome`]
//! with partial outputs and a prominent failure message.

use crate::error::{Diagnostic, FlowError, Result};
use crate::providers::{EmbeddingProvider, LlmProvider, ProviderSet, RagProvider};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::scope::Scope;
use crate::model::Workflow;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Result of one engine invocation.
#[derive(Debug, serde::Serialize)]
pub struct RunOutcome {
    /// Unique id for this invocation.
    pub run_id: Uuid,
    /// Registry name of the workflow that ran.
    pub workflow: String,
    /// When the run started.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// The final output: the output of the last declared step or loop.
    pub final_output: String,
    /// Output per executed step/loop (partial on failure).
    pub step_outputs: BTreeMap<String, String>,
    /// Provider that produced each `run` step's output.
    pub provider_used: BTreeMap<String, String>,
    /// Load-time warnings and runtime diagnostics.
    pub diagnostics: Vec<Diagnostic>,
    /// Failure message when the run did not complete cleanly.
    pub failure: Option<String>,
}

impl RunOutcome {
    /// Whether the run completed without an unresolved failure.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Result of one workflow execution (internal; child invocations bubble
/// only the final output to the caller).
#[derive(Debug)]
pub(crate) struct WorkflowRun {
    pub final_output: String,
    pub step_outputs: BTreeMap<String, String>,
    pub provider_used: BTreeMap<String, String>,
    pub diagnostics: Vec<Diagnostic>,
    pub failure: Option<String>,
}

/// The workflow engine.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    providers: Arc<ProviderSet>,
}

impl Engine {
    /// Creates an engine over a loaded registry.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            providers: Arc::new(ProviderSet::new()),
        }
    }

    /// Registers an LLM provider.
    pub fn with_provider(self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.register_llm(name, provider);
        self
    }

    /// Registers an embedding provider.
    pub fn with_embedding_provider(
        self,
        name: impl Into<String>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        self.providers.register_embedding(name, provider);
        self
    }

    /// Registers a RAG provider under a server identifier.
    pub fn with_rag_provider(self, server: impl Into<String>, provider: Arc<dyn RagProvider>) -> Self {
        self.providers.register_rag(server, provider);
        self
    }

    /// The workflow registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    /// Runs a workflow by registry name with a single input text.
    ///
    /// The caller may cancel at any time through `cancel`; workers
    /// observe the token at every suspension point.
    pub async fn run(
        &self,
        name: &str,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let (reg_name, workflow) = self.registry.resolve(name, "")?;
        if workflow.steps.is_empty() && workflow.loops.is_empty() {
            return Err(FlowError::Validation {
                workflow: workflow.name.clone(),
                diagnostics: vec![Diagnostic::error(
                    reg_name.clone(),
                    "workflow has no steps or loops and cannot be invoked",
                )],
            });
        }

        let run_id = Uuid::new_v4();
        let started_at = chrono::Utc::now();
        let started = std::time::Instant::now();
        info!(run_id = %run_id, workflow = %reg_name, "Starting run");

        let mut scope = Scope::new(workflow.env.clone());
        scope.set("input", input);

        let run = self
            .execute_workflow(workflow, reg_name.clone(), scope, 0, cancel)
            .await?;

        let mut diagnostics: Vec<Diagnostic> = self.registry.diagnostics().to_vec();
        diagnostics.extend(run.diagnostics);

        Ok(RunOutcome {
            run_id,
            workflow: reg_name,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            final_output: run.final_output,
            step_outputs: run.step_outputs,
            provider_used: run.provider_used,
            diagnostics,
            failure: run.failure,
        })
    }

    /// Executes one workflow to completion. Child invocations recurse
    /// through here with their own fresh scope.
    pub(crate) fn execute_workflow(
        &self,
        workflow: Arc<Workflow>,
        reg_name: String,
        scope: Scope,
        depth: usize,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<WorkflowRun>> {
        let engine = self.clone();
        async move {
            let scheduler =
                Scheduler::new(engine, workflow, reg_name, scope, depth, cancel)?;
            scheduler.execute().await
        }
        .boxed()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflows", &self.registry.list().len())
            .field("providers", &self.providers)
            .finish()
    }
}
