// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Step scheduling.
//!
//! Sequential mode walks a document-order-stable topological order.
//! Parallel mode keeps an explicit ready queue and a completion channel:
//! up to `max_workers` workers execute dispatched steps, post results
//! back, and the scheduler applies them to the scope serially. Workers
//! never write to the scope.

use crate::dag::WorkflowDag;
use crate::dispatch::{self, NodeSpec, StepOutcome};
use crate::engine::{Engine, WorkflowRun};
use crate::error::{Diagnostic, FlowError, Result};
use crate::interpolate::interpolate_lenient;
use crate::metrics;
use crate::model::{OnErrorPolicy, Workflow};
use crate::scope::Scope;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Execution status for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Waiting for dependencies.
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed with an error.
    Failed,
    /// Skipped (false condition or failed dependency).
    Skipped,
}

pub(crate) struct Scheduler {
    engine: Engine,
    workflow: Arc<Workflow>,
    reg_name: String,
    dag: WorkflowDag,
    scope: Scope,
    statuses: HashMap<String, StepStatus>,
    provider_used: BTreeMap<String, String>,
    diagnostics: Vec<Diagnostic>,
    vectors: HashMap<String, Vec<Vec<f32>>>,
    depth: usize,
    cancel: CancellationToken,
    failure: Option<String>,
}

impl Scheduler {
    pub fn new(
        engine: Engine,
        workflow: Arc<Workflow>,
        reg_name: String,
        scope: Scope,
        depth: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let dag = WorkflowDag::from_workflow(&workflow)?;
        let statuses = workflow
            .node_names()
            .into_iter()
            .map(|name| (name.to_string(), StepStatus::Pending))
            .collect();
        Ok(Self {
            engine,
            workflow,
            reg_name,
            dag,
            scope,
            statuses,
            provider_used: BTreeMap::new(),
            diagnostics: Vec::new(),
            vectors: HashMap::new(),
            depth,
            cancel,
            failure: None,
        })
    }

    pub async fn execute(mut self) -> Result<WorkflowRun> {
        if self.dag.is_empty() {
            return Err(FlowError::Registry(format!(
                "workflow '{}' has no steps or loops to execute",
                self.workflow.name
            )));
        }

        let parallel = self.workflow.execution.parallel.unwrap_or(false);
        info!(
            workflow = %self.workflow.name,
            parallel,
            nodes = self.dag.len(),
            "Starting workflow execution"
        );

        if parallel {
            self.execute_parallel().await?;
        } else {
            self.execute_sequential().await?;
        }

        let final_output = self
            .workflow
            .final_node_name()
            .and_then(|name| self.scope.get(name))
            .unwrap_or_default();

        if let Some(failure) = &self.failure {
            warn!(workflow = %self.workflow.name, failure = %failure, "Workflow completed with failure");
        } else {
            info!(workflow = %self.workflow.name, "Workflow completed successfully");
        }

        // Reserved entries (the seeded input, loop counters) are scope
        // plumbing, not step outputs.
        let step_outputs = self
            .scope
            .entries()
            .iter()
            .filter(|(key, _)| !crate::scope::is_builtin(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(WorkflowRun {
            final_output,
            step_outputs,
            provider_used: self.provider_used,
            diagnostics: self.diagnostics,
            failure: self.failure,
        })
    }

    async fn execute_sequential(&mut self) -> Result<()> {
        let order = self.dag.execution_order()?;
        let mut blocked: HashSet<String> = HashSet::new();

        for name in order {
            if self.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            if self.statuses.get(&name) == Some(&StepStatus::Completed) {
                // Already ran as another step's fallback.
                continue;
            }
            if blocked.contains(&name) {
                self.mark_skipped(&name, "dependency failed");
                continue;
            }
            if !self.condition_holds(&name) {
                self.mark_skipped(&name, "condition evaluated false");
                continue;
            }

            match self.run_node(&name).await {
                Ok((outcome, fallback_used)) => {
                    self.apply(&name, outcome);
                    if let Some(fallback) = fallback_used {
                        self.adopt_fallback(&name, &fallback);
                    }
                }
                Err(FlowError::Cancelled) => return Err(FlowError::Cancelled),
                Err(err) => {
                    self.record_failure(&name, &err);
                    match self.policy() {
                        OnErrorPolicy::Continue => {
                            for dependent in self.dag.transitive_dependents(&name) {
                                blocked.insert(dependent);
                            }
                        }
                        // Sequential execution has nothing in flight to
                        // cancel or drain.
                        OnErrorPolicy::CancelAll | OnErrorPolicy::CompleteRunning => return Ok(()),
                    }
                }
            }
        }
        Ok(())
    }

    async fn execute_parallel(&mut self) -> Result<()> {
        let max_workers = self
            .workflow
            .execution
            .max_workers
            .unwrap_or(crate::context::DEFAULT_MAX_WORKERS);
        let worker_cancel = self.cancel.child_token();

        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut ready: VecDeque<String> = VecDeque::new();
        let mut pending: Vec<String> = Vec::new();
        for name in self.workflow.node_names() {
            let degree = self.dag.dependencies(name).len();
            indegree.insert(name.to_string(), degree);
            pending.push(name.to_string());
        }
        // Seed the ready queue in document order.
        for name in &pending {
            if indegree[name] == 0 {
                ready.push_back(name.clone());
            }
        }

        let (tx, mut rx) =
            mpsc::channel::<(String, Result<(StepOutcome, Option<String>)>)>(self.dag.len().max(1));
        let mut in_flight = 0usize;
        let mut admitting = true;

        loop {
            while admitting && in_flight < max_workers {
                let Some(name) = ready.pop_front() else { break };
                if self.cancel.is_cancelled() {
                    return Err(FlowError::Cancelled);
                }
                if !self.condition_holds(&name) {
                    self.mark_skipped(&name, "condition evaluated false");
                    Self::unlock_dependents(&self.dag, &name, &mut indegree, &mut ready);
                    continue;
                }

                self.statuses.insert(name.clone(), StepStatus::Running);
                let task = self.spawn_input(&name);
                let tx = tx.clone();
                let cancel = worker_cancel.clone();
                tokio::spawn(async move {
                    let result = run_node_task(task, cancel).await;
                    let _ = tx.send((result.0, result.1)).await;
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let Some((name, result)) = rx.recv().await else { break };
            in_flight -= 1;

            match result {
                Ok((outcome, fallback_used)) => {
                    self.apply(&name, outcome);
                    if let Some(fallback) = fallback_used {
                        self.adopt_fallback(&name, &fallback);
                        indegree.remove(&fallback);
                        ready.retain(|n| n != &fallback);
                        Self::unlock_dependents(&self.dag, &fallback, &mut indegree, &mut ready);
                    }
                    Self::unlock_dependents(&self.dag, &name, &mut indegree, &mut ready);
                }
                Err(FlowError::Cancelled) => {
                    if self.cancel.is_cancelled() {
                        return Err(FlowError::Cancelled);
                    }
                    // A worker observed the on_error cancellation; the
                    // failure that triggered it is already recorded.
                }
                Err(err) => {
                    self.record_failure(&name, &err);
                    match self.policy() {
                        OnErrorPolicy::CancelAll => {
                            admitting = false;
                            worker_cancel.cancel();
                        }
                        OnErrorPolicy::CompleteRunning => {
                            admitting = false;
                        }
                        OnErrorPolicy::Continue => {
                            for dependent in self.dag.transitive_dependents(&name) {
                                self.mark_skipped(&dependent, "dependency failed");
                                indegree.remove(&dependent);
                                ready.retain(|n| n != &dependent);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Marks a node's direct dependents ready once their last
    /// dependency resolves.
    fn unlock_dependents(
        dag: &WorkflowDag,
        name: &str,
        indegree: &mut HashMap<String, usize>,
        ready: &mut VecDeque<String>,
    ) {
        for dependent in dag.dependents(name) {
            if let Some(count) = indegree.get_mut(dependent) {
                if *count > 0 {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent.to_string());
                    }
                }
            }
        }
    }

    /// Assembles the owned inputs a worker needs for one node.
    fn spawn_input(&self, name: &str) -> NodeTask {
        NodeTask {
            engine: self.engine.clone(),
            workflow: self.workflow.clone(),
            reg_name: self.reg_name.clone(),
            node: self.make_node(name),
            scope: self.scope.clone(),
            vector_seed: self.vector_seed(name),
            depth: self.depth,
        }
    }

    async fn run_node(&self, name: &str) -> Result<(StepOutcome, Option<String>)> {
        let task = self.spawn_input(name);
        let (_, result) = run_node_task(task, self.cancel.clone()).await;
        result
    }

    fn make_node(&self, name: &str) -> NodeSpec {
        if let Some(step) = self.workflow.find_step(name) {
            NodeSpec::Step(step.clone())
        } else {
            let loop_ = self
                .workflow
                .find_loop(name)
                .expect("validated node name")
                .clone();
            NodeSpec::Loop {
                loop_,
                name: name.to_string(),
            }
        }
    }

    fn vector_seed(&self, name: &str) -> Option<Vec<Vec<f32>>> {
        let step = self.workflow.find_step(name)?;
        let source = step.rag.as_ref()?.vector_from.as_ref()?;
        self.vectors.get(source).cloned()
    }

    fn policy(&self) -> OnErrorPolicy {
        self.workflow
            .execution
            .on_error
            .unwrap_or(OnErrorPolicy::CancelAll)
    }

    fn condition_holds(&self, name: &str) -> bool {
        let Some(step) = self.workflow.find_step(name) else {
            return true;
        };
        let Some(condition) = &step.if_ else {
            return true;
        };
        let resolved = interpolate_lenient(condition, &self.scope);
        let holds = evaluate_condition(&resolved);
        debug!(step = %name, condition = %condition, holds, "Evaluated condition");
        holds
    }

    fn apply(&mut self, name: &str, outcome: StepOutcome) {
        self.scope.set(name, outcome.text);
        for (key, value) in outcome.extra_entries {
            self.scope.set(key, value);
        }
        if let Some(vectors) = outcome.vectors {
            self.vectors.insert(name.to_string(), vectors);
        }
        if let Some(provider) = outcome.provider {
            self.provider_used.insert(name.to_string(), provider);
        }
        self.diagnostics.extend(outcome.diagnostics);
        self.statuses.insert(name.to_string(), StepStatus::Completed);
        metrics::STEPS_EXECUTED
            .with_label_values(&[outcome.mode, "completed"])
            .inc();
    }

    /// A fallback step ran in place of a failed one: its output is
    /// already stored under the failed step's name; mirror it under the
    /// fallback's own name and mark it completed so it is not run again.
    fn adopt_fallback(&mut self, original: &str, fallback: &str) {
        if self.statuses.get(fallback) == Some(&StepStatus::Completed) {
            return;
        }
        if let Some(output) = self.scope.get(original) {
            self.scope.set(fallback, output);
        }
        self.statuses
            .insert(fallback.to_string(), StepStatus::Completed);
        self.diagnostics.push(Diagnostic::info(
            original.to_string(),
            format!("fallback step '{}' ran in its place", fallback),
        ));
    }

    fn mark_skipped(&mut self, name: &str, reason: &str) {
        debug!(step = %name, reason, "Skipping step");
        self.statuses.insert(name.to_string(), StepStatus::Skipped);
        self.diagnostics
            .push(Diagnostic::info(name.to_string(), format!("skipped: {}", reason)));
        metrics::STEPS_EXECUTED
            .with_label_values(&["none", "skipped"])
            .inc();
    }

    fn record_failure(&mut self, name: &str, err: &FlowError) {
        warn!(step = %name, error = %err, "Step failed");
        self.statuses.insert(name.to_string(), StepStatus::Failed);
        self.diagnostics.push(Diagnostic::error(
            name.to_string(),
            format!("step failed: {}", err),
        ));
        if self.failure.is_none() {
            self.failure = Some(format!("step '{}' failed: {}", name, err));
        }
        metrics::STEPS_EXECUTED
            .with_label_values(&["none", "failed"])
            .inc();
    }
}

/// Owned inputs for one node execution.
struct NodeTask {
    engine: Engine,
    workflow: Arc<Workflow>,
    reg_name: String,
    node: NodeSpec,
    scope: Scope,
    vector_seed: Option<Vec<Vec<f32>>>,
    depth: usize,
}

/// Executes a node; on failure, runs its `on_error.fallback` step in its
/// place when one is configured. Returns the node name alongside the
/// result so completions can be posted through the channel.
async fn run_node_task(
    task: NodeTask,
    cancel: CancellationToken,
) -> (String, Result<(StepOutcome, Option<String>)>) {
    let name = task.node.name().to_string();
    let fallback_name = match &task.node {
        NodeSpec::Step(step) => step
            .on_error
            .as_ref()
            .and_then(|policy| policy.fallback.clone()),
        NodeSpec::Loop { .. } => None,
    };

    let result = dispatch::execute_node(
        task.engine.clone(),
        task.workflow.clone(),
        task.reg_name.clone(),
        task.node,
        task.scope.clone(),
        task.vector_seed,
        task.depth,
        cancel.clone(),
    )
    .await;

    match result {
        Ok(outcome) => (name, Ok((outcome, None))),
        Err(FlowError::Cancelled) => (name, Err(FlowError::Cancelled)),
        Err(err) => {
            let Some(fallback) = fallback_name else {
                return (name, Err(err));
            };
            let Some(step) = task.workflow.find_step(&fallback) else {
                return (name, Err(err));
            };
            warn!(step = %name, fallback = %fallback, error = %err, "Running fallback step");
            let result = dispatch::execute_node(
                task.engine,
                task.workflow.clone(),
                task.reg_name,
                NodeSpec::Step(step.clone()),
                task.scope,
                None,
                task.depth,
                cancel,
            )
            .await;
            match result {
                Ok(outcome) => (name, Ok((outcome, Some(fallback)))),
                Err(fallback_err) => (name, Err(fallback_err)),
            }
        }
    }
}

/// Evaluates an interpolated `if:` condition by string comparison:
/// `==`, `!=` and `contains` operators, otherwise plain truthiness.
fn evaluate_condition(text: &str) -> bool {
    fn clean(side: &str) -> &str {
        side.trim().trim_matches('"').trim_matches('\'')
    }
    if let Some((lhs, rhs)) = text.split_once("==") {
        return clean(lhs) == clean(rhs);
    }
    if let Some((lhs, rhs)) = text.split_once("!=") {
        return clean(lhs) != clean(rhs);
    }
    if let Some((lhs, rhs)) = text.split_once(" contains ") {
        return clean(lhs).contains(clean(rhs));
    }
    let trimmed = text.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("false") && trimmed != "0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_condition_equality() {
        assert!(evaluate_condition("PASS == PASS"));
        assert!(evaluate_condition("\"PASS\" == PASS"));
        assert!(!evaluate_condition("PASS == FAIL"));
    }

    #[test]
    fn test_evaluate_condition_inequality() {
        assert!(evaluate_condition("PASS != FAIL"));
        assert!(!evaluate_condition("x != x"));
    }

    #[test]
    fn test_evaluate_condition_contains() {
        assert!(evaluate_condition("all tests PASS here contains PASS"));
        assert!(!evaluate_condition("nothing here contains PASS"));
    }

    #[test]
    fn test_evaluate_condition_truthiness() {
        assert!(evaluate_condition("yes"));
        assert!(!evaluate_condition(""));
        assert!(!evaluate_condition("false"));
        assert!(!evaluate_condition("0"));
        assert!(!evaluate_condition("  "));
    }
}
