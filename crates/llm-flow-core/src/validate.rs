// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow validation.
//!
//! Runs once per workflow at load time. Any error-severity diagnostic
//! makes the workflow unloadable; warnings block only under strict
//! validation.

use crate::error::{Diagnostic, Severity};
use crate::interpolate::referenced_keys;
use crate::model::{Consensus, ExecutionContext, Loop, Step, Workflow};
use crate::scope::is_builtin;
use std::collections::{BTreeMap, BTreeSet};

/// Validates a workflow, producing all diagnostics.
pub fn validate(workflow: &Workflow) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    let names = collect_node_names(workflow, &mut diags);

    validate_execution_context(&workflow.execution, &workflow.name, true, &mut diags);

    for step in &workflow.steps {
        validate_step(step, workflow, &names, &mut diags);
    }
    for loop_ in &workflow.loops {
        let name = loop_.name.clone().unwrap_or_else(|| "<unnamed>".to_string());
        if loop_.name.is_none() {
            diags.push(
                Diagnostic::error(name.clone(), "top-level loop is missing a name")
                    .with_hint("give every entry under loops: a unique name"),
            );
        }
        validate_loop(loop_, &name, &mut diags);
        validate_needs(&name, &loop_.needs, &names, &mut diags);
        validate_references(
            &name,
            loop_.with.values().map(String::as_str),
            &loop_.needs,
            &names,
            &mut diags,
        );
    }

    if let Some(cycle) = find_cycle(workflow) {
        diags.push(
            Diagnostic {
                severity: Severity::Error,
                step: Some(cycle[0].clone()),
                message: format!("dependency cycle: {}", cycle.join(" -> ")),
                hint: Some("remove one of the needs: edges in the cycle".to_string()),
            },
        );
    }

    diags
}

/// Whether the diagnostics block loading. Errors always block; warnings
/// block under strict validation.
pub fn has_blocking(diagnostics: &[Diagnostic], strict: bool) -> bool {
    diagnostics.iter().any(|d| match d.severity {
        Severity::Error => true,
        Severity::Warning => strict,
        Severity::Info => false,
    })
}

fn collect_node_names(workflow: &Workflow, diags: &mut Vec<Diagnostic>) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut outputs_seen: BTreeMap<&str, &str> = BTreeMap::new();

    for step in &workflow.steps {
        if !names.insert(step.name.clone()) {
            diags.push(Diagnostic::error(
                step.name.clone(),
                "duplicate step/loop name",
            ));
        }
        for output in step.outputs.keys() {
            outputs_seen.insert(output.as_str(), step.name.as_str());
        }
    }
    for loop_ in &workflow.loops {
        if let Some(name) = &loop_.name {
            if !names.insert(name.clone()) {
                diags.push(Diagnostic::error(name.clone(), "duplicate step/loop name"));
            }
        }
    }
    for (output, owner) in outputs_seen {
        if names.contains(output) {
            diags.push(
                Diagnostic::error(
                    owner.to_string(),
                    format!("output '{}' collides with a step/loop name", output),
                )
                .with_hint("rename the outputs: entry"),
            );
        }
    }
    names
}

fn validate_execution_context(
    ctx: &ExecutionContext,
    owner: &str,
    workflow_level: bool,
    diags: &mut Vec<Diagnostic>,
) {
    if let Some(workers) = ctx.max_workers {
        if !(1..=100).contains(&workers) {
            diags.push(
                Diagnostic::error(owner.to_string(), format!("max_workers {} out of range", workers))
                    .with_hint("max_workers must be between 1 and 100"),
            );
        }
    }
    if let Some(t) = ctx.temperature {
        if !(0.0..=2.0).contains(&t) {
            diags.push(Diagnostic::error(
                owner.to_string(),
                format!("temperature {} out of range (0.0-2.0)", t),
            ));
        }
    }
    if ctx.max_tokens == Some(0) {
        diags.push(Diagnostic::error(
            owner.to_string(),
            "max_tokens must be positive",
        ));
    }
    if ctx.provider.is_some() != ctx.model.is_some() {
        diags.push(
            Diagnostic::error(owner.to_string(), "provider and model must be set together")
                .with_hint("specify both provider: and model:, or a providers: chain"),
        );
    }
    if ctx.provider.is_some() && !ctx.providers.is_empty() {
        diags.push(
            Diagnostic::error(
                owner.to_string(),
                "provider/model and providers chain are mutually exclusive",
            )
            .with_hint("keep the chain, or the single pair, not both"),
        );
    }
    if workflow_level && !ctx.parallel.unwrap_or(false) {
        if ctx.max_workers.is_some() {
            diags.push(Diagnostic::warning(
                owner.to_string(),
                "max_workers has no effect without parallel: true",
            ));
        }
        if ctx.on_error.is_some() {
            diags.push(Diagnostic::warning(
                owner.to_string(),
                "on_error has no effect without parallel: true",
            ));
        }
    }
}

fn validate_step(
    step: &Step,
    workflow: &Workflow,
    names: &BTreeSet<String>,
    diags: &mut Vec<Diagnostic>,
) {
    let selectors = step.mode_selectors();
    match selectors.len() {
        0 => {
            diags.push(
                Diagnostic::error(step.name.clone(), "step has no execution mode")
                    .with_hint("set exactly one of run, template, embeddings, consensus, loop, rag"),
            );
        }
        1 => {}
        _ => {
            diags.push(
                Diagnostic::error(
                    step.name.clone(),
                    format!("step has multiple execution modes: {}", selectors.join(", ")),
                )
                .with_hint("execution modes are mutually exclusive"),
            );
        }
    }

    validate_execution_context(&step.overrides(), &step.name, false, diags);
    validate_needs(&step.name, &step.needs, names, diags);

    // {{x}} references to sibling nodes must be declared in needs.
    let mut templates: Vec<&str> = Vec::new();
    if let Some(run) = &step.run {
        templates.push(run);
    }
    if let Some(template) = &step.template {
        templates.extend(template.with.values().map(String::as_str));
    }
    if let Some(embeddings) = &step.embeddings {
        templates.push(&embeddings.input);
    }
    if let Some(consensus) = &step.consensus {
        templates.push(&consensus.prompt);
    }
    if let Some(loop_) = &step.loop_ {
        templates.extend(loop_.with.values().map(String::as_str));
    }
    if let Some(rag) = &step.rag {
        templates.push(&rag.query);
    }
    if let Some(for_each) = &step.for_each {
        templates.push(for_each);
    }
    validate_references(&step.name, templates, &step.needs, names, diags);

    if let Some(consensus) = &step.consensus {
        validate_consensus(consensus, &step.name, diags);
    }
    if let Some(loop_) = &step.loop_ {
        validate_loop(loop_, &step.name, diags);
    }
    if let Some(rag) = &step.rag {
        if let Some(source) = &rag.vector_from {
            if !step.needs.contains(source) {
                diags.push(
                    Diagnostic::error(
                        step.name.clone(),
                        format!("vector_from '{}' is not listed in needs", source),
                    )
                    .with_hint("add the embeddings step to needs"),
                );
            }
        }
    }
    if step.item_name.is_some() && step.for_each.is_none() {
        diags.push(Diagnostic::warning(
            step.name.clone(),
            "item_name has no effect without for_each",
        ));
    }
    if let Some(policy) = &step.on_error {
        if let Some(fallback) = &policy.fallback {
            if fallback == &step.name {
                diags.push(Diagnostic::error(
                    step.name.clone(),
                    "fallback step cannot be the step itself",
                ));
            } else if !names.contains(fallback) {
                diags.push(Diagnostic::error(
                    step.name.clone(),
                    format!("fallback step '{}' does not exist", fallback),
                ));
            }
        }
    }
    // Mode-provider presence: run and embeddings consume the effective
    // provider chain directly.
    if (step.run.is_some() || step.embeddings.is_some())
        && effective_chain_is_empty(&workflow.execution, step)
    {
        diags.push(
            Diagnostic::error(step.name.clone(), "no provider configured for this step")
                .with_hint("set provider/model or providers at the workflow or step level"),
        );
    }
}

fn effective_chain_is_empty(workflow: &ExecutionContext, step: &Step) -> bool {
    let has_single = |ctx: &ExecutionContext| ctx.provider.is_some() && ctx.model.is_some();
    let overrides = step.overrides();
    !has_single(&overrides)
        && overrides.providers.is_empty()
        && !has_single(workflow)
        && workflow.providers.is_empty()
}

fn validate_needs(
    owner: &str,
    needs: &[String],
    names: &BTreeSet<String>,
    diags: &mut Vec<Diagnostic>,
) {
    for dep in needs {
        if dep == owner {
            diags.push(Diagnostic::error(owner.to_string(), "step depends on itself"));
        } else if !names.contains(dep) {
            diags.push(
                Diagnostic::error(
                    owner.to_string(),
                    format!("needs references unknown step '{}'", dep),
                )
                .with_hint("needs entries must name sibling steps or loops"),
            );
        }
    }
}

fn validate_references<'a>(
    owner: &str,
    templates: impl IntoIterator<Item = &'a str>,
    needs: &[String],
    names: &BTreeSet<String>,
    diags: &mut Vec<Diagnostic>,
) {
    for template in templates {
        for key in referenced_keys(template) {
            if is_builtin(&key) || key == owner {
                continue;
            }
            if names.contains(&key) && !needs.iter().any(|n| n == &key) {
                diags.push(
                    Diagnostic::error(
                        owner.to_string(),
                        format!("references '{{{{{}}}}}' but does not list it in needs", key),
                    )
                    .with_hint(format!("add needs: [{}]", key)),
                );
            }
        }
    }
}

fn validate_loop(loop_: &Loop, owner: &str, diags: &mut Vec<Diagnostic>) {
    if loop_.workflow.trim().is_empty() {
        diags.push(Diagnostic::error(owner.to_string(), "loop workflow is empty"));
    }
    if loop_.max_iterations == 0 {
        diags.push(
            Diagnostic::error(owner.to_string(), "max_iterations must be at least 1"),
        );
    }
    if loop_.until.trim().is_empty() {
        diags.push(
            Diagnostic::error(owner.to_string(), "loop until condition is empty")
                .with_hint("until is a natural-language exit condition"),
        );
    }
}

fn validate_consensus(consensus: &Consensus, owner: &str, diags: &mut Vec<Diagnostic>) {
    if consensus.prompt.trim().is_empty() {
        diags.push(Diagnostic::error(owner.to_string(), "consensus prompt is empty"));
    }
    if consensus.executions.len() < 2 {
        diags.push(
            Diagnostic::error(
                owner.to_string(),
                format!(
                    "consensus requires at least 2 executions, found {}",
                    consensus.executions.len()
                ),
            )
            .with_hint("agreement over a single execution is meaningless"),
        );
    }
}

/// DFS cycle detection with white/grey/black coloring; returns an
/// explicit cycle path when one exists.
fn find_cycle(workflow: &Workflow) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for step in &workflow.steps {
        edges.insert(&step.name, step.needs.iter().map(String::as_str).collect());
    }
    for loop_ in &workflow.loops {
        if let Some(name) = &loop_.name {
            edges.insert(name, loop_.needs.iter().map(String::as_str).collect());
        }
    }

    let mut colors: BTreeMap<&str, Color> =
        edges.keys().map(|&name| (name, Color::White)).collect();

    fn visit<'a>(
        node: &'a str,
        edges: &BTreeMap<&'a str, Vec<&'a str>>,
        colors: &mut BTreeMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(node, Color::Grey);
        path.push(node);
        for &dep in edges.get(node).into_iter().flatten() {
            match colors.get(dep) {
                Some(Color::Grey) => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Some(Color::White) => {
                    if let Some(cycle) = visit(dep, edges, colors, path) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }
        path.pop();
        colors.insert(node, Color::Black);
        None
    }

    let names: Vec<&str> = edges.keys().copied().collect();
    for name in names {
        if colors.get(name) == Some(&Color::White) {
            let mut path = Vec::new();
            if let Some(cycle) = visit(name, &edges, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
