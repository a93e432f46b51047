// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow discovery, loading and name resolution.
//!
//! Workflows are indexed by their path relative to the registry root with
//! the extension stripped. References resolve with directory-aware
//! precedence: exact path, then the caller's directory, then the root.

use crate::error::{Diagnostic, FlowError, Result};
use crate::model::{Workflow, SCHEMA_TAG};
use crate::validate;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

/// The loaded, indexed collection of workflows.
#[derive(Debug, Default)]
pub struct Registry {
    workflows: BTreeMap<String, Arc<Workflow>>,
    diagnostics: Vec<Diagnostic>,
}

impl Registry {
    /// Loads every `*.yaml`/`*.yml` file under `root` recursively.
    ///
    /// A workflow with any error-severity diagnostic makes the whole load
    /// fail; warning diagnostics are collected and exposed via
    /// [`Registry::diagnostics`].
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut registry = Self::default();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| FlowError::Io {
                path: root.display().to_string(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if ext != "yaml" && ext != "yml" {
                continue;
            }

            let name = registry_name(root, path)?;
            let workflow = load_file(path, &mut registry.diagnostics)?;
            debug!(name = %name, file = %path.display(), "Loaded workflow");

            if registry
                .workflows
                .insert(name.clone(), Arc::new(workflow))
                .is_some()
            {
                return Err(FlowError::Registry(format!(
                    "duplicate workflow '{}' (both .yaml and .yml present?)",
                    name
                )));
            }
        }

        info!(count = registry.workflows.len(), root = %root.display(), "Registry loaded");
        Ok(registry)
    }

    /// Builds a registry from in-memory workflows, validating each.
    /// Names follow the same relative-path convention as [`Registry::load`].
    pub fn from_workflows(workflows: Vec<(String, Workflow)>) -> Result<Self> {
        let mut registry = Self::default();
        for (name, mut workflow) in workflows {
            registry.diagnostics.extend(workflow.expand_env());
            check_workflow(&workflow, &name, &mut registry.diagnostics)?;
            if registry
                .workflows
                .insert(name.clone(), Arc::new(workflow))
                .is_some()
            {
                return Err(FlowError::Registry(format!("duplicate workflow '{}'", name)));
            }
        }
        Ok(registry)
    }

    /// Sorted registry names.
    pub fn list(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }

    /// Exact lookup by registry name.
    pub fn get(&self, name: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(name).cloned()
    }

    /// Load-time warning diagnostics.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Resolves a workflow reference from a workflow living in
    /// `calling_dir` (relative to the registry root, `""` for the root).
    ///
    /// Precedence: explicit path, then `calling_dir/name`, then `name`
    /// at the root.
    pub fn resolve(&self, name: &str, calling_dir: &str) -> Result<(String, Arc<Workflow>)> {
        if name.contains('/') {
            return match self.get(name) {
                Some(workflow) => Ok((name.to_string(), workflow)),
                None => Err(FlowError::WorkflowNotFound {
                    name: name.to_string(),
                    sibling: name.to_string(),
                    root: name.to_string(),
                }),
            };
        }

        let sibling = if calling_dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", calling_dir, name)
        };
        if let Some(workflow) = self.get(&sibling) {
            return Ok((sibling, workflow));
        }
        if let Some(workflow) = self.get(name) {
            return Ok((name.to_string(), workflow));
        }
        Err(FlowError::WorkflowNotFound {
            name: name.to_string(),
            sibling,
            root: name.to_string(),
        })
    }
}

/// Directory component of a registry name (`""` for root-level entries).
pub fn registry_dir(name: &str) -> &str {
    name.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn registry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        FlowError::Registry(format!("'{}' is outside the registry root", path.display()))
    })?;
    let stem = relative.with_extension("");
    let parts: Vec<String> = stem
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn load_file(path: &Path, diagnostics: &mut Vec<Diagnostic>) -> Result<Workflow> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| FlowError::Io {
        path: display.clone(),
        source,
    })?;

    let mut workflow: Workflow = serde_yaml::from_str(&content).map_err(|e| {
        let location = e
            .location()
            .map(|l| format!(" at line {}, column {}", l.line(), l.column()))
            .unwrap_or_default();
        FlowError::Parse {
            path: display.clone(),
            message: format!("{}{}", e, location),
        }
    })?;

    diagnostics.extend(workflow.expand_env());
    check_workflow(&workflow, &display, diagnostics)?;
    Ok(workflow)
}

fn check_workflow(
    workflow: &Workflow,
    origin: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<()> {
    if workflow.schema != SCHEMA_TAG {
        return Err(FlowError::Registry(format!(
            "'{}': unsupported schema tag '{}' (this engine supports '{}')",
            origin, workflow.schema, SCHEMA_TAG
        )));
    }
    let diags = validate::validate(workflow);
    if validate::has_blocking(&diags, false) {
        return Err(FlowError::Validation {
            workflow: workflow.name.clone(),
            diagnostics: diags,
        });
    }
    diagnostics.extend(diags);
    Ok(())
}
