// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine error types.

use crate::providers::ProviderError;
use std::time::Duration;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks loading / execution.
    Error,
    /// Reported, does not block (blocks under strict validation).
    Warning,
    /// Informational runtime record (e.g. loop evaluator verdicts).
    Info,
}

/// A single validation or runtime diagnostic.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    /// Severity class.
    pub severity: Severity,
    /// Step or loop the diagnostic refers to, if any.
    pub step: Option<String>,
    /// One-line message.
    pub message: String,
    /// One-line hint for resolving the problem, if any.
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Creates an error diagnostic attached to a step.
    pub fn error(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            step: Some(step.into()),
            message: message.into(),
            hint: None,
        }
    }

    /// Creates a warning diagnostic attached to a step.
    pub fn warning(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            step: Some(step.into()),
            message: message.into(),
            hint: None,
        }
    }

    /// Creates an informational runtime diagnostic.
    pub fn info(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            step: Some(step.into()),
            message: message.into(),
            hint: None,
        }
    }

    /// Attaches a hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step {
            Some(step) => write!(f, "[{}] {}", step, self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {})", hint)?;
        }
        Ok(())
    }
}

/// Engine error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Workflow failed validation. Never retried; carries all diagnostics.
    #[error("workflow '{workflow}' failed validation: {}", format_diagnostics(.diagnostics))]
    Validation {
        /// Workflow name.
        workflow: String,
        /// Error-severity diagnostics that blocked the load.
        diagnostics: Vec<Diagnostic>,
    },

    /// A `{{placeholder}}` could not be resolved at runtime.
    #[error("step '{step}': unresolved placeholder '{{{{{key}}}}}'")]
    Interpolation {
        /// Step whose prompt or inputs referenced the key.
        step: String,
        /// The missing key.
        key: String,
    },

    /// Transient provider failure (network, timeout, 5xx, rate limit).
    /// Eligible for provider fallback and step retry.
    #[error("transient provider error from '{provider}': {source}")]
    TransientProvider {
        /// Provider that failed.
        provider: String,
        /// Underlying provider error.
        #[source]
        source: ProviderError,
    },

    /// Permanent provider failure (auth, bad model, malformed request).
    #[error("permanent provider error from '{provider}': {source}")]
    PermanentProvider {
        /// Provider that failed.
        provider: String,
        /// Underlying provider error.
        #[source]
        source: ProviderError,
    },

    /// The loop exit evaluator produced unparseable output. Treated as NO
    /// by the controller; surfaced only through diagnostics.
    #[error("loop '{name}' iteration {iteration}: unparseable evaluator output '{raw}'")]
    LoopCondition {
        /// Loop name.
        name: String,
        /// Iteration at which the evaluator ran.
        iteration: u32,
        /// Raw evaluator text.
        raw: String,
    },

    /// Consensus did not satisfy its aggregation rule and the step
    /// required success.
    #[error("step '{step}': consensus rule '{rule}' not satisfied ({agreed}/{total} agreed)")]
    Consensus {
        /// Consensus step name.
        step: String,
        /// Aggregation rule text.
        rule: String,
        /// Count of agreeing votes.
        agreed: usize,
        /// Total votes considered.
        total: usize,
    },

    /// Child workflow recursion exceeded the composition depth cap.
    #[error("workflow '{workflow}' exceeds the composition depth cap of {max_depth}")]
    CompositionDepthExceeded {
        /// Workflow that would have been invoked.
        workflow: String,
        /// The cap.
        max_depth: usize,
    },

    /// Cooperative cancellation observed.
    #[error("execution cancelled")]
    Cancelled,

    /// A referenced step does not exist at runtime.
    #[error("step '{0}' not found")]
    StepNotFound(String),

    /// A referenced workflow could not be resolved.
    #[error("workflow '{name}' not found (checked '{sibling}' and '{root}')")]
    WorkflowNotFound {
        /// Requested name.
        name: String,
        /// Sibling-directory probe that missed.
        sibling: String,
        /// Registry-root probe that missed.
        root: String,
    },

    /// Step execution exceeded its configured timeout.
    #[error("step '{step}' timed out after {timeout:?}")]
    Timeout {
        /// Step name.
        step: String,
        /// Configured bound.
        timeout: Duration,
    },

    /// Step failed and no error policy could resolve it.
    #[error("step '{step}' failed: {message}")]
    StepFailed {
        /// Step name.
        step: String,
        /// Failure description.
        message: String,
    },

    /// Workflow file could not be read.
    #[error("failed to read '{path}': {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Workflow file could not be parsed.
    #[error("failed to parse '{path}': {message}")]
    Parse {
        /// File path.
        path: String,
        /// Location and hint, as reported by the YAML parser.
        message: String,
    },

    /// Registry-level load error (duplicate index, schema tag mismatch).
    #[error("{0}")]
    Registry(String),
}

impl FlowError {
    /// Whether this error is eligible for retry / provider fallback.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FlowError::TransientProvider { .. } | FlowError::Timeout { .. }
        )
    }

    /// Wraps a provider error, classifying it as transient or permanent.
    pub fn from_provider(provider: impl Into<String>, source: ProviderError) -> Self {
        let provider = provider.into();
        if source.is_transient() {
            FlowError::TransientProvider { provider, source }
        } else {
            FlowError::PermanentProvider { provider, source }
        }
    }
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
