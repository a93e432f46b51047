// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow object model.
//!
//! The YAML-facing types are immutable after load; the loader parses,
//! expands `env:` references against the process environment, and hands
//! the result to the validator before it is ever executed.

use crate::error::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Schema tag accepted by this engine version.
pub const SCHEMA_TAG: &str = "llm-flow/v1";

/// Composition depth cap for child workflow invocations.
pub const MAX_COMPOSITION_DEPTH: usize = 10;

/// A declarative workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    /// Schema tag; must equal [`SCHEMA_TAG`].
    #[serde(rename = "$schema")]
    pub schema: String,

    /// Workflow name.
    pub name: String,

    /// Workflow version.
    pub version: String,

    /// Human description.
    pub description: String,

    /// Inheritable execution defaults.
    pub execution: ExecutionContext,

    /// Workflow environment map. Values of the form `${VAR}` are expanded
    /// against the process environment at load time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Ordered steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,

    /// Ordered top-level loops.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loops: Vec<Loop>,
}

impl Workflow {
    /// Names of all steps and loops, in document order (steps first).
    pub fn node_names(&self) -> Vec<&str> {
        self.steps
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.loops.iter().filter_map(|l| l.name.as_deref()))
            .collect()
    }

    /// Looks up a step by name.
    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Looks up a top-level loop by name.
    pub fn find_loop(&self, name: &str) -> Option<&Loop> {
        self.loops
            .iter()
            .find(|l| l.name.as_deref() == Some(name))
    }

    /// Name of the node whose output is the workflow's final output:
    /// the last declared loop, or the last declared step when there are
    /// no loops.
    pub fn final_node_name(&self) -> Option<&str> {
        self.loops
            .iter()
            .filter_map(|l| l.name.as_deref())
            .last()
            .or_else(|| self.steps.last().map(|s| s.name.as_str()))
    }

    /// Expands `${VAR}` references in the `env:` map against the process
    /// environment. Unset variables expand to the empty string and are
    /// reported as warnings.
    pub fn expand_env(&mut self) -> Vec<Diagnostic> {
        let re = env_ref_regex();
        let mut diagnostics = Vec::new();
        for (key, value) in self.env.iter_mut() {
            let expanded = re.replace_all(value, |caps: &regex::Captures<'_>| {
                let var = &caps[1];
                match std::env::var(var) {
                    Ok(v) => v,
                    Err(_) => {
                        diagnostics.push(
                            Diagnostic::warning(
                                self.name.clone(),
                                format!("env '{}': ${{{}}} is not set", key, var),
                            )
                            .with_hint("the value expands to an empty string"),
                        );
                        String::new()
                    }
                }
            });
            *value = expanded.into_owned();
        }
        diagnostics
    }
}

fn env_ref_regex() -> &'static regex::Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Inheritable execution defaults.
///
/// All fields are optional at the YAML level; the effective configuration
/// is computed by layering workflow defaults, step overrides and engine
/// defaults, and must resolve to exactly one of single provider / chain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionContext {
    /// Single provider name. Mutually exclusive with `providers` at the
    /// effective level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Model for the single provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Ordered provider fallback chain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderRef>,

    /// MCP server identifiers available to steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,

    /// Sampling temperature (0.0 - 2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate (positive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Per-call timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Logging level for this workflow's spans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LogLevel>,

    /// Enable bounded-parallel scheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,

    /// Worker count for parallel scheduling (1..=100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Failure policy for parallel scheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnErrorPolicy>,
}

/// One entry of a provider fallback chain or consensus execution list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderRef {
    /// Provider name.
    pub provider: String,

    /// Model name.
    pub model: String,

    /// Temperature override for this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Max-tokens override for this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Timeout override for this entry, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Logging level enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Default level.
    Info,
    /// Verbose.
    Debug,
    /// Everything.
    Trace,
}

/// Scheduler failure policy under parallel execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    /// Cancel all in-flight steps on the first failure.
    CancelAll,
    /// Stop admitting new steps; let running ones finish.
    CompleteRunning,
    /// Skip the failed step's transitive dependents and continue.
    Continue,
}

/// A single DAG node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Step name, unique among steps and loops.
    pub name: String,

    /// `run` mode: an LLM prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,

    /// `template` mode: invoke a child workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateCall>,

    /// `embeddings` mode: generate embeddings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<EmbeddingsSpec>,

    /// `consensus` mode: multi-provider agreement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<Consensus>,

    /// `loop` mode: iterate a child workflow.
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_: Option<Loop>,

    /// `rag` mode: similarity search against a named server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag: Option<RagSpec>,

    /// Provider override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Provider chain override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderRef>,

    /// Server list override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,

    /// Temperature override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Max-tokens override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Timeout override, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Logging override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LogLevel>,

    /// Worker-count override (bounds `for_each` concurrency).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Condition; when it evaluates false the step is skipped and leaves
    /// no scope entry.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,

    /// Names of prior steps/loops this step depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,

    /// Template expression yielding an array to iterate over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,

    /// Scope name for the current item inside `for_each` (default `item`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,

    /// Step-level error policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<StepErrorPolicy>,

    /// Named output extraction: each entry is a template interpolated
    /// against the scope plus `{{result}}` bound to the step's output.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl Step {
    /// The populated execution-mode selectors. The validator requires
    /// exactly one.
    pub fn mode_selectors(&self) -> Vec<&'static str> {
        let mut selectors = Vec::new();
        if self.run.is_some() {
            selectors.push("run");
        }
        if self.template.is_some() {
            selectors.push("template");
        }
        if self.embeddings.is_some() {
            selectors.push("embeddings");
        }
        if self.consensus.is_some() {
            selectors.push("consensus");
        }
        if self.loop_.is_some() {
            selectors.push("loop");
        }
        if self.rag.is_some() {
            selectors.push("rag");
        }
        selectors
    }

    /// Step-level context overrides, viewed as an [`ExecutionContext`].
    pub fn overrides(&self) -> ExecutionContext {
        ExecutionContext {
            provider: self.provider.clone(),
            model: self.model.clone(),
            providers: self.providers.clone(),
            servers: self.servers.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout_seconds: self.timeout_seconds,
            logging: self.logging,
            parallel: None,
            max_workers: self.max_workers,
            on_error: None,
        }
    }
}

/// A `template:` block: child workflow invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateCall {
    /// Child workflow name, resolved relative to the caller's directory.
    pub workflow: String,

    /// Explicit child inputs; this map is the child's sole input.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,
}

/// An `embeddings:` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingsSpec {
    /// Input text template.
    pub input: String,

    /// Embedding model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Requested vector dimensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

/// A `rag:` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RagSpec {
    /// Query text template.
    pub query: String,

    /// Target server identifier.
    pub server: String,

    /// Maximum results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Name of an earlier `embeddings` step whose vectors seed the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_from: Option<String>,
}

/// A `consensus:` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Consensus {
    /// Common prompt sent to every execution.
    pub prompt: String,

    /// Per-execution provider configurations (at least 2).
    pub executions: Vec<ProviderRef>,

    /// Aggregation rule.
    pub aggregation: AggregationRule,

    /// Exclude failed executions instead of failing the consensus.
    #[serde(default)]
    pub allow_partial: bool,

    /// Overall timeout for the fan-out, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Consensus aggregation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationRule {
    /// All votes must be identical.
    Unanimous,
    /// A strict majority must agree.
    Majority,
    /// At least `k` of `n` must agree (e.g. `2/3`), scaled to the actual
    /// execution count.
    Fraction {
        /// Numerator.
        k: u32,
        /// Denominator.
        n: u32,
    },
}

impl AggregationRule {
    /// Parses the aggregation grammar: `unanimous`, `majority`, or `k/n`.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "unanimous" => Some(Self::Unanimous),
            "majority" => Some(Self::Majority),
            other => {
                let (k, n) = other.split_once('/')?;
                let k: u32 = k.trim().parse().ok()?;
                let n: u32 = n.trim().parse().ok()?;
                if k == 0 || n == 0 || k > n {
                    return None;
                }
                Some(Self::Fraction { k, n })
            }
        }
    }

    /// Votes required for agreement out of `total` considered votes.
    pub fn required(&self, total: usize) -> usize {
        match self {
            Self::Unanimous => total,
            Self::Majority => total / 2 + 1,
            Self::Fraction { k, n } => {
                ((total as u64 * *k as u64).div_ceil(*n as u64)) as usize
            }
        }
    }
}

impl fmt::Display for AggregationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unanimous => write!(f, "unanimous"),
            Self::Majority => write!(f, "majority"),
            Self::Fraction { k, n } => write!(f, "{}/{}", k, n),
        }
    }
}

impl Serialize for AggregationRule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AggregationRule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid aggregation rule '{}' (expected unanimous, majority, or k/n)",
                text
            ))
        })
    }
}

/// A `loop` block: iterate a child workflow until an LLM-evaluated
/// condition is met.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Loop {
    /// Loop name. Required for top-level loops; inline step loops take
    /// the step's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Child workflow name.
    pub workflow: String,

    /// Child inputs, re-interpolated each iteration with the loop
    /// variables in scope.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,

    /// Iteration cap (at least 1).
    pub max_iterations: u32,

    /// Natural-language exit condition, evaluated by an LLM after each
    /// iteration.
    pub until: String,

    /// Policy when an iteration fails.
    #[serde(default)]
    pub on_failure: OnFailurePolicy,

    /// When set, the full iteration history is also stored under this
    /// name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulate: Option<String>,

    /// Names of prior steps/loops this loop depends on (top-level loops
    /// participate in the DAG like steps).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,

    /// Evaluator provider override; defaults to the loop's effective
    /// context. Small low-temperature models are adequate for the YES/NO
    /// classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<ProviderRef>,
}

/// Loop iteration failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailurePolicy {
    /// Abort the loop with the error.
    #[default]
    Halt,
    /// Record the failure and move to the next iteration.
    Continue,
    /// Re-run the failed iteration (bounded retry budget).
    Retry,
}

/// Step-level error policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepErrorPolicy {
    /// Retry attempts for transient failures.
    #[serde(default)]
    pub retry: u32,

    /// Backoff shape between attempts.
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Step to execute in place of this one if all attempts fail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// Backoff strategy for step retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Delay doubles per attempt.
    #[default]
    Exponential,
    /// Delay grows linearly per attempt.
    Linear,
}
