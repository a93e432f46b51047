// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-provider consensus.
//!
//! Runs the same prompt against N provider configurations in parallel,
//! normalizes each response into a vote, and applies the aggregation
//! rule. A consensus outcome is data: the step succeeds whether or not
//! the rule is satisfied, and downstream steps read the JSON result.

use crate::context::EffectiveContext;
use crate::error::{Diagnostic, FlowError, Result};
use crate::fallback::complete_with_fallback;
use crate::metrics;
use crate::model::Consensus;
use crate::providers::ProviderSet;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Confidence in the consensus outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Agreement exceeded the rule's minimum.
    High,
    /// Agreement exactly at the rule's minimum.
    Medium,
    /// Rule not satisfied.
    Low,
}

/// The JSON payload stored under a consensus step's name.
#[derive(Debug, Serialize)]
pub struct ConsensusOutcome {
    /// Winning vote when the rule is satisfied, `null` otherwise.
    pub result: Option<String>,
    /// Whether the aggregation rule was satisfied.
    pub agreed: bool,
    /// Fraction of considered votes behind the leading value.
    pub agreement_fraction: f64,
    /// Normalized vote per execution, keyed `index:provider`.
    pub votes_by_execution: BTreeMap<String, String>,
    /// Outcome confidence.
    pub confidence: Confidence,
    /// The rule that was applied.
    pub rule: String,
}

/// Normalizes a raw completion into a vote: the first non-whitespace
/// token, uppercased and trimmed of punctuation.
pub fn normalize_vote(raw: &str) -> String {
    raw.split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_uppercase()
}

/// Executes a consensus block with an already-interpolated prompt.
pub(crate) async fn run_consensus(
    providers: &ProviderSet,
    step_ctx: &EffectiveContext,
    consensus: &Consensus,
    prompt: &str,
    step_name: &str,
    cancel: &CancellationToken,
) -> Result<(String, Vec<Diagnostic>)> {
    let fanout = join_all(consensus.executions.iter().enumerate().map(|(index, exec)| {
        let ctx = step_ctx.for_execution(exec);
        let cancel = cancel.clone();
        async move {
            let result = complete_with_fallback(providers, &ctx, prompt, None, &cancel).await;
            (index, exec.provider.clone(), result)
        }
    }));

    let results = match consensus.timeout_seconds {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), fanout)
            .await
            .map_err(|_| FlowError::Timeout {
                step: step_name.to_string(),
                timeout: Duration::from_secs(secs),
            })?,
        None => fanout.await,
    };

    let mut diagnostics = Vec::new();
    let mut votes: BTreeMap<String, String> = BTreeMap::new();
    let mut failed = 0usize;

    for (index, provider, result) in results {
        let key = format!("{}:{}", index, provider);
        match result {
            Ok(outcome) => {
                let vote = normalize_vote(&outcome.response.text);
                debug!(execution = %key, vote = %vote, "Consensus vote");
                votes.insert(key, vote);
            }
            Err(FlowError::Cancelled) => return Err(FlowError::Cancelled),
            Err(err) => {
                failed += 1;
                warn!(execution = %key, error = %err, "Consensus execution failed");
                diagnostics.push(Diagnostic::warning(
                    step_name.to_string(),
                    format!("consensus execution {} failed: {}", key, err),
                ));
                if !consensus.allow_partial {
                    return Err(FlowError::StepFailed {
                        step: step_name.to_string(),
                        message: format!("consensus execution {} failed: {}", key, err),
                    });
                }
            }
        }
    }

    let total = votes.len();
    let required = consensus.aggregation.required(consensus.executions.len() - failed);
    if total == 0 {
        return Err(FlowError::StepFailed {
            step: step_name.to_string(),
            message: "all consensus executions failed".to_string(),
        });
    }

    // Tally the leading vote.
    let mut tally: BTreeMap<&str, usize> = BTreeMap::new();
    for vote in votes.values() {
        *tally.entry(vote.as_str()).or_default() += 1;
    }
    let (leader, leader_count) = tally
        .iter()
        .max_by_key(|(_, &count)| count)
        .map(|(&vote, &count)| (vote.to_string(), count))
        .unwrap_or_default();

    let agreed = leader_count >= required && total >= required;
    let confidence = if !agreed {
        Confidence::Low
    } else if leader_count > required {
        Confidence::High
    } else {
        Confidence::Medium
    };

    let outcome = ConsensusOutcome {
        result: agreed.then(|| leader.clone()),
        agreed,
        agreement_fraction: leader_count as f64 / total as f64,
        votes_by_execution: votes,
        confidence,
        rule: consensus.aggregation.to_string(),
    };

    metrics::CONSENSUS_ROUNDS
        .with_label_values(&[if agreed { "agreed" } else { "split" }])
        .inc();
    info!(
        step = %step_name,
        agreed,
        leader = %leader,
        fraction = outcome.agreement_fraction,
        "Consensus round complete"
    );

    let json = serde_json::to_string(&outcome).map_err(|e| FlowError::StepFailed {
        step: step_name.to_string(),
        message: format!("failed to serialize consensus outcome: {}", e),
    })?;
    Ok((json, diagnostics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_vote() {
        assert_eq!(normalize_vote("yes"), "YES");
        assert_eq!(normalize_vote("  YES, absolutely"), "YES");
        assert_eq!(normalize_vote("No."), "NO");
        assert_eq!(normalize_vote("\"APPROVE\"\nrationale follows"), "APPROVE");
        assert_eq!(normalize_vote(""), "");
    }

    #[test]
    fn test_confidence_ordering_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Confidence::High).unwrap(), "\"high\"");
        assert_eq!(serde_json::to_string(&Confidence::Low).unwrap(), "\"low\"");
    }
}
