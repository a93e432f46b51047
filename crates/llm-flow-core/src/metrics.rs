// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine metrics.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

lazy_static! {
    /// Steps executed, labelled by mode and terminal status.
    pub static ref STEPS_EXECUTED: IntCounterVec = register_int_counter_vec!(
        "llm_flow_steps_executed_total",
        "Steps executed by mode and status",
        &["mode", "status"]
    )
    .unwrap();

    /// Step wall-clock duration in seconds, labelled by mode.
    pub static ref STEP_DURATION: HistogramVec = register_histogram_vec!(
        "llm_flow_step_duration_seconds",
        "Step execution duration",
        &["mode"]
    )
    .unwrap();

    /// Provider fallback advances, labelled by the provider that failed.
    pub static ref PROVIDER_FALLBACKS: IntCounterVec = register_int_counter_vec!(
        "llm_flow_provider_fallbacks_total",
        "Provider chain advances by failed provider",
        &["provider"]
    )
    .unwrap();

    /// Loop iterations, labelled by exit reason on completion.
    pub static ref LOOP_ITERATIONS: IntCounterVec = register_int_counter_vec!(
        "llm_flow_loop_iterations_total",
        "Loop iterations executed",
        &["loop"]
    )
    .unwrap();

    /// Consensus rounds, labelled by whether the rule was satisfied.
    pub static ref CONSENSUS_ROUNDS: IntCounterVec = register_int_counter_vec!(
        "llm_flow_consensus_rounds_total",
        "Consensus rounds by outcome",
        &["outcome"]
    )
    .unwrap();
}
