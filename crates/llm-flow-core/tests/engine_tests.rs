// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end engine tests against scripted providers.

use llm_flow_core::{Engine, FlowError, ProviderError, Registry, Severity, Workflow};
use llm_flow_providers::MockProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn workflow(yaml: &str) -> Workflow {
    serde_yaml::from_str(yaml).expect("test workflow parses")
}

fn registry(workflows: Vec<(&str, &str)>) -> Registry {
    Registry::from_workflows(
        workflows
            .into_iter()
            .map(|(name, yaml)| (name.to_string(), workflow(yaml)))
            .collect(),
    )
    .expect("test registry loads")
}

async fn run(engine: &Engine, name: &str, input: &str) -> llm_flow_core::RunOutcome {
    engine
        .run(name, input, CancellationToken::new())
        .await
        .expect("run returns an outcome")
}

#[tokio::test]
async fn sequential_two_step() {
    let reg = registry(vec![(
        "pipeline",
        r#"
$schema: llm-flow/v1
name: pipeline
version: "1.0"
description: two sequential steps
execution:
  provider: mock
  model: test-model
steps:
  - name: a
    run: "Echo: {{input}}"
  - name: b
    needs: [a]
    run: "Upper: {{a}}"
"#,
    )]);

    let mock = Arc::new(MockProvider::new("mock").with_handler(|req| {
        match req.prompt.strip_prefix("Upper: ") {
            Some(rest) => Ok(format!("UPPER: {}", rest.to_uppercase())),
            None => Ok(req.prompt.clone()),
        }
    }));
    let engine = Engine::new(reg).with_provider("mock", mock);

    let outcome = run(&engine, "pipeline", "hello").await;
    assert!(outcome.is_success());
    assert_eq!(outcome.step_outputs["a"], "Echo: hello");
    assert_eq!(outcome.step_outputs["b"], "UPPER: ECHO: HELLO");
    assert_eq!(outcome.final_output, "UPPER: ECHO: HELLO");
    assert_eq!(outcome.step_outputs.len(), 2);
}

#[tokio::test]
async fn missing_needs_caught_by_validator() {
    let result = Registry::from_workflows(vec![(
        "pipeline".to_string(),
        workflow(
            r#"
$schema: llm-flow/v1
name: pipeline
version: "1.0"
description: b references a without needs
execution:
  provider: mock
  model: test-model
steps:
  - name: a
    run: "Echo: {{input}}"
  - name: b
    run: "Upper: {{a}}"
"#,
        ),
    )]);

    let err = result.expect_err("validation must fail");
    match err {
        FlowError::Validation { diagnostics, .. } => {
            let diag = diagnostics
                .iter()
                .find(|d| d.step.as_deref() == Some("b"))
                .expect("diagnostic cites step b");
            assert!(diag.message.contains("{{a}}"));
            assert_eq!(diag.hint.as_deref(), Some("add needs: [a]"));
        }
        other => panic!("expected validation error, got {}", other),
    }
}

#[tokio::test]
async fn loop_until_pass() {
    let reg = registry(vec![
        (
            "driver",
            r#"
$schema: llm-flow/v1
name: driver
version: "1.0"
description: iterate until the attempt passes
execution:
  provider: mock
  model: test-model
steps:
  - name: report
    needs: [refine]
    run: "Done after {{loop.iteration}}"
loops:
  - name: refine
    workflow: attempt
    with:
      task: "{{input}}"
    max_iterations: 5
    until: "The output says PASS"
"#,
        ),
        (
            "attempt",
            r#"
$schema: llm-flow/v1
name: attempt
version: "1.0"
description: one attempt
execution:
  provider: mock
  model: test-model
steps:
  - name: work
    run: "Work on {{input}}"
"#,
        ),
    ]);

    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let attempts_in_handler = attempts.clone();
    let mock = Arc::new(MockProvider::new("mock").with_handler(move |req| {
        if req.prompt.starts_with("Evaluate this condition:") {
            // The evaluator sees condition and output as separate fields.
            if req.prompt.contains("Output to evaluate: PASS") {
                Ok("YES".to_string())
            } else {
                Ok("NO".to_string())
            }
        } else if req.prompt.starts_with("Work on ") {
            let n = attempts_in_handler.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Ok(if n >= 3 { "PASS" } else { "FAIL" }.to_string())
        } else {
            Ok(req.prompt.clone())
        }
    }));
    let engine = Engine::new(reg).with_provider("mock", mock);

    let outcome = run(&engine, "driver", "the ticket").await;
    assert!(outcome.is_success());
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    assert_eq!(outcome.step_outputs["refine"], "PASS");
    // The last declared node is the loop, so its output is final; the
    // follow-up step still observed the exposed iteration count.
    assert_eq!(outcome.final_output, "PASS");
    assert_eq!(outcome.step_outputs["report"], "Done after 3");
}

#[tokio::test]
async fn provider_fallback_skips_to_healthy_provider() {
    let reg = registry(vec![(
        "pipeline",
        r#"
$schema: llm-flow/v1
name: pipeline
version: "1.0"
description: fallback chain
execution:
  providers:
    - provider: alpha
      model: m1
    - provider: beta
      model: m2
    - provider: gamma
      model: m3
steps:
  - name: ask
    run: "{{input}}"
"#,
    )]);

    let alpha = Arc::new(MockProvider::new("alpha").with_error(ProviderError::ServerError {
        status: 503,
        message: "overloaded".to_string(),
    }));
    let beta = Arc::new(MockProvider::new("beta").with_default("ok"));
    let gamma = Arc::new(MockProvider::new("gamma").with_default("never"));

    let engine = Engine::new(reg)
        .with_provider("alpha", alpha)
        .with_provider("beta", beta)
        .with_provider("gamma", gamma.clone());

    let outcome = run(&engine, "pipeline", "question").await;
    assert!(outcome.is_success());
    assert_eq!(outcome.step_outputs["ask"], "ok");
    assert_eq!(outcome.provider_used["ask"], "beta");
    assert_eq!(gamma.call_count(), 0);
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.severity == Severity::Warning && d.message.contains("alpha")));
}

#[tokio::test]
async fn unanimous_consensus_split_vote_is_data() {
    let reg = registry(vec![(
        "decide",
        r#"
$schema: llm-flow/v1
name: decide
version: "1.0"
description: unanimous gate
execution:
  provider: x
  model: m
steps:
  - name: gate
    consensus:
      prompt: "Ship {{input}}? Answer YES or NO."
      executions:
        - provider: x
          model: m
        - provider: y
          model: m
        - provider: z
          model: m
      aggregation: unanimous
"#,
    )]);

    let engine = Engine::new(reg)
        .with_provider("x", Arc::new(MockProvider::new("x").with_default("YES")))
        .with_provider("y", Arc::new(MockProvider::new("y").with_default("YES")))
        .with_provider("z", Arc::new(MockProvider::new("z").with_default("NO")));

    let outcome = run(&engine, "decide", "v2").await;
    assert!(outcome.is_success(), "consensus outcomes are data");

    let payload: serde_json::Value = serde_json::from_str(&outcome.step_outputs["gate"]).unwrap();
    assert_eq!(payload["agreed"], false);
    assert!(payload["result"].is_null());
    let fraction = payload["agreement_fraction"].as_f64().unwrap();
    assert!((fraction - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(payload["confidence"], "low");
}

#[tokio::test]
async fn two_thirds_consensus_agrees() {
    let reg = registry(vec![(
        "decide",
        r#"
$schema: llm-flow/v1
name: decide
version: "1.0"
description: two thirds gate
execution:
  provider: x
  model: m
steps:
  - name: gate
    consensus:
      prompt: "Ship it? Answer YES or NO."
      executions:
        - provider: x
          model: m
        - provider: y
          model: m
        - provider: z
          model: m
      aggregation: "2/3"
"#,
    )]);

    let engine = Engine::new(reg)
        .with_provider("x", Arc::new(MockProvider::new("x").with_default("yes.")))
        .with_provider("y", Arc::new(MockProvider::new("y").with_default("YES")))
        .with_provider("z", Arc::new(MockProvider::new("z").with_default("NO")));

    let outcome = run(&engine, "decide", "").await;
    let payload: serde_json::Value = serde_json::from_str(&outcome.step_outputs["gate"]).unwrap();
    assert_eq!(payload["agreed"], true);
    assert_eq!(payload["result"], "YES");
    assert_eq!(payload["confidence"], "medium");
}

#[tokio::test]
async fn parallel_cancel_all_stops_in_flight_work() {
    let reg = registry(vec![(
        "fanout",
        r#"
$schema: llm-flow/v1
name: fanout
version: "1.0"
description: four independent steps under cancel_all
execution:
  provider: slow
  model: m
  parallel: true
  max_workers: 4
  on_error: cancel_all
steps:
  - name: one
    run: "1"
  - name: two
    provider: failing
    model: m
    run: "2"
  - name: three
    run: "3"
  - name: four
    run: "4"
"#,
    )]);

    let slow = Arc::new(
        MockProvider::new("slow")
            .with_default("done")
            .with_delay(Duration::from_millis(400)),
    );
    let failing = Arc::new(MockProvider::new("failing").with_error(ProviderError::ServerError {
        status: 500,
        message: "boom".to_string(),
    }));

    let engine = Engine::new(reg)
        .with_provider("slow", slow)
        .with_provider("failing", failing);

    let started = std::time::Instant::now();
    let outcome = run(&engine, "fanout", "").await;
    let elapsed = started.elapsed();

    assert!(!outcome.is_success());
    assert!(outcome.failure.as_deref().unwrap().contains("two"));
    // In-flight steps observe the cancellation at their next suspension
    // point instead of running to completion.
    assert!(elapsed < Duration::from_millis(350), "elapsed: {:?}", elapsed);
    assert!(outcome.step_outputs.len() <= 1);
}

#[tokio::test]
async fn child_workflow_sees_only_with_inputs() {
    let reg = registry(vec![
        (
            "parent",
            r#"
$schema: llm-flow/v1
name: parent
version: "1.0"
description: compose a child
execution:
  provider: mock
  model: m
steps:
  - name: secret
    run: "classified {{input}}"
  - name: call
    needs: [secret]
    template:
      workflow: child
      with:
        brief: "from {{secret}}"
"#,
        ),
        (
            "child",
            r#"
$schema: llm-flow/v1
name: child
version: "1.0"
description: echo the input
execution:
  provider: mock
  model: m
steps:
  - name: echo
    run: "child got {{input}}"
"#,
        ),
    ]);

    let mock = Arc::new(MockProvider::new("mock").with_handler(|req| Ok(req.prompt.clone())));
    let engine = Engine::new(reg).with_provider("mock", mock);

    let outcome = run(&engine, "parent", "data").await;
    assert!(outcome.is_success());
    // Single-entry with: maps become the child's `input` directly.
    assert_eq!(
        outcome.step_outputs["call"],
        "child got from classified data"
    );
    // Parent sees only the child's final output, not its step map.
    assert!(!outcome.step_outputs.contains_key("echo"));
}

#[tokio::test]
async fn child_cannot_reference_parent_scope() {
    let reg = registry(vec![
        (
            "parent",
            r#"
$schema: llm-flow/v1
name: parent
version: "1.0"
description: child references an unpassed name
execution:
  provider: mock
  model: m
steps:
  - name: hidden
    run: "secret"
  - name: call
    needs: [hidden]
    template:
      workflow: child
      with:
        brief: "public"
"#,
        ),
        (
            "child",
            r#"
$schema: llm-flow/v1
name: child
version: "1.0"
description: references a key that is never passed
execution:
  provider: mock
  model: m
steps:
  - name: leak
    run: "{{hidden}}"
"#,
        ),
    ]);

    let mock = Arc::new(MockProvider::new("mock").with_handler(|req| Ok(req.prompt.clone())));
    let engine = Engine::new(reg).with_provider("mock", mock);

    let outcome = run(&engine, "parent", "x").await;
    assert!(!outcome.is_success());
    assert!(outcome.failure.as_deref().unwrap().contains("call"));
}

#[tokio::test]
async fn composition_depth_cap() {
    let reg = registry(vec![(
        "recurse",
        r#"
$schema: llm-flow/v1
name: recurse
version: "1.0"
description: calls itself forever
execution:
  provider: mock
  model: m
steps:
  - name: again
    template:
      workflow: recurse
      with:
        seed: "{{input}}"
"#,
    )]);

    let mock = Arc::new(MockProvider::new("mock").with_default("never"));
    let engine = Engine::new(reg).with_provider("mock", mock);

    let outcome = run(&engine, "recurse", "x").await;
    assert!(!outcome.is_success());
    assert!(outcome.failure.as_deref().unwrap().contains("depth"));
}

#[tokio::test]
async fn max_iterations_one_runs_once_and_still_evaluates() {
    let reg = registry(vec![
        (
            "driver",
            r#"
$schema: llm-flow/v1
name: driver
version: "1.0"
description: single-iteration loop
execution:
  provider: mock
  model: m
loops:
  - name: once
    workflow: attempt
    with:
      task: "{{input}}"
    max_iterations: 1
    until: "The output says PASS"
"#,
        ),
        (
            "attempt",
            r#"
$schema: llm-flow/v1
name: attempt
version: "1.0"
description: one attempt
execution:
  provider: mock
  model: m
steps:
  - name: work
    run: "attempting"
"#,
        ),
    ]);

    let evaluations = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let evaluations_in_handler = evaluations.clone();
    let mock = Arc::new(MockProvider::new("mock").with_handler(move |req| {
        if req.prompt.starts_with("Evaluate this condition:") {
            evaluations_in_handler.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok("NO".to_string())
        } else {
            Ok("FAIL".to_string())
        }
    }));
    let engine = Engine::new(reg).with_provider("mock", mock);

    let outcome = run(&engine, "driver", "x").await;
    assert!(outcome.is_success());
    assert_eq!(outcome.step_outputs["once"], "FAIL");
    // The evaluator runs on the final iteration; its NO cannot extend
    // the loop past the cap.
    assert_eq!(evaluations.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn loop_satisfied_on_first_iteration_runs_once() {
    let reg = registry(vec![
        (
            "driver",
            r#"
$schema: llm-flow/v1
name: driver
version: "1.0"
description: condition met immediately
execution:
  provider: mock
  model: m
loops:
  - name: refine
    workflow: attempt
    with:
      task: "{{input}}"
    max_iterations: 5
    until: "The output says PASS"
    accumulate: refine_history
"#,
        ),
        (
            "attempt",
            r#"
$schema: llm-flow/v1
name: attempt
version: "1.0"
description: immediate pass
execution:
  provider: mock
  model: m
steps:
  - name: work
    run: "attempting"
"#,
        ),
    ]);

    let children = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let children_in_handler = children.clone();
    let mock = Arc::new(MockProvider::new("mock").with_handler(move |req| {
        if req.prompt.starts_with("Evaluate this condition:") {
            Ok("yes".to_string())
        } else {
            children_in_handler.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok("PASS".to_string())
        }
    }));
    let engine = Engine::new(reg).with_provider("mock", mock);

    let outcome = run(&engine, "driver", "x").await;
    assert!(outcome.is_success());
    assert_eq!(children.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(outcome.step_outputs["refine"], "PASS");
    assert_eq!(outcome.step_outputs["refine_history"], "[\"PASS\"]");
}

#[tokio::test]
async fn empty_workflow_rejected_at_invocation() {
    let reg = registry(vec![(
        "empty",
        r#"
$schema: llm-flow/v1
name: empty
version: "1.0"
description: composition-only placeholder
execution:
  provider: mock
  model: m
"#,
    )]);

    let engine = Engine::new(reg);
    let err = engine
        .run("empty", "x", CancellationToken::new())
        .await
        .expect_err("empty workflow is not invocable");
    assert!(err.to_string().contains("no steps or loops"));
}

#[tokio::test]
async fn skipped_condition_leaves_no_scope_entry() {
    let reg = registry(vec![(
        "gated",
        r#"
$schema: llm-flow/v1
name: gated
version: "1.0"
description: skip on false condition
execution:
  provider: mock
  model: m
steps:
  - name: gate
    if: "{{input}} == go"
    run: "gated work"
  - name: after
    needs: [gate]
    run: "ran anyway"
"#,
    )]);

    let mock = Arc::new(MockProvider::new("mock").with_handler(|req| Ok(req.prompt.clone())));
    let engine = Engine::new(reg).with_provider("mock", mock.clone());

    let outcome = run(&engine, "gated", "stop").await;
    assert!(outcome.is_success());
    assert!(!outcome.step_outputs.contains_key("gate"));
    // Dependents of a condition-skipped step still run.
    assert_eq!(outcome.step_outputs["after"], "ran anyway");

    let outcome = run(&engine, "gated", "go").await;
    assert_eq!(outcome.step_outputs["gate"], "gated work");
}

#[tokio::test]
async fn for_each_expands_in_item_order() {
    let reg = registry(vec![(
        "mapper",
        r#"
$schema: llm-flow/v1
name: mapper
version: "1.0"
description: fan over a JSON array
execution:
  provider: mock
  model: m
steps:
  - name: items
    run: "list them"
  - name: expand
    needs: [items]
    for_each: "{{items}}"
    item_name: entry
    run: "Item {{entry}} at {{index}}"
"#,
    )]);

    let mock = Arc::new(MockProvider::new("mock").with_handler(|req| {
        if req.prompt == "list them" {
            Ok(r#"["x", "y"]"#.to_string())
        } else {
            Ok(req.prompt.clone())
        }
    }));
    let engine = Engine::new(reg).with_provider("mock", mock);

    let outcome = run(&engine, "mapper", "").await;
    assert!(outcome.is_success());
    let expanded: Vec<String> = serde_json::from_str(&outcome.step_outputs["expand"]).unwrap();
    assert_eq!(expanded, vec!["Item x at 0", "Item y at 1"]);
}

#[tokio::test]
async fn step_retry_recovers_from_transient_error() {
    let reg = registry(vec![(
        "retrying",
        r#"
$schema: llm-flow/v1
name: retrying
version: "1.0"
description: transient failure then success
execution:
  provider: flaky
  model: m
steps:
  - name: ask
    run: "{{input}}"
    on_error:
      retry: 2
      backoff: linear
"#,
    )]);

    let flaky = Arc::new(
        MockProvider::new("flaky")
            .with_error(ProviderError::Timeout)
            .with_response("recovered"),
    );
    let engine = Engine::new(reg).with_provider("flaky", flaky.clone());

    let outcome = run(&engine, "retrying", "q").await;
    assert!(outcome.is_success());
    assert_eq!(outcome.step_outputs["ask"], "recovered");
    assert_eq!(flaky.call_count(), 2);
}

#[tokio::test]
async fn fallback_step_runs_in_place_of_failed_step() {
    let reg = registry(vec![(
        "guarded",
        r#"
$schema: llm-flow/v1
name: guarded
version: "1.0"
description: fallback step substitution
execution:
  provider: mock
  model: m
steps:
  - name: primary
    provider: broken
    model: m
    run: "primary work"
    on_error:
      fallback: backup
  - name: backup
    run: "backup work"
  - name: consume
    needs: [primary]
    run: "got {{primary}}"
"#,
    )]);

    let broken = Arc::new(MockProvider::new("broken").with_error(ProviderError::ServerError {
        status: 500,
        message: "down".to_string(),
    }));
    let mock = Arc::new(MockProvider::new("mock").with_handler(|req| Ok(req.prompt.clone())));
    let engine = Engine::new(reg)
        .with_provider("broken", broken)
        .with_provider("mock", mock);

    let outcome = run(&engine, "guarded", "").await;
    assert!(outcome.is_success(), "failure: {:?}", outcome.failure);
    assert_eq!(outcome.step_outputs["primary"], "backup work");
    assert_eq!(outcome.step_outputs["consume"], "got backup work");
}

#[tokio::test]
async fn parallel_max_workers_one_matches_sequential() {
    let yaml_parallel = r#"
$schema: llm-flow/v1
name: pair
version: "1.0"
description: two independent steps, single worker
execution:
  provider: mock
  model: m
  parallel: true
  max_workers: 1
steps:
  - name: left
    run: "L {{input}}"
  - name: right
    run: "R {{input}}"
"#;
    let yaml_sequential = r#"
$schema: llm-flow/v1
name: pair
version: "1.0"
description: two independent steps
execution:
  provider: mock
  model: m
steps:
  - name: left
    run: "L {{input}}"
  - name: right
    run: "R {{input}}"
"#;

    for yaml in [yaml_parallel, yaml_sequential] {
        let reg = registry(vec![("pair", yaml)]);
        let mock = Arc::new(MockProvider::new("mock").with_handler(|req| Ok(req.prompt.clone())));
        let engine = Engine::new(reg).with_provider("mock", mock);

        let outcome = run(&engine, "pair", "in").await;
        assert!(outcome.is_success());
        assert_eq!(outcome.step_outputs["left"], "L in");
        assert_eq!(outcome.step_outputs["right"], "R in");
        assert_eq!(outcome.final_output, "R in");
    }
}

#[tokio::test]
async fn parallel_continue_skips_only_dependents() {
    let reg = registry(vec![(
        "partial",
        r#"
$schema: llm-flow/v1
name: partial
version: "1.0"
description: continue past an independent failure
execution:
  provider: mock
  model: m
  parallel: true
  max_workers: 2
  on_error: continue
steps:
  - name: doomed
    provider: broken
    model: m
    run: "will fail"
  - name: dependent
    needs: [doomed]
    run: "never runs"
  - name: independent
    run: "still runs"
"#,
    )]);

    let broken = Arc::new(MockProvider::new("broken").with_error(ProviderError::Timeout));
    let mock = Arc::new(MockProvider::new("mock").with_handler(|req| Ok(req.prompt.clone())));
    let engine = Engine::new(reg)
        .with_provider("broken", broken)
        .with_provider("mock", mock);

    let outcome = run(&engine, "partial", "").await;
    assert!(!outcome.is_success());
    assert_eq!(outcome.step_outputs["independent"], "still runs");
    assert!(!outcome.step_outputs.contains_key("dependent"));
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.step.as_deref() == Some("dependent") && d.message.contains("skipped")));
}

#[tokio::test]
async fn top_level_cancellation_propagates() {
    let reg = registry(vec![(
        "slowpoke",
        r#"
$schema: llm-flow/v1
name: slowpoke
version: "1.0"
description: cancelled mid-run
execution:
  provider: slow
  model: m
steps:
  - name: crawl
    run: "take your time"
"#,
    )]);

    let slow = Arc::new(
        MockProvider::new("slow")
            .with_default("done")
            .with_delay(Duration::from_secs(5)),
    );
    let engine = Engine::new(reg).with_provider("slow", slow);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = engine
        .run("slowpoke", "x", cancel)
        .await
        .expect_err("cancellation surfaces as an error");
    assert!(matches!(err, FlowError::Cancelled));
}

#[tokio::test]
async fn sibling_directory_resolution_precedence() {
    let child_yaml = |tag: &str| {
        format!(
            r#"
$schema: llm-flow/v1
name: helper
version: "1.0"
description: {tag} helper
execution:
  provider: mock
  model: m
steps:
  - name: answer
    run: "{tag} helper ran"
"#
        )
    };
    let parent_yaml = r#"
$schema: llm-flow/v1
name: parent
version: "1.0"
description: calls a sibling helper
execution:
  provider: mock
  model: m
steps:
  - name: call
    template:
      workflow: helper
      with:
        q: "{{input}}"
"#;

    let reg = Registry::from_workflows(vec![
        ("review/parent".to_string(), workflow(parent_yaml)),
        ("review/helper".to_string(), workflow(&child_yaml("sibling"))),
        ("helper".to_string(), workflow(&child_yaml("root"))),
    ])
    .unwrap();

    let mock = Arc::new(MockProvider::new("mock").with_handler(|req| Ok(req.prompt.clone())));
    let engine = Engine::new(reg).with_provider("mock", mock);

    let outcome = run(&engine, "review/parent", "q").await;
    assert_eq!(outcome.final_output, "sibling helper ran");
}
