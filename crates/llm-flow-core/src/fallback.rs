// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider fallback driver.
//!
//! Attempts the effective provider chain in order. Transient failures
//! (connection, timeout, 5xx, rate limit) and model-not-found advance to
//! the next entry; auth and request-shape failures stop the chain.

use crate::context::EffectiveContext;
use crate::error::{FlowError, Result};
use crate::metrics;
use crate::providers::{CompletionRequest, CompletionResponse, ProviderError, ProviderSet};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A completion annotated with the chain entry that produced it.
#[derive(Debug)]
pub struct FallbackOutcome {
    /// The completion.
    pub response: CompletionResponse,
    /// Index into the effective chain.
    pub provider_index: usize,
    /// Provider name that produced the result.
    pub provider: String,
    /// Chain entries that failed before the producer, as
    /// `(provider, error)` pairs.
    pub failed: Vec<(String, String)>,
}

/// Runs `prompt` against the context's provider chain.
pub async fn complete_with_fallback(
    providers: &ProviderSet,
    ctx: &EffectiveContext,
    prompt: &str,
    system: Option<String>,
    cancel: &CancellationToken,
) -> Result<FallbackOutcome> {
    let mut last_error: Option<FlowError> = None;
    let mut failed: Vec<(String, String)> = Vec::new();

    for (index, entry) in ctx.providers.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        let Some(provider) = providers.llm(&entry.provider) else {
            warn!(provider = %entry.provider, "Provider not registered, advancing chain");
            failed.push((
                entry.provider.clone(),
                "provider not registered".to_string(),
            ));
            last_error = Some(FlowError::from_provider(
                &entry.provider,
                ProviderError::Unknown(format!("provider '{}' not registered", entry.provider)),
            ));
            metrics::PROVIDER_FALLBACKS
                .with_label_values(&[entry.provider.as_str()])
                .inc();
            continue;
        };

        let timeout = entry
            .timeout_seconds
            .map(std::time::Duration::from_secs)
            .unwrap_or(ctx.timeout);
        let request = CompletionRequest {
            model: entry.model.clone(),
            prompt: prompt.to_string(),
            system: system.clone(),
            temperature: Some(entry.temperature.unwrap_or(ctx.temperature)),
            max_tokens: Some(entry.max_tokens.unwrap_or(ctx.max_tokens)),
            timeout: Some(timeout),
            extra: HashMap::new(),
        };

        debug!(provider = %entry.provider, model = %entry.model, index, "Trying provider");
        let mut attempt_result = call_provider(&*provider, request.clone(), timeout, cancel).await;

        // Honor retry-after once per provider, on the first rate limit.
        if let Err(err) = &attempt_result {
            if let Some(wait) = err.retry_after() {
                debug!(provider = %entry.provider, wait_ms = wait.as_millis() as u64, "Rate limited, honoring retry-after");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
                attempt_result = call_provider(&*provider, request, timeout, cancel).await;
            }
        }

        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        match attempt_result {
            Ok(response) => {
                return Ok(FallbackOutcome {
                    response,
                    provider_index: index,
                    provider: entry.provider.clone(),
                    failed,
                });
            }
            Err(err) if err.is_fallback_eligible() => {
                warn!(provider = %entry.provider, error = %err, "Provider failed, advancing chain");
                metrics::PROVIDER_FALLBACKS
                    .with_label_values(&[entry.provider.as_str()])
                    .inc();
                failed.push((entry.provider.clone(), err.to_string()));
                last_error = Some(FlowError::from_provider(&entry.provider, err));
            }
            Err(err) => {
                return Err(FlowError::from_provider(&entry.provider, err));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| FlowError::StepFailed {
        step: String::new(),
        message: "provider chain is empty".to_string(),
    }))
}

async fn call_provider(
    provider: &dyn crate::providers::LlmProvider,
    request: CompletionRequest,
    timeout: std::time::Duration,
    cancel: &CancellationToken,
) -> std::result::Result<CompletionResponse, ProviderError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::Unknown("cancelled".to_string())),
        result = tokio::time::timeout(timeout, provider.complete(request)) => {
            match result {
                Ok(inner) => inner,
                Err(_) => Err(ProviderError::Timeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderRef;
    use crate::providers::LlmProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct ScriptedProvider {
        name: String,
        calls: AtomicU32,
        script: Box<dyn Fn(u32) -> std::result::Result<String, ProviderError> + Send + Sync>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.script)(call).map(|text| CompletionResponse {
                text,
                model: request.model,
                tokens_used: None,
                metadata: HashMap::new(),
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn chain(names: &[&str]) -> EffectiveContext {
        EffectiveContext {
            providers: names
                .iter()
                .map(|&name| ProviderRef {
                    provider: name.to_string(),
                    model: "test-model".to_string(),
                    temperature: None,
                    max_tokens: None,
                    timeout_seconds: None,
                })
                .collect(),
            servers: vec![],
            temperature: 0.7,
            max_tokens: 128,
            timeout: std::time::Duration::from_secs(5),
            logging: crate::model::LogLevel::Info,
            parallel: false,
            max_workers: 1,
            on_error: crate::model::OnErrorPolicy::CancelAll,
        }
    }

    fn provider(
        name: &str,
        script: impl Fn(u32) -> std::result::Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider {
            name: name.to_string(),
            calls: AtomicU32::new(0),
            script: Box::new(script),
        })
    }

    #[tokio::test]
    async fn test_first_provider_success() {
        let set = ProviderSet::new();
        set.register_llm("a", provider("a", |_| Ok("ok".to_string())));

        let outcome = complete_with_fallback(
            &set,
            &chain(&["a"]),
            "prompt",
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.response.text, "ok");
        assert_eq!(outcome.provider_index, 0);
        assert_eq!(outcome.provider, "a");
    }

    #[tokio::test]
    async fn test_transient_advances_and_third_untouched() {
        let set = ProviderSet::new();
        set.register_llm(
            "a",
            provider("a", |_| {
                Err(ProviderError::ServerError {
                    status: 503,
                    message: "overloaded".to_string(),
                })
            }),
        );
        set.register_llm("b", provider("b", |_| Ok("ok".to_string())));
        let c = provider("c", |_| Ok("never".to_string()));
        set.register_llm("c", c.clone());

        let outcome = complete_with_fallback(
            &set,
            &chain(&["a", "b", "c"]),
            "prompt",
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.response.text, "ok");
        assert_eq!(outcome.provider_index, 1);
        assert_eq!(c.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auth_error_stops_chain() {
        let set = ProviderSet::new();
        set.register_llm(
            "a",
            provider("a", |_| Err(ProviderError::AuthError("bad key".to_string()))),
        );
        let b = provider("b", |_| Ok("never".to_string()));
        set.register_llm("b", b.clone());

        let err = complete_with_fallback(
            &set,
            &chain(&["a", "b"]),
            "prompt",
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FlowError::PermanentProvider { .. }));
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_model_not_found_advances() {
        let set = ProviderSet::new();
        set.register_llm(
            "a",
            provider("a", |_| {
                Err(ProviderError::ModelNotFound("test-model".to_string()))
            }),
        );
        set.register_llm("b", provider("b", |_| Ok("ok".to_string())));

        let outcome = complete_with_fallback(
            &set,
            &chain(&["a", "b"]),
            "prompt",
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.provider, "b");
    }

    #[tokio::test]
    async fn test_retry_after_honored_once() {
        let set = ProviderSet::new();
        let a = provider("a", |call| {
            if call == 0 {
                Err(ProviderError::RateLimitExceeded {
                    retry_after: Some(std::time::Duration::from_millis(5)),
                })
            } else {
                Ok("recovered".to_string())
            }
        });
        set.register_llm("a", a.clone());

        let outcome = complete_with_fallback(
            &set,
            &chain(&["a"]),
            "prompt",
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.response.text, "recovered");
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_chain_surfaces_last_error() {
        let set = ProviderSet::new();
        set.register_llm("a", provider("a", |_| Err(ProviderError::Timeout)));
        set.register_llm(
            "b",
            provider("b", |_| {
                Err(ProviderError::ServerError {
                    status: 500,
                    message: "boom".to_string(),
                })
            }),
        );

        let err = complete_with_fallback(
            &set,
            &chain(&["a", "b"]),
            "prompt",
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            FlowError::TransientProvider { provider, .. } => assert_eq!(provider, "b"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_observed() {
        let set = ProviderSet::new();
        set.register_llm("a", provider("a", |_| Ok("ok".to_string())));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = complete_with_fallback(&set, &chain(&["a"]), "prompt", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
    }
}
