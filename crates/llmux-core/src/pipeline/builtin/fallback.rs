//! Fallback-provider selection.
//!
//! On a matching error the middleware records the next untried
//! `{provider, model}` pair in the scratchpad; the executor re-issues the
//! call against it. Retries take precedence: when a retry was already
//! requested for this failure, no fallback is chosen.

use serde_json::Value;

use llmux_types::error::{ErrorKind, LlmError};

use crate::pipeline::{ErrorOutcome, Middleware, PipelineContext, keys};

use super::priority;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackTarget {
    pub provider: String,
    pub model: String,
}

impl FallbackTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    fn key(&self) -> String {
        pair_key(&self.provider, &self.model)
    }
}

fn pair_key(provider: &str, model: &str) -> String {
    format!("{provider}/{model}")
}

#[derive(Debug, Clone)]
pub struct FallbackMiddleware {
    chain: Vec<FallbackTarget>,
    on: Vec<ErrorKind>,
}

impl FallbackMiddleware {
    /// Fall back through `chain` in order on provider-side failures.
    pub fn new(chain: Vec<FallbackTarget>) -> Self {
        Self {
            chain,
            on: vec![
                ErrorKind::ProviderUnavailable,
                ErrorKind::Provider,
                ErrorKind::RateLimited,
                ErrorKind::Overloaded,
                ErrorKind::Timeout,
                ErrorKind::Stream,
            ],
        }
    }

    /// Replace the error kinds that trigger a fallback.
    pub fn on_kinds(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.on = kinds;
        self
    }

    fn tried(ctx: &PipelineContext) -> Vec<String> {
        match ctx.scratchpad().get(keys::FALLBACK_TRIED) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Middleware for FallbackMiddleware {
    fn name(&self) -> &str {
        "fallback"
    }

    fn priority(&self) -> i32 {
        priority::FALLBACK
    }

    async fn on_error(
        &self,
        error: LlmError,
        ctx: &PipelineContext,
    ) -> Result<ErrorOutcome, LlmError> {
        let pad = ctx.scratchpad();
        let mut tried = Self::tried(ctx);
        if let (Some(provider), Some(model)) =
            (pad.get_str(keys::PROVIDER), pad.get_str(keys::MODEL))
        {
            let current = pair_key(&provider, &model);
            if !tried.contains(&current) {
                tried.push(current);
            }
        }
        pad.set(keys::FALLBACK_TRIED, tried.clone());

        if pad.flag(keys::RETRY_REQUESTED) || !self.on.contains(&error.root_kind()) {
            return Ok(ErrorOutcome::Continue(error));
        }

        match self.chain.iter().find(|t| !tried.contains(&t.key())) {
            Some(next) => {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    provider = %next.provider,
                    model = %next.model,
                    kind = %error.root_kind(),
                    "Falling back to next provider"
                );
                pad.set(keys::FALLBACK_PROVIDER, next.provider.clone());
                pad.set(keys::FALLBACK_MODEL, next.model.clone());
            }
            None => {
                tracing::debug!(request_id = %ctx.request_id(), "Fallback chain exhausted");
            }
        }
        Ok(ErrorOutcome::Continue(error))
    }
}
