//! Content-addressed keys for the response cache and the dedup table.

use serde::Serialize;

use llmux_types::error::LlmError;
use llmux_types::llm::{ChatMessage, ChatRequest, ToolDefinition};

use crate::ports::hash::ContentHasher;

/// Every field that can change what the provider returns, in a fixed order.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    provider: &'a str,
    model: &'a str,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<u32>,
    stop: Option<&'a [String]>,
    seed: Option<u64>,
    tools: &'a [ToolDefinition],
    messages: &'a [ChatMessage],
}

/// Derive the cache key for `request`.
///
/// Pure and deterministic over provider, model, sampling parameters, tools
/// and message content. Non-finite sampling parameters have no stable
/// serialisation and are rejected with [`LlmError::CacheKey`]; callers skip
/// caching for that request instead of failing it.
pub fn derive_cache_key(
    request: &ChatRequest,
    hasher: &dyn ContentHasher,
) -> Result<String, LlmError> {
    for (field, value) in [("temperature", request.temperature), ("top_p", request.top_p)] {
        if value.is_some_and(|v| !v.is_finite()) {
            return Err(LlmError::CacheKey(format!("{field} is not a finite number")));
        }
    }

    let material = KeyMaterial {
        provider: &request.provider,
        model: &request.model,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens,
        stop: request.stop.as_deref(),
        seed: request.seed,
        tools: &request.tools,
        messages: &request.messages,
    };
    let canonical =
        serde_json::to_string(&material).map_err(|e| LlmError::CacheKey(e.to_string()))?;
    Ok(format!("llm:{}", hasher.compute_hash(&canonical)))
}
