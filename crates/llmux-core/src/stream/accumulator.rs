//! Folds stream fragments into a best-effort final response.
//!
//! The accumulator is a plain state machine with no I/O. The
//! [`StreamDriver`](super::driver::StreamDriver) feeds it fragments and
//! owns the timers and cancellation listener around it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use llmux_types::config::StreamLimits;
use llmux_types::error::{AbortReason, LlmError};
use llmux_types::llm::{
    ChatMessage, ChatResponse, Choice, ChunkChoice, FinishReason, FunctionCall, MessageRole,
    StreamChunk, ToolCall, ToolCallDelta, Usage,
};

/// Lifecycle of one accumulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccumulatorState {
    Accumulating,
    Completed,
    Aborted(AbortReason),
}

#[derive(Debug, Default)]
struct ToolCallState {
    id: Option<String>,
    index: Option<u32>,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct ChoiceState {
    role: Option<MessageRole>,
    content: String,
    tool_calls: Vec<ToolCallState>,
    finish_reason: Option<FinishReason>,
}

pub struct StreamAccumulator {
    provider: String,
    id: String,
    model: String,
    choices: BTreeMap<u32, ChoiceState>,
    usage: Option<Usage>,
    limits: StreamLimits,
    state: AccumulatorState,
    chunk_count: u32,
    content_chars: usize,
    created_at: DateTime<Utc>,
    started_at: Instant,
    first_chunk_at: Option<Instant>,
    finished_at: Option<Instant>,
    cleaned_up: bool,
}

impl StreamAccumulator {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, limits: StreamLimits) -> Self {
        Self {
            provider: provider.into(),
            id: String::new(),
            model: model.into(),
            choices: BTreeMap::new(),
            usage: None,
            limits,
            state: AccumulatorState::Accumulating,
            chunk_count: 0,
            content_chars: 0,
            created_at: Utc::now(),
            started_at: Instant::now(),
            first_chunk_at: None,
            finished_at: None,
            cleaned_up: false,
        }
    }

    pub fn state(&self) -> &AccumulatorState {
        &self.state
    }

    pub fn is_accumulating(&self) -> bool {
        self.state == AccumulatorState::Accumulating && !self.cleaned_up
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Total characters of text content received so far.
    pub fn content_length(&self) -> usize {
        self.content_chars
    }

    pub fn time_to_first_chunk_ms(&self) -> Option<u64> {
        self.first_chunk_at
            .map(|at| millis(at.saturating_duration_since(self.started_at).as_millis()))
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Instant::now);
        millis(end.saturating_duration_since(self.started_at).as_millis())
    }

    /// Completion tokens seen so far: the provider's figure when it sent
    /// one, otherwise roughly four characters per token.
    pub fn completion_tokens(&self) -> u32 {
        match self.usage {
            Some(usage) => usage.completion_tokens,
            None => estimate_tokens(self.content_chars),
        }
    }

    /// Merge one fragment.
    ///
    /// Ignored once the accumulation has ended. Fails with
    /// [`LlmError::StreamAborted`] (and moves to `Aborted`) when accepting
    /// the fragment would break a configured limit; the fragment is then
    /// not merged.
    pub fn process_chunk(&mut self, chunk: &StreamChunk) -> Result<(), LlmError> {
        if !self.is_accumulating() {
            return Ok(());
        }

        let now = Instant::now();
        if self.first_chunk_at.is_none() {
            self.first_chunk_at = Some(now);
        }

        if let Some(limit) = self.limits.max_chunks {
            if self.chunk_count.saturating_add(1) > limit {
                return Err(self.limit_exceeded(AbortReason::MaxChunks { limit }));
            }
        }

        let added_chars: usize = chunk
            .choices
            .iter()
            .filter_map(|c| c.delta.content.as_deref())
            .map(|text| text.chars().count())
            .sum();
        if let Some(limit) = self.limits.max_tokens {
            let tokens_after = match chunk.usage {
                Some(usage) => usage.completion_tokens,
                None => estimate_tokens(self.content_chars + added_chars),
            };
            if tokens_after > limit {
                return Err(self.limit_exceeded(AbortReason::MaxTokens { limit }));
            }
        }

        if self.id.is_empty() && !chunk.id.is_empty() {
            self.id = chunk.id.clone();
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        for choice in &chunk.choices {
            self.merge_choice(choice);
        }
        self.chunk_count += 1;
        self.content_chars += added_chars;
        Ok(())
    }

    fn merge_choice(&mut self, choice: &ChunkChoice) {
        let state = self.choices.entry(choice.index).or_default();
        if let Some(role) = choice.delta.role {
            state.role = Some(role);
        }
        if let Some(text) = &choice.delta.content {
            state.content.push_str(text);
        }
        if let Some(reason) = choice.finish_reason {
            state.finish_reason = Some(reason);
        }
        for delta in &choice.delta.tool_calls {
            merge_tool_call(&mut state.tool_calls, delta);
        }
    }

    fn limit_exceeded(&mut self, reason: AbortReason) -> LlmError {
        self.abort(reason.clone());
        LlmError::StreamAborted { reason }
    }

    /// Mark the provider stream as finished.
    pub fn complete(&mut self) {
        if self.is_accumulating() {
            self.state = AccumulatorState::Completed;
            self.finished_at = Some(Instant::now());
        }
    }

    /// Stop accumulating. Returns `false` if the accumulation had already
    /// ended, in which case nothing changes.
    pub fn abort(&mut self, reason: AbortReason) -> bool {
        if !self.is_accumulating() {
            return false;
        }
        self.state = AccumulatorState::Aborted(reason);
        self.finished_at = Some(Instant::now());
        true
    }

    /// Drop the accumulated fragments. Returns `true` only on the first call.
    pub fn cleanup(&mut self) -> bool {
        if self.cleaned_up {
            return false;
        }
        self.cleaned_up = true;
        if self.finished_at.is_none() {
            self.finished_at = Some(Instant::now());
        }
        self.choices.clear();
        true
    }

    /// The response built from everything merged so far, in any state.
    ///
    /// Choices come out sorted by index; if none arrived a single empty
    /// assistant choice is synthesised.
    pub fn get_response(&self) -> ChatResponse {
        let mut choices: Vec<Choice> = self
            .choices
            .iter()
            .map(|(index, state)| Choice {
                index: *index,
                message: ChatMessage {
                    role: state.role.unwrap_or(MessageRole::Assistant),
                    content: state.content.clone(),
                    name: None,
                    tool_calls: state
                        .tool_calls
                        .iter()
                        .enumerate()
                        .map(|(position, call)| ToolCall {
                            id: call
                                .id
                                .clone()
                                .unwrap_or_else(|| format!("call_{}", call.index.unwrap_or(position as u32))),
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect(),
                    tool_call_id: None,
                },
                finish_reason: state.finish_reason,
            })
            .collect();

        if choices.is_empty() {
            choices.push(Choice {
                index: 0,
                message: ChatMessage::assistant(""),
                finish_reason: None,
            });
        }

        ChatResponse {
            id: self.id.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            choices,
            usage: self.usage,
            created_at: self.created_at,
            latency_ms: Some(self.duration_ms()),
            cached: false,
        }
    }
}

impl std::fmt::Debug for StreamAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAccumulator")
            .field("provider", &self.provider)
            .field("state", &self.state)
            .field("chunk_count", &self.chunk_count)
            .field("cleaned_up", &self.cleaned_up)
            .finish()
    }
}

/// Fragments carry an id on their first piece and usually only a
/// positional index afterwards.
fn merge_tool_call(calls: &mut Vec<ToolCallState>, delta: &ToolCallDelta) {
    let by_id = delta
        .id
        .as_ref()
        .and_then(|id| calls.iter().position(|c| c.id.as_ref() == Some(id)));
    let by_index = || {
        delta
            .index
            .and_then(|index| calls.iter().position(|c| c.index == Some(index)))
    };

    let slot = match by_id.or_else(by_index) {
        Some(position) => position,
        None => {
            calls.push(ToolCallState {
                id: delta.id.clone(),
                index: delta.index,
                ..Default::default()
            });
            calls.len() - 1
        }
    };

    let call = &mut calls[slot];
    if call.id.is_none() {
        call.id = delta.id.clone();
    }
    if call.index.is_none() {
        call.index = delta.index;
    }
    if let Some(name) = &delta.name {
        if call.name.is_empty() {
            call.name = name.clone();
        }
    }
    if let Some(arguments) = &delta.arguments {
        call.arguments.push_str(arguments);
    }
}

fn estimate_tokens(chars: usize) -> u32 {
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

fn millis(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
