//! Case-insensitive term filter over message and response text.

use llmux_types::error::LlmError;
use llmux_types::llm::{ChatRequest, ChatResponse};

use crate::pipeline::{Middleware, PipelineContext};

use super::priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Reject the request (or response) with `ContentBlocked`.
    Block,
    /// Replace every occurrence with the replacement text.
    Sanitize,
}

#[derive(Debug, Clone)]
pub struct ContentFilterMiddleware {
    terms: Vec<String>,
    action: FilterAction,
    replacement: String,
    filter_responses: bool,
}

impl ContentFilterMiddleware {
    pub fn new<I, S>(terms: I, action: FilterAction) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            terms: terms
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
            action,
            replacement: "[filtered]".to_string(),
            filter_responses: true,
        }
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = replacement.into();
        self
    }

    /// Only inspect outgoing requests.
    pub fn requests_only(mut self) -> Self {
        self.filter_responses = false;
        self
    }

    fn first_match(&self, text: &str) -> Option<&str> {
        self.terms
            .iter()
            .find(|term| find_ignore_case(text, term, 0).is_some())
            .map(String::as_str)
    }

    fn sanitize(&self, text: &str) -> String {
        let mut out = text.to_string();
        for term in &self.terms {
            out = replace_ignore_case(&out, term, &self.replacement);
        }
        out
    }

    /// Apply the filter to one piece of text in place.
    fn apply(&self, text: &mut String, location: &str) -> Result<(), LlmError> {
        let Some(term) = self.first_match(text) else {
            return Ok(());
        };
        match self.action {
            FilterAction::Block => Err(LlmError::ContentBlocked(format!(
                "{location} contains blocked term '{term}'"
            ))),
            FilterAction::Sanitize => {
                *text = self.sanitize(text);
                Ok(())
            }
        }
    }
}

impl Middleware for ContentFilterMiddleware {
    fn name(&self) -> &str {
        "content_filter"
    }

    fn priority(&self) -> i32 {
        priority::CONTENT_FILTER
    }

    async fn before_request(
        &self,
        mut request: ChatRequest,
        _ctx: &PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        for (i, message) in request.messages.iter_mut().enumerate() {
            self.apply(&mut message.content, &format!("message {i}"))?;
        }
        Ok(request)
    }

    async fn after_response(
        &self,
        mut response: ChatResponse,
        _ctx: &PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        if !self.filter_responses {
            return Ok(response);
        }
        for choice in &mut response.choices {
            self.apply(
                &mut choice.message.content,
                &format!("response choice {}", choice.index),
            )?;
        }
        Ok(response)
    }
}

/// Byte range of the first case-insensitive match of `needle` at or after `from`.
fn find_ignore_case(haystack: &str, needle: &str, from: usize) -> Option<(usize, usize)> {
    haystack[from..].char_indices().find_map(|(offset, _)| {
        let start = from + offset;
        let mut hay = haystack[start..].char_indices();
        let mut matched_end = start;
        for n in needle.chars() {
            let (i, h) = hay.next()?;
            if !h.to_lowercase().eq(n.to_lowercase()) {
                return None;
            }
            matched_end = start + i + h.len_utf8();
        }
        Some((start, matched_end))
    })
}

fn replace_ignore_case(haystack: &str, needle: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut cursor = 0;
    while let Some((start, end)) = find_ignore_case(haystack, needle, cursor) {
        out.push_str(&haystack[cursor..start]);
        out.push_str(replacement);
        cursor = end;
    }
    out.push_str(&haystack[cursor..]);
    out
}
