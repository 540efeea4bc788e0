//! Middleware trait and its object-safe counterpart.
//!
//! Every phase has a passthrough default, so a middleware implements only
//! the phases it cares about.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use llmux_types::error::LlmError;
use llmux_types::llm::{ChatRequest, ChatResponse};

use super::context::PipelineContext;

/// Default priority for middlewares that do not pick one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// What an error-phase handler decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorOutcome {
    /// Pass the (possibly rewritten) error to the next handler.
    Continue(LlmError),
    /// Replace the failure with a successful response and stop the chain.
    Recovered(ChatResponse),
}

/// A named, ordered request/response transformer.
///
/// Lower priorities run first in the request and error phases and last in
/// the response phase.
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    fn before_request(
        &self,
        request: ChatRequest,
        ctx: &PipelineContext,
    ) -> impl Future<Output = Result<ChatRequest, LlmError>> + Send {
        let _ = ctx;
        async move { Ok(request) }
    }

    fn after_response(
        &self,
        response: ChatResponse,
        ctx: &PipelineContext,
    ) -> impl Future<Output = Result<ChatResponse, LlmError>> + Send {
        let _ = ctx;
        async move { Ok(response) }
    }

    fn on_error(
        &self,
        error: LlmError,
        ctx: &PipelineContext,
    ) -> impl Future<Output = Result<ErrorOutcome, LlmError>> + Send {
        let _ = ctx;
        async move { Ok(ErrorOutcome::Continue(error)) }
    }
}

/// Shared middlewares keep their state reachable by the caller
/// (e.g. a metrics collector registered while still being read).
impl<M: Middleware> Middleware for Arc<M> {
    fn name(&self) -> &str {
        Middleware::name(&**self)
    }

    fn priority(&self) -> i32 {
        Middleware::priority(&**self)
    }

    fn before_request(
        &self,
        request: ChatRequest,
        ctx: &PipelineContext,
    ) -> impl Future<Output = Result<ChatRequest, LlmError>> + Send {
        Middleware::before_request(&**self, request, ctx)
    }

    fn after_response(
        &self,
        response: ChatResponse,
        ctx: &PipelineContext,
    ) -> impl Future<Output = Result<ChatResponse, LlmError>> + Send {
        Middleware::after_response(&**self, response, ctx)
    }

    fn on_error(
        &self,
        error: LlmError,
        ctx: &PipelineContext,
    ) -> impl Future<Output = Result<ErrorOutcome, LlmError>> + Send {
        Middleware::on_error(&**self, error, ctx)
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`Middleware`] with boxed futures.
pub trait MiddlewareDyn: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    fn before_request_boxed<'a>(
        &'a self,
        request: ChatRequest,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Result<ChatRequest, LlmError>>;

    fn after_response_boxed<'a>(
        &'a self,
        response: ChatResponse,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Result<ChatResponse, LlmError>>;

    fn on_error_boxed<'a>(
        &'a self,
        error: LlmError,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Result<ErrorOutcome, LlmError>>;
}

impl<T: Middleware> MiddlewareDyn for T {
    fn name(&self) -> &str {
        Middleware::name(self)
    }

    fn priority(&self) -> i32 {
        Middleware::priority(self)
    }

    fn before_request_boxed<'a>(
        &'a self,
        request: ChatRequest,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Result<ChatRequest, LlmError>> {
        Box::pin(self.before_request(request, ctx))
    }

    fn after_response_boxed<'a>(
        &'a self,
        response: ChatResponse,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Result<ChatResponse, LlmError>> {
        Box::pin(self.after_response(response, ctx))
    }

    fn on_error_boxed<'a>(
        &'a self,
        error: LlmError,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Result<ErrorOutcome, LlmError>> {
        Box::pin(self.on_error(error, ctx))
    }
}
