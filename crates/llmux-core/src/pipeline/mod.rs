//! Middleware pipeline.
//!
//! An ordered set of named middlewares applied around every provider call.
//! The request phase runs enabled middlewares by ascending priority (ties
//! keep insertion order), the response phase runs the same list in exact
//! reverse, and the error phase runs ascending again.

pub mod builtin;
pub mod context;
pub mod middleware;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use llmux_types::error::{LlmError, PipelinePhase};
use llmux_types::llm::{ChatRequest, ChatResponse};

pub use context::{PipelineContext, Scratchpad, keys};
pub use middleware::{DEFAULT_PRIORITY, ErrorOutcome, Middleware, MiddlewareDyn};

#[derive(Clone)]
struct Entry {
    name: String,
    priority: i32,
    enabled: bool,
    seq: u64,
    middleware: Arc<dyn MiddlewareDyn>,
}

/// Summary of one registered middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareInfo {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
}

#[derive(Default)]
pub struct Pipeline {
    entries: RwLock<Vec<Entry>>,
    next_seq: AtomicU64,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a middleware in priority order.
    ///
    /// A middleware with the same name is replaced, and the newcomer takes
    /// the position its own priority gives it.
    pub fn add<M: Middleware>(&self, middleware: M) {
        let name = Middleware::name(&middleware).to_string();
        let priority = Middleware::priority(&middleware);
        let entry = Entry {
            name: name.clone(),
            priority,
            enabled: true,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            middleware: Arc::new(middleware),
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| e.name != name);
        let at = entries.partition_point(|e| (e.priority, e.seq) <= (entry.priority, entry.seq));
        entries.insert(at, entry);
        tracing::debug!(middleware = %name, priority, "Middleware added");
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.name != name);
        entries.len() != before
    }

    /// Enable or disable a middleware without changing its position.
    pub fn toggle(&self, name: &str, enabled: bool) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Registered middlewares in request-phase order.
    pub fn list(&self) -> Vec<MiddlewareInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| MiddlewareInfo {
                name: e.name.clone(),
                priority: e.priority,
                enabled: e.enabled,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze the enabled middlewares for one attempt.
    ///
    /// Running all three phases from one run keeps the response phase the
    /// exact reverse of the request phase even if the pipeline is edited
    /// while the call is in flight.
    pub fn snapshot(&self) -> PipelineRun {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.enabled)
            .cloned()
            .collect();
        PipelineRun { entries }
    }

    pub async fn run_request_phase(
        &self,
        request: ChatRequest,
        ctx: &PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        self.snapshot().run_request_phase(request, ctx).await
    }

    pub async fn run_response_phase(
        &self,
        response: ChatResponse,
        ctx: &PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        self.snapshot().run_response_phase(response, ctx).await
    }

    pub async fn run_error_phase(
        &self,
        error: LlmError,
        ctx: &PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        self.snapshot().run_error_phase(error, ctx).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("middlewares", &self.list())
            .finish()
    }
}

/// The enabled middlewares of a pipeline, frozen for one attempt.
#[derive(Clone)]
pub struct PipelineRun {
    entries: Vec<Entry>,
}

impl PipelineRun {
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub async fn run_request_phase(
        &self,
        mut request: ChatRequest,
        ctx: &PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        for entry in &self.entries {
            request = entry
                .middleware
                .before_request_boxed(request, ctx)
                .await
                .map_err(|e| wrap(&entry.name, PipelinePhase::Request, e))?;
        }
        Ok(request)
    }

    pub async fn run_response_phase(
        &self,
        mut response: ChatResponse,
        ctx: &PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        for entry in self.entries.iter().rev() {
            response = entry
                .middleware
                .after_response_boxed(response, ctx)
                .await
                .map_err(|e| wrap(&entry.name, PipelinePhase::Response, e))?;
        }
        Ok(response)
    }

    /// Route a failure through the error handlers.
    ///
    /// `Ok` means a handler recovered with a full response. A handler that
    /// itself fails ends the chain; its failure is reported with the
    /// original error as the cause.
    pub async fn run_error_phase(
        &self,
        error: LlmError,
        ctx: &PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        let mut current = error;
        for entry in &self.entries {
            let original = current.clone();
            match entry.middleware.on_error_boxed(current, ctx).await {
                Ok(ErrorOutcome::Continue(next)) => current = next,
                Ok(ErrorOutcome::Recovered(response)) => {
                    tracing::debug!(middleware = %entry.name, "Error recovered by middleware");
                    return Ok(response);
                }
                Err(failure) => {
                    return Err(LlmError::Pipeline {
                        middleware: entry.name.clone(),
                        phase: PipelinePhase::Error,
                        message: failure.to_string(),
                        cause: Some(Box::new(original)),
                    });
                }
            }
        }
        Err(current)
    }
}

impl std::fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("middlewares", &self.names())
            .finish()
    }
}

fn wrap(middleware: &str, phase: PipelinePhase, error: LlmError) -> LlmError {
    LlmError::Pipeline {
        middleware: middleware.to_string(),
        phase,
        message: error.to_string(),
        cause: Some(Box::new(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use llmux_types::error::ErrorKind;
    use proptest::prelude::*;

    use crate::testing::{request, text_response};

    /// Appends "name:phase" to a shared trace.
    struct Tracer {
        name: String,
        priority: i32,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Tracer {
        fn new(name: &str, priority: i32, trace: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                priority,
                trace: trace.clone(),
            }
        }
    }

    impl Middleware for Tracer {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn before_request(
            &self,
            request: ChatRequest,
            _ctx: &PipelineContext,
        ) -> Result<ChatRequest, LlmError> {
            self.trace.lock().unwrap().push(format!("{}:req", self.name));
            Ok(request)
        }

        async fn after_response(
            &self,
            response: ChatResponse,
            _ctx: &PipelineContext,
        ) -> Result<ChatResponse, LlmError> {
            self.trace.lock().unwrap().push(format!("{}:resp", self.name));
            Ok(response)
        }

        async fn on_error(
            &self,
            error: LlmError,
            _ctx: &PipelineContext,
        ) -> Result<ErrorOutcome, LlmError> {
            self.trace.lock().unwrap().push(format!("{}:err", self.name));
            Ok(ErrorOutcome::Continue(error))
        }
    }

    struct Failing;

    impl Middleware for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn before_request(
            &self,
            _request: ChatRequest,
            _ctx: &PipelineContext,
        ) -> Result<ChatRequest, LlmError> {
            Err(LlmError::InvalidRequest("nope".to_string()))
        }

        async fn on_error(
            &self,
            _error: LlmError,
            _ctx: &PipelineContext,
        ) -> Result<ErrorOutcome, LlmError> {
            Err(LlmError::Configuration("handler broke".to_string()))
        }
    }

    struct Recovering;

    impl Middleware for Recovering {
        fn name(&self) -> &str {
            "recovering"
        }

        async fn on_error(
            &self,
            _error: LlmError,
            _ctx: &PipelineContext,
        ) -> Result<ErrorOutcome, LlmError> {
            Ok(ErrorOutcome::Recovered(text_response("p", "m", "fallback text")))
        }
    }

    fn traced(trace: &Arc<Mutex<Vec<String>>>, phase: &str) -> Vec<String> {
        trace
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.ends_with(phase))
            .map(|t| t.split(':').next().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn response_phase_is_reverse_of_request_phase() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(Tracer::new("b", 20, &trace));
        pipeline.add(Tracer::new("a", 10, &trace));
        pipeline.add(Tracer::new("c", 30, &trace));

        let ctx = PipelineContext::new();
        let run = pipeline.snapshot();
        run.run_request_phase(request("p", "hi"), &ctx).await.unwrap();
        run.run_response_phase(text_response("p", "m", "ok"), &ctx)
            .await
            .unwrap();

        assert_eq!(traced(&trace, ":req"), vec!["a", "b", "c"]);
        assert_eq!(traced(&trace, ":resp"), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn disabled_middleware_is_skipped_and_keeps_position() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(Tracer::new("a", 1, &trace));
        pipeline.add(Tracer::new("b", 2, &trace));

        assert!(pipeline.toggle("a", false));
        assert!(!pipeline.toggle("missing", false));
        let ctx = PipelineContext::new();
        pipeline.run_request_phase(request("p", "hi"), &ctx).await.unwrap();
        assert_eq!(traced(&trace, ":req"), vec!["b"]);

        assert!(pipeline.toggle("a", true));
        let names: Vec<String> = pipeline.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn re_adding_overwrites_position() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(Tracer::new("a", 1, &trace));
        pipeline.add(Tracer::new("b", 2, &trace));
        pipeline.add(Tracer::new("a", 3, &trace));

        let list = pipeline.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "b");
        assert_eq!(list[1].name, "a");
        assert_eq!(list[1].priority, 3);

        assert!(pipeline.remove("a"));
        assert!(!pipeline.remove("a"));
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn equal_priorities_keep_insertion_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        for name in ["x", "y", "z"] {
            pipeline.add(Tracer::new(name, 5, &trace));
        }
        assert_eq!(pipeline.snapshot().names(), vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn request_phase_failure_names_middleware_and_phase() {
        let pipeline = Pipeline::new();
        pipeline.add(Failing);

        let err = pipeline
            .run_request_phase(request("p", "hi"), &PipelineContext::new())
            .await
            .unwrap_err();
        match &err {
            LlmError::Pipeline {
                middleware,
                phase,
                cause,
                ..
            } => {
                assert_eq!(middleware, "failing");
                assert_eq!(*phase, PipelinePhase::Request);
                assert_eq!(
                    cause.as_deref(),
                    Some(&LlmError::InvalidRequest("nope".to_string()))
                );
            }
            other => panic!("expected pipeline error, got {other:?}"),
        }
        assert_eq!(err.root_kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn failing_error_handler_preserves_original_as_cause() {
        let pipeline = Pipeline::new();
        pipeline.add(Failing);

        let original = LlmError::Overloaded("busy".to_string());
        let err = pipeline
            .run_error_phase(original.clone(), &PipelineContext::new())
            .await
            .unwrap_err();
        match err {
            LlmError::Pipeline {
                phase,
                message,
                cause,
                ..
            } => {
                assert_eq!(phase, PipelinePhase::Error);
                assert!(message.contains("handler broke"));
                assert_eq!(cause.map(|c| *c), Some(original));
            }
            other => panic!("expected pipeline error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovery_stops_the_error_chain() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(Tracer::new("first", 1, &trace));
        pipeline.add(Recovering);
        pipeline.add(Tracer::new("last", 1_000, &trace));

        let response = pipeline
            .run_error_phase(LlmError::provider("boom"), &PipelineContext::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "fallback text");
        assert_eq!(traced(&trace, ":err"), vec!["first"]);
    }

    #[tokio::test]
    async fn unhandled_error_propagates_unchanged() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(Tracer::new("a", 1, &trace));

        let err = pipeline
            .run_error_phase(LlmError::AuthenticationFailed, &PipelineContext::new())
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::AuthenticationFailed);
    }

    proptest! {
        #[test]
        fn reverse_order_holds_for_any_priorities(
            priorities in proptest::collection::vec(-50i32..50, 1..12)
        ) {
            let trace = Arc::new(Mutex::new(Vec::new()));
            let pipeline = Pipeline::new();
            for (i, priority) in priorities.iter().enumerate() {
                pipeline.add(Tracer::new(&format!("m{i}"), *priority, &trace));
            }

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let ctx = PipelineContext::new();
                let run = pipeline.snapshot();
                run.run_request_phase(request("p", "hi"), &ctx).await.unwrap();
                run.run_response_phase(text_response("p", "m", "ok"), &ctx).await.unwrap();
            });

            let mut requested = traced(&trace, ":req");
            let responded = traced(&trace, ":resp");
            requested.reverse();
            prop_assert_eq!(requested, responded);
        }
    }
}
