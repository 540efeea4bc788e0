//! OpenAI-compatible provider adapter.
//!
//! A single [`OpenAiCompatibleProvider`] serves every built-in (OpenAI,
//! Groq, Mistral, Together, Ollama) through per-provider base URLs, plus any
//! user-registered endpoint that speaks the chat completions protocol.
//!
//! Requests go out through `reqwest`; streaming bodies are parsed as SSE
//! by [`streaming::chunk_stream`].

pub mod config;
pub mod streaming;
pub mod types;

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

use llmux_core::llm::{BoxLlmProvider, ChunkStream, LlmProvider};
use llmux_core::ports::credential::CredentialHandle;
use llmux_core::registry::{ProviderContext, ProviderRegistration, ProviderRegistry};
use llmux_types::error::LlmError;
use llmux_types::llm::{ChatRequest, ChatResponse, ModelInfo, ProviderFeature, StreamChunk};

use self::config::{BUILTIN_PROFILES, OpenAiCompatProfile};
use self::streaming::chunk_stream;
use self::types::{
    WireErrorBody, WireModelList, WireRequest, WireResponse, from_wire_response, to_wire_request,
};

/// Per-call network timeout when the provider settings do not set one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Adapter for any OpenAI-compatible chat completions API.
///
/// The API key is resolved through the provider's [`CredentialHandle`] on
/// every call and only ever lands in the `Authorization` header.
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    http: reqwest::Client,
    name: String,
    base_url: String,
    default_model: String,
    timeout: Duration,
    headers: HashMap<String, String>,
    credentials: CredentialHandle,
    requires_key: bool,
    features: Vec<ProviderFeature>,
}

impl OpenAiCompatibleProvider {
    /// Build an adapter from its registry context.
    ///
    /// `ctx.settings` must carry a `base_url`. Keyless adapters send no
    /// `Authorization` header when the credential lookup finds nothing.
    pub fn from_context(
        ctx: ProviderContext,
        requires_key: bool,
        features: &[ProviderFeature],
    ) -> Result<Self, LlmError> {
        let base_url = ctx
            .settings
            .base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                LlmError::Configuration(format!("provider '{}' has no base_url", ctx.name))
            })?;

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to build HTTP client: {e}")))?;

        tracing::debug!(provider = %ctx.name, base_url = %base_url, "Creating OpenAI-compatible adapter");

        Ok(Self {
            http,
            name: ctx.name,
            base_url,
            default_model: ctx.settings.default_model.unwrap_or_default(),
            timeout: ctx
                .settings
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TIMEOUT),
            headers: ctx.settings.headers,
            credentials: ctx.credentials,
            requires_key,
            features: features.to_vec(),
        })
    }

    /// Registration for one built-in profile, with the profile's defaults.
    pub fn registration(profile: OpenAiCompatProfile) -> ProviderRegistration {
        ProviderRegistration::new(move |ctx| {
            Self::from_context(ctx, profile.requires_key, profile.features).map(BoxLlmProvider::new)
        })
        .with_defaults(profile.default_settings())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> Result<WireRequest, LlmError> {
        if request.messages.is_empty() {
            return Err(LlmError::InvalidRequest("request has no messages".to_string()));
        }
        let wire = to_wire_request(request, &self.default_model, stream);
        if wire.model.is_empty() {
            return Err(LlmError::InvalidRequest(format!(
                "no model given and provider '{}' has no default_model",
                self.name
            )));
        }
        Ok(wire)
    }

    /// Attach configured headers and the bearer token.
    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, LlmError> {
        let builder = self
            .headers
            .iter()
            .fold(builder, |builder, (key, value)| builder.header(key, value));

        match self.credentials.get().await {
            Ok(key) => Ok(builder.bearer_auth(key.expose_secret())),
            Err(LlmError::CredentialNotSet { .. }) if !self.requires_key => Ok(builder),
            Err(e) => Err(e),
        }
    }

    /// Send and map non-2xx statuses to [`LlmError`].
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, LlmError> {
        let response = builder.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after_ms(response.headers());
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(
            provider = %self.name,
            status = status.as_u16(),
            "Provider returned an error status"
        );
        Err(map_status(status.as_u16(), retry_after, &body))
    }

    fn timeout_error(&self) -> LlmError {
        LlmError::Timeout {
            after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            self.timeout_error()
        } else {
            LlmError::Provider {
                message: format!("HTTP request failed: {err}"),
                status: None,
            }
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = self.build_request(request, false)?;
        tracing::debug!(provider = %self.name, model = %body.model, "Sending chat completion");

        let builder = self
            .http
            .post(self.endpoint("chat/completions"))
            .timeout(self.timeout)
            .json(&body);
        let response = self.send(self.authorize(builder).await?).await?;

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Deserialization(format!("failed to parse response: {e}")))?;
        Ok(from_wire_response(wire, &self.name))
    }
}

impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, feature: ProviderFeature) -> bool {
        self.features.contains(&feature)
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, LlmError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = self.complete(request) => result,
        }
    }

    fn chat_stream(&self, request: ChatRequest, cancel: CancellationToken) -> ChunkStream {
        let body = match self.build_request(&request, true) {
            Ok(body) => body,
            Err(e) => {
                return Box::pin(futures_util::stream::once(async move {
                    Err::<StreamChunk, _>(e)
                }));
            }
        };
        let this = self.clone();

        Box::pin(async_stream::try_stream! {
            tracing::debug!(provider = %this.name, model = %body.model, "Opening chat stream");
            let builder = this.http.post(this.endpoint("chat/completions")).json(&body);
            let builder = this.authorize(builder).await?;

            // The timeout covers connecting and the response head; the body
            // is bounded by the stream driver's own deadline.
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LlmError::Cancelled),
                response = tokio::time::timeout(this.timeout, this.send(builder)) => {
                    response.unwrap_or_else(|_| Err(this.timeout_error()))
                }
            }?;

            let mut chunks = Box::pin(chunk_stream(response.bytes_stream(), cancel));
            while let Some(chunk) = chunks.next().await {
                yield chunk?;
            }
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let builder = self.http.get(self.endpoint("models")).timeout(self.timeout);
        let response = self.send(self.authorize(builder).await?).await?;
        let list: WireModelList = response
            .json()
            .await
            .map_err(|e| LlmError::Deserialization(format!("failed to parse model list: {e}")))?;
        Ok(list.data.into_iter().map(ModelInfo::from).collect())
    }
}

/// Register every built-in OpenAI-compatible provider.
pub fn register_builtin_providers(registry: &ProviderRegistry) {
    for profile in BUILTIN_PROFILES {
        registry.register_builtin(profile.name, OpenAiCompatibleProvider::registration(profile));
    }
    tracing::debug!(count = BUILTIN_PROFILES.len(), "Registered built-in providers");
}

/// Map a non-2xx status and its body to an error.
pub fn map_status(status: u16, retry_after_ms: Option<u64>, body: &str) -> LlmError {
    let message = error_message(status, body);
    match status {
        401 | 403 => LlmError::AuthenticationFailed,
        429 => LlmError::RateLimited { retry_after_ms },
        503 | 529 => LlmError::Overloaded(message),
        400 | 422 => LlmError::InvalidRequest(message),
        _ => LlmError::Provider {
            message,
            status: Some(status),
        },
    }
}

fn error_message(status: u16, body: &str) -> String {
    match serde_json::from_str::<WireErrorBody>(body) {
        Ok(parsed) if !parsed.error.message.is_empty() => parsed.error.message,
        _ if body.trim().is_empty() => format!("HTTP {status}"),
        _ => format!("HTTP {status}: {}", body.trim()),
    }
}

/// Wait hint from `retry-after-ms` (milliseconds) or `retry-after` (seconds).
pub fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(ms) = header("retry-after-ms").and_then(|v| v.trim().parse::<u64>().ok()) {
        return Some(ms);
    }
    header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| (secs * 1000.0).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;
    use crate::secret::StaticCredentialProvider;
    use llmux_core::event::EventBus;
    use llmux_core::ports::credential::{CredentialProvider, NoCredentials};
    use llmux_types::config::{ClientConfig, ProviderSettings};
    use llmux_types::error::ErrorKind;
    use llmux_types::llm::ChatMessage;

    fn context<C: CredentialProvider + 'static>(
        name: &str,
        base_url: &str,
        credentials: C,
    ) -> ProviderContext {
        ProviderContext {
            name: name.to_string(),
            settings: ProviderSettings {
                base_url: Some(base_url.to_string()),
                default_model: Some("test-model".to_string()),
                ..Default::default()
            },
            events: EventBus::new(16),
            credentials: CredentialHandle::new(name, Arc::new(credentials)),
        }
    }

    fn keyed(base_url: &str) -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::from_context(
            context("test", base_url, StaticCredentialProvider::new().with_key("test", "sk-test")),
            true,
            &[ProviderFeature::Streaming],
        )
        .unwrap()
    }

    fn hello() -> ChatRequest {
        ChatRequest::new("test", "").with_message(ChatMessage::user("hello"))
    }

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(response: String) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        (format!("http://{addr}/v1"), rx)
    }

    fn http_response(status: &str, content_type: &str, extra: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n{extra}Connection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_status(401, None, ""), LlmError::AuthenticationFailed);
        assert_eq!(map_status(403, None, ""), LlmError::AuthenticationFailed);
        assert_eq!(
            map_status(429, Some(1500), ""),
            LlmError::RateLimited {
                retry_after_ms: Some(1500)
            }
        );
        assert_eq!(map_status(529, None, "").kind(), ErrorKind::Overloaded);
        assert_eq!(map_status(503, None, "").kind(), ErrorKind::Overloaded);
        assert_eq!(
            map_status(400, None, r#"{"error":{"message":"bad model","type":"invalid_request_error"}}"#),
            LlmError::InvalidRequest("bad model".to_string())
        );

        let server = map_status(500, None, "upstream exploded");
        assert_eq!(
            server,
            LlmError::Provider {
                message: "HTTP 500: upstream exploded".to_string(),
                status: Some(500)
            }
        );
        assert!(server.is_retryable());
        assert!(!map_status(404, None, "").is_retryable());
    }

    #[test]
    fn retry_after_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_ms(&headers), None);

        headers.insert("retry-after", HeaderValue::from_static("2"));
        assert_eq!(retry_after_ms(&headers), Some(2000));

        headers.insert("retry-after", HeaderValue::from_static("0.25"));
        assert_eq!(retry_after_ms(&headers), Some(250));

        headers.insert("retry-after-ms", HeaderValue::from_static("750"));
        assert_eq!(retry_after_ms(&headers), Some(750));

        let mut dated = HeaderMap::new();
        dated.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after_ms(&dated), None);
    }

    #[test]
    fn missing_base_url_is_configuration_error() {
        let mut ctx = context("custom", "http://unused", NoCredentials);
        ctx.settings.base_url = None;
        let err = OpenAiCompatibleProvider::from_context(ctx, true, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let provider = keyed("https://api.example.com/v1/");
        assert_eq!(provider.base_url(), "https://api.example.com/v1");
        assert_eq!(
            provider.endpoint("chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn empty_request_is_rejected_before_sending() {
        let provider = keyed("https://api.example.com/v1");
        let err = provider
            .build_request(&ChatRequest::new("test", "m"), false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn keyless_provider_sends_no_authorization() {
        let provider = OpenAiCompatibleProvider::from_context(
            context("ollama", "http://localhost:11434/v1", NoCredentials),
            false,
            &[],
        )
        .unwrap();
        let request = provider
            .authorize(provider.http.get(provider.endpoint("models")))
            .await
            .unwrap()
            .build()
            .unwrap();
        assert!(request.headers().get("authorization").is_none());
    }

    #[tokio::test]
    async fn keyed_provider_without_key_fails() {
        let provider = OpenAiCompatibleProvider::from_context(
            context("openai", "https://api.openai.com/v1", NoCredentials),
            true,
            &[],
        )
        .unwrap();
        let err = provider.chat(&hello(), CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialNotSet);
    }

    #[tokio::test]
    async fn bearer_token_and_custom_headers_are_attached() {
        let mut ctx = context(
            "test",
            "https://api.example.com/v1",
            StaticCredentialProvider::new().with_key("test", "sk-secret"),
        );
        ctx.settings
            .headers
            .insert("x-org".to_string(), "acme".to_string());
        let provider = OpenAiCompatibleProvider::from_context(ctx, true, &[]).unwrap();

        let request = provider
            .authorize(provider.http.get(provider.endpoint("models")))
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer sk-secret");
        assert_eq!(request.headers()["x-org"], "acme");
    }

    #[tokio::test]
    async fn chat_round_trip_against_local_server() {
        let body = r#"{"id":"chatcmpl-9","created":1700000000,"model":"test-model","choices":[{"index":0,"message":{"role":"assistant","content":"Hi there"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#;
        let (base_url, seen) = serve_once(http_response("200 OK", "application/json", "", body)).await;

        let response = keyed(&base_url)
            .chat(&hello(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "Hi there");
        assert_eq!(response.provider, "test");
        assert_eq!(response.usage.unwrap().total_tokens, 5);

        let raw = seen.await.unwrap();
        assert!(raw.starts_with("POST /v1/chat/completions"));
        assert!(raw.to_lowercase().contains("authorization: bearer sk-test"));
        assert!(raw.contains("\"model\":\"test-model\""));
    }

    #[tokio::test]
    async fn rate_limit_status_carries_retry_hint() {
        let (base_url, _seen) = serve_once(http_response(
            "429 Too Many Requests",
            "application/json",
            "Retry-After: 3\r\n",
            r#"{"error":{"message":"slow down"}}"#,
        ))
        .await;

        let err = keyed(&base_url)
            .chat(&hello(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LlmError::RateLimited {
                retry_after_ms: Some(3000)
            }
        );
    }

    #[tokio::test]
    async fn stream_round_trip_against_local_server() {
        let sse = concat!(
            "data: {\"id\":\"c\",\"model\":\"test-model\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"id\":\"c\",\"model\":\"test-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c\",\"model\":\"test-model\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        let (base_url, seen) =
            serve_once(http_response("200 OK", "text/event-stream", "", sse)).await;

        let chunks: Vec<_> = keyed(&base_url)
            .chat_stream(hello(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        let text: String = chunks
            .iter()
            .filter_map(|c| c.as_ref().unwrap().choices.first())
            .filter_map(|choice| choice.delta.content.clone())
            .collect();
        assert_eq!(text, "Hello");
        assert!(chunks[2].as_ref().unwrap().usage.is_some());

        let raw = seen.await.unwrap();
        assert!(raw.contains("\"stream\":true"));
        assert!(raw.contains("\"include_usage\":true"));
    }

    #[tokio::test]
    async fn stalled_stream_open_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let mut ctx = context(
            "test",
            &format!("http://{addr}/v1"),
            StaticCredentialProvider::new().with_key("test", "sk-test"),
        );
        ctx.settings.timeout_ms = Some(200);
        let provider =
            OpenAiCompatibleProvider::from_context(ctx, true, &[ProviderFeature::Streaming]).unwrap();

        let chunks: Vec<_> = provider
            .chat_stream(hello(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], Err(LlmError::Timeout { after_ms: 200 }));
    }

    #[tokio::test]
    async fn cancelled_chat_returns_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = keyed("http://127.0.0.1:9/v1")
            .chat(&hello(), cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::Cancelled);
    }

    #[tokio::test]
    async fn builtins_are_registered_with_user_overrides() {
        let mut config = ClientConfig::default();
        config.providers.insert(
            "ollama".to_string(),
            ProviderSettings {
                base_url: Some("http://gpu-box:11434/v1".to_string()),
                ..Default::default()
            },
        );
        let registry = ProviderRegistry::new(
            &config,
            Arc::new(NoCredentials),
            EventBus::new(16),
        );
        register_builtin_providers(&registry);

        assert_eq!(
            registry.provider_names(),
            vec!["groq", "mistral", "ollama", "openai", "together"]
        );
        let ollama = registry.get_provider("ollama").unwrap();
        assert_eq!(ollama.name(), "ollama");
        assert!(ollama.supports(ProviderFeature::Streaming));
        assert!(!ollama.supports(ProviderFeature::Vision));
        assert!(registry.get_provider("openai").unwrap().supports(ProviderFeature::Vision));
    }

    #[test]
    fn secret_is_not_in_debug_output() {
        let provider = OpenAiCompatibleProvider::from_context(
            context(
                "test",
                "https://api.example.com/v1",
                StaticCredentialProvider::new().with_key("test", "sk-very-secret"),
            ),
            true,
            &[],
        )
        .unwrap();
        let debug = format!("{provider:?}");
        assert!(!debug.contains("sk-very-secret"));
    }
}
