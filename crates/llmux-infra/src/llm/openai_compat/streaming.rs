//! Server-sent events to [`StreamChunk`] adapter.
//!
//! The body of a streaming chat completion is a sequence of `data:` events,
//! each holding one JSON chunk, terminated by `data: [DONE]`. Parsing is
//! delegated to `eventsource-stream`, which handles UTF-8 boundaries and
//! multi-line events.

use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use llmux_types::error::LlmError;
use llmux_types::llm::StreamChunk;

use super::types::{WireChunk, WireErrorBody, from_wire_chunk};

const DONE_MARKER: &str = "[DONE]";

/// Outcome of parsing one SSE payload.
#[derive(Debug, PartialEq)]
pub enum SsePayload {
    Chunk(StreamChunk),
    Done,
    Skip,
}

/// Parse the `data` field of one SSE event.
pub fn parse_sse_data(data: &str) -> Result<SsePayload, LlmError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(SsePayload::Skip);
    }
    if data == DONE_MARKER {
        return Ok(SsePayload::Done);
    }

    // Every chunk field is optional, so an error event would also parse as
    // an empty chunk.
    if let Ok(body) = serde_json::from_str::<WireErrorBody>(data) {
        return Err(LlmError::provider(body.error.message));
    }
    serde_json::from_str::<WireChunk>(data)
        .map(|chunk| SsePayload::Chunk(from_wire_chunk(chunk)))
        .map_err(|e| LlmError::Deserialization(format!("failed to parse stream chunk: {e}")))
}

/// Turn a response body into canonical chunks.
///
/// Ends after `[DONE]` or when the body ends. Cancelling `cancel` yields a
/// final [`LlmError::Cancelled`] and stops reading.
pub fn chunk_stream<S, B, E>(
    body: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StreamChunk, LlmError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::try_stream! {
        let mut events = Box::pin(body.eventsource());

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LlmError::Cancelled),
                next = events.next() => Ok(next),
            };
            let Some(event) = next? else {
                break;
            };
            let event = event.map_err(|e| LlmError::Stream(format!("SSE parsing error: {e}")))?;

            match parse_sse_data(&event.data)? {
                SsePayload::Chunk(chunk) => yield chunk,
                SsePayload::Done => break,
                SsePayload::Skip => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn body(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
        let parts: Vec<Result<Vec<u8>, std::io::Error>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(parts)
    }

    async fn collect(parts: &[&str]) -> Vec<Result<StreamChunk, LlmError>> {
        chunk_stream(body(parts), CancellationToken::new())
            .collect()
            .await
    }

    #[test]
    fn done_and_blank_payloads() {
        assert_eq!(parse_sse_data("[DONE]").unwrap(), SsePayload::Done);
        assert_eq!(parse_sse_data("  ").unwrap(), SsePayload::Skip);
    }

    #[test]
    fn error_payload_becomes_provider_error() {
        let err = parse_sse_data(r#"{"error":{"message":"model overloaded","type":"server_error"}}"#)
            .unwrap_err();
        assert_eq!(err, LlmError::provider("model overloaded"));
    }

    #[test]
    fn null_error_field_still_parses_as_chunk() {
        let payload = parse_sse_data(
            r#"{"id":"c","error":null,"choices":[{"index":0,"delta":{"content":"hi"}}]}"#,
        )
        .unwrap();
        let SsePayload::Chunk(chunk) = payload else {
            panic!("expected a chunk, got {payload:?}");
        };
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn error_event_mid_stream_ends_with_provider_error() {
        let chunks = collect(&[
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"upstream died\",\"type\":\"server_error\"}}\n\n",
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
        ])
        .await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert_eq!(chunks[1], Err(LlmError::provider("upstream died")));
    }

    #[test]
    fn garbage_payload_is_deserialization_error() {
        let err = parse_sse_data("{not json").unwrap_err();
        assert_eq!(err.kind(), llmux_types::error::ErrorKind::Deserialization);
    }

    #[tokio::test]
    async fn text_chunks_until_done() {
        let chunks = collect(&[
            "data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"id\":\"ignored\",\"choices\":[]}\n\n",
        ])
        .await;

        assert_eq!(chunks.len(), 2);
        let first = chunks[0].as_ref().unwrap();
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("Hel"));
        let second = chunks[1].as_ref().unwrap();
        assert_eq!(second.choices[0].delta.content.as_deref(), Some("lo"));
    }

    #[tokio::test]
    async fn events_split_across_reads_are_reassembled() {
        let chunks = collect(&[
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,",
            "\"delta\":{\"content\":\"joined\"}}]}\n",
            "\n",
        ])
        .await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].as_ref().unwrap().choices[0].delta.content.as_deref(),
            Some("joined")
        );
    }

    #[tokio::test]
    async fn malformed_chunk_ends_stream_with_error() {
        let chunks = collect(&[
            "data: {\"id\":\"c\",\"choices\":[]}\n\n",
            "data: {oops\n\n",
            "data: {\"id\":\"never\",\"choices\":[]}\n\n",
        ])
        .await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(chunks[1].is_err());
    }

    #[tokio::test]
    async fn cancelled_token_stops_reading() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chunks: Vec<_> = chunk_stream(
            body(&["data: {\"id\":\"c\",\"choices\":[]}\n\n"]),
            cancel,
        )
        .collect()
        .await;

        assert_eq!(chunks, vec![Err(LlmError::Cancelled)]);
    }
}
