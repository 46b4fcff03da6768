//! LlmProvider trait definition.
//!
//! This is the core abstraction every text generation backend implements.
//! Streaming is the only call the conversation core needs, and it must
//! honour a cancellation token so generation stops once nobody is listening.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use palaver_types::llm::{CompletionRequest, LlmError, StreamEvent};

/// Boxed stream of backend events.
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send + 'static>>;

/// Trait for text generation backends (OpenAI-compatible, Ollama, ...).
///
/// The `stream` method returns a boxed stream because streams need to be
/// object-safe for `BoxLlmProvider`.
///
/// Implementations live in palaver-infra (e.g., `OllamaProvider`).
pub trait LlmProvider: Send + Sync {
    /// Backend name (e.g., "openai", "ollama").
    fn name(&self) -> &str;

    /// Model the backend generates with when the request leaves it empty.
    fn model(&self) -> &str;

    /// Send a streaming completion request.
    ///
    /// Implementations should stop reading from the network once `cancel`
    /// fires. [`guard_cancellation`] enforces this at the boundary for
    /// implementations that only check the token between chunks.
    fn stream(&self, request: CompletionRequest, cancel: CancellationToken) -> LlmStream;
}

/// Wrap a backend stream so it ends with [`LlmError::Cancelled`] as soon as
/// `cancel` fires, dropping the inner stream without polling it again.
pub fn guard_cancellation(inner: LlmStream, cancel: CancellationToken) -> LlmStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    yield Err(LlmError::Cancelled);
                    break;
                }
                next = inner.next() => match next {
                    Some(item) => yield item,
                    None => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn endless() -> LlmStream {
        Box::pin(async_stream::stream! {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                yield Ok(StreamEvent::TextDelta { text: "x".to_string() });
            }
        })
    }

    #[tokio::test]
    async fn test_guard_passes_events_through() {
        let inner: LlmStream = Box::pin(futures_util::stream::iter(vec![
            Ok(StreamEvent::TextDelta {
                text: "a".to_string(),
            }),
            Ok(StreamEvent::Done),
        ]));
        let events: Vec<_> = guard_cancellation(inner, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Ok(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn test_guard_stops_endless_stream_on_cancel() {
        let cancel = CancellationToken::new();
        let mut stream = guard_cancellation(endless(), cancel.clone());

        assert!(matches!(stream.next().await, Some(Ok(_))));
        cancel.cancel();

        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("guarded stream should end promptly");
        assert!(matches!(next, Some(Err(LlmError::Cancelled))));
        assert!(stream.next().await.is_none());
    }
}
