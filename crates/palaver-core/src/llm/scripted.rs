//! Scripted backend that replays a fixed reply.
//!
//! Used by tests across the workspace to drive the conversation core
//! without network access. Chunks can be delayed, and the stream can be
//! told to fail after a number of chunks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use palaver_types::llm::{CompletionRequest, LlmError, StreamEvent};

use super::provider::{LlmProvider, LlmStream};

/// A backend that streams a predetermined list of chunks.
#[derive(Clone)]
pub struct ScriptedProvider {
    chunks: Vec<String>,
    fail_after: Option<usize>,
    delay: Duration,
    /// Number of chunks produced across all calls.
    produced: Arc<AtomicUsize>,
    /// Prompt sizes seen by each call, in call order.
    prompts: Arc<std::sync::Mutex<Vec<usize>>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            fail_after: None,
            delay: Duration::ZERO,
            produced: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Fail with a stream error after emitting `n` chunks.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Sleep between chunks.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    /// Number of messages in the prompt of every call so far.
    pub fn prompt_sizes(&self) -> Vec<usize> {
        self.prompts.lock().expect("prompt log poisoned").clone()
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    fn stream(&self, request: CompletionRequest, cancel: CancellationToken) -> LlmStream {
        self.prompts
            .lock()
            .expect("prompt log poisoned")
            .push(request.messages.len());

        let chunks = self.chunks.clone();
        let fail_after = self.fail_after;
        let delay = self.delay;
        let produced = self.produced.clone();

        Box::pin(async_stream::stream! {
            yield Ok(StreamEvent::Connected);
            for (i, chunk) in chunks.into_iter().enumerate() {
                if fail_after == Some(i) {
                    yield Err(LlmError::Stream("scripted failure".to_string()));
                    return;
                }
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
                produced.fetch_add(1, Ordering::SeqCst);
                yield Ok(StreamEvent::TextDelta { text: chunk });
            }
            if fail_after.is_some() {
                yield Err(LlmError::Stream("scripted failure".to_string()));
                return;
            }
            yield Ok(StreamEvent::Done);
        })
    }
}
