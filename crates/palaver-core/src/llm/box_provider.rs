//! BoxLlmProvider -- object-safe dynamic dispatch wrapper for LlmProvider.
//!
//! 1. Define an object-safe `LlmProviderDyn` trait
//! 2. Blanket-impl `LlmProviderDyn` for all `T: LlmProvider`
//! 3. `BoxLlmProvider` wraps `Box<dyn LlmProviderDyn>` and delegates

use tokio_util::sync::CancellationToken;

use palaver_types::llm::CompletionRequest;

use super::provider::{guard_cancellation, LlmProvider, LlmStream};

/// Object-safe version of [`LlmProvider`].
///
/// A blanket implementation is provided for all types implementing `LlmProvider`.
pub trait LlmProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn stream_boxed(&self, request: CompletionRequest, cancel: CancellationToken) -> LlmStream;
}

impl<T: LlmProvider> LlmProviderDyn for T {
    fn name(&self) -> &str {
        LlmProvider::name(self)
    }

    fn model(&self) -> &str {
        LlmProvider::model(self)
    }

    fn stream_boxed(&self, request: CompletionRequest, cancel: CancellationToken) -> LlmStream {
        self.stream(request, cancel)
    }
}

/// Type-erased backend, selected at runtime by the backend factory.
pub struct BoxLlmProvider {
    inner: Box<dyn LlmProviderDyn + Send + Sync>,
}

impl BoxLlmProvider {
    /// Wrap a concrete `LlmProvider` in a type-erased box.
    pub fn new<T: LlmProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn model(&self) -> &str {
        self.inner.model()
    }

    /// Start a streaming completion that ends promptly once `cancel` fires.
    pub fn stream(&self, request: CompletionRequest, cancel: CancellationToken) -> LlmStream {
        let inner = self.inner.stream_boxed(request, cancel.clone());
        guard_cancellation(inner, cancel)
    }
}

impl std::fmt::Debug for BoxLlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxLlmProvider")
            .field("name", &self.name())
            .field("model", &self.model())
            .finish()
    }
}
