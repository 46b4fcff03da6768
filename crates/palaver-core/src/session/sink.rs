//! Chunk sink: the boundary between the conversation core and the
//! caller's transport.
//!
//! The core writes reply text in order, flushes after every chunk, and
//! writes a terminal marker once the reply is complete. A sink error means
//! the caller is gone, and the core stops pulling from the backend.

use std::future::Future;

use tokio::sync::mpsc;

/// Terminal marker written after the last content chunk.
pub const DONE_MARKER: &str = "[DONE]";

/// Fixed message sent to clients when a stream fails after it started.
pub const STREAM_FAILED_MESSAGE: &str = "failed to generate response";

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("stream receiver dropped")]
    Closed,

    #[error("write failed: {0}")]
    Write(String),
}

/// Ordered destination for streamed reply text.
pub trait ChunkSink: Send {
    /// Deliver one chunk of reply text.
    fn send(&mut self, chunk: &str) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Push buffered chunks to the client.
    fn flush(&mut self) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Write the terminal marker. No chunks follow.
    fn finish(&mut self) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Tell the client the id of a newly created session.
    fn announce_session(
        &mut self,
        _session_id: &str,
    ) -> impl Future<Output = Result<(), SinkError>> + Send {
        async { Ok(()) }
    }
}

/// One server-sent frame produced by a chat stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    SessionCreated(String),
    Chunk(String),
    Done,
    Error(String),
}

impl StreamFrame {
    /// The `data:` payload of this frame.
    pub fn data(&self) -> String {
        match self {
            StreamFrame::SessionCreated(id) => {
                format!("{{\"sessionId\": {}}}", serde_json::Value::String(id.clone()))
            }
            StreamFrame::Chunk(text) => text.clone(),
            StreamFrame::Done => DONE_MARKER.to_string(),
            StreamFrame::Error(message) => serde_json::json!({ "message": message }).to_string(),
        }
    }

    /// SSE event name, if the frame is not a plain data event.
    pub fn event(&self) -> Option<&'static str> {
        match self {
            StreamFrame::Error(_) => Some("error"),
            _ => None,
        }
    }

    /// Full SSE encoding, one `data:` line per payload line.
    pub fn to_sse(&self) -> String {
        let mut out = String::new();
        if let Some(event) = self.event() {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data().split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Sink backed by a bounded channel. The receiving half is the transport.
///
/// When the receiver is dropped (client disconnected) every write fails
/// with [`SinkError::Closed`].
pub struct ChannelSink {
    tx: mpsc::Sender<StreamFrame>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamFrame>) -> Self {
        Self { tx }
    }

    /// Create a sink and its receiving half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Report a failure in place of the terminal marker.
    pub async fn fail(&mut self, message: &str) -> Result<(), SinkError> {
        self.push(StreamFrame::Error(message.to_string())).await
    }

    async fn push(&mut self, frame: StreamFrame) -> Result<(), SinkError> {
        self.tx.send(frame).await.map_err(|_| SinkError::Closed)
    }
}

impl ChunkSink for ChannelSink {
    async fn send(&mut self, chunk: &str) -> Result<(), SinkError> {
        self.push(StreamFrame::Chunk(chunk.to_string())).await
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.tx.is_closed() {
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.push(StreamFrame::Done).await
    }

    async fn announce_session(&mut self, session_id: &str) -> Result<(), SinkError> {
        self.push(StreamFrame::SessionCreated(session_id.to_string()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_frame_wire_format() {
        let frame = StreamFrame::SessionCreated("abc-123".to_string());
        assert_eq!(frame.to_sse(), "data: {\"sessionId\": \"abc-123\"}\n\n");
    }

    #[test]
    fn test_chunk_and_done_wire_format() {
        assert_eq!(StreamFrame::Chunk("Hel".to_string()).to_sse(), "data: Hel\n\n");
        assert_eq!(StreamFrame::Done.to_sse(), "data: [DONE]\n\n");
    }

    #[test]
    fn test_multiline_chunk_splits_data_lines() {
        let frame = StreamFrame::Chunk("a\nb".to_string());
        assert_eq!(frame.to_sse(), "data: a\ndata: b\n\n");
    }

    #[test]
    fn test_error_frame_is_named_event() {
        let frame = StreamFrame::Error("boom".to_string());
        assert_eq!(frame.to_sse(), "event: error\ndata: {\"message\":\"boom\"}\n\n");
    }

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (mut sink, mut rx) = ChannelSink::channel(8);
        sink.announce_session("s").await.unwrap();
        sink.send("one").await.unwrap();
        sink.send("two").await.unwrap();
        sink.finish().await.unwrap();
        drop(sink);

        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(f);
        }
        assert_eq!(
            frames,
            vec![
                StreamFrame::SessionCreated("s".to_string()),
                StreamFrame::Chunk("one".to_string()),
                StreamFrame::Chunk("two".to_string()),
                StreamFrame::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_sink_errors_after_receiver_drop() {
        let (mut sink, rx) = ChannelSink::channel(8);
        drop(rx);
        assert!(matches!(sink.send("x").await, Err(SinkError::Closed)));
        assert!(matches!(sink.flush().await, Err(SinkError::Closed)));
    }
}
