//! SSE streaming chat endpoints.
//!
//! - POST /api/v1/chat/sessions/stream : start a conversation and stream the reply
//! - POST /api/v1/chat/send-stream     : continue a conversation and stream the reply
//!
//! The chat turn runs on its own task and writes frames into a bounded
//! channel; this module turns them into SSE events:
//! - `data: {"sessionId": "..."}` : only when a session was created
//! - `data: <chunk>` : incremental reply text
//! - `data: [DONE]` : stream complete
//! - `event: error` : the turn failed after the stream started
//!
//! Failures before the first frame are returned as ordinary JSON errors.
//! Dropping the response (client disconnect) or server shutdown cancels the
//! turn.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use palaver_core::chat::ChatRequest;
use palaver_core::session::sink::{ChannelSink, STREAM_FAILED_MESSAGE, StreamFrame};
use palaver_types::error::GatewayError;

use crate::http::error::AppError;
use crate::http::extractors::username::Username;
use crate::state::AppState;

/// Frames buffered between the chat task and the HTTP response.
const FRAME_BUFFER: usize = 64;

/// Request body for starting a conversation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionStreamRequest {
    pub question: String,
    pub model_type: Option<String>,
}

/// Request body for sending into a conversation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendStreamRequest {
    pub question: String,
    pub model_type: Option<String>,
    pub session_id: String,
}

/// POST /api/v1/chat/sessions/stream
pub async fn create_session_stream(
    State(state): State<AppState>,
    Username(username): Username,
    Json(body): Json<NewSessionStreamRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let request = ChatRequest {
        username,
        question: body.question,
        model_type: body.model_type,
        session_id: None,
    };
    open_stream(state, request).await
}

/// POST /api/v1/chat/send-stream
pub async fn send_stream(
    State(state): State<AppState>,
    Username(username): Username,
    Json(body): Json<SendStreamRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if body.session_id.trim().is_empty() {
        return Err(AppError::Validation("sessionId is required".to_string()));
    }
    let request = ChatRequest {
        username,
        question: body.question,
        model_type: body.model_type,
        session_id: Some(body.session_id),
    };
    open_stream(state, request).await
}

/// SSE fields cannot carry carriage returns; line breaks become `data:` lines.
fn frame_event(frame: &StreamFrame) -> Event {
    let data = frame.data().replace("\r\n", "\n").replace('\r', "\n");
    let event = Event::default().data(data);
    match frame.event() {
        Some(name) => event.event(name),
        None => event,
    }
}

fn failure_event() -> Event {
    frame_event(&StreamFrame::Error(STREAM_FAILED_MESSAGE.to_string()))
}

async fn open_stream(
    state: AppState,
    request: ChatRequest,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if request.question.trim().is_empty() {
        return Err(AppError::Validation("question is required".to_string()));
    }

    let (sink, mut rx) = ChannelSink::channel(FRAME_BUFFER);
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();
    let task = spawn_turn(state, request, cancel, sink);

    // Hold the response until the turn produced output, so early failures
    // keep their HTTP status.
    let Some(first) = rx.recv().await else {
        return Err(match task.await {
            Ok(Err(e)) => e.into(),
            Ok(Ok(())) => AppError::Internal("chat turn ended without output".to_string()),
            Err(e) => AppError::Internal(format!("chat task failed: {e}")),
        });
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, Infallible>(frame_event(&first));
        while let Some(frame) = rx.recv().await {
            yield Ok(frame_event(&frame));
        }
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancellation() => {}
            Ok(Err(_)) => yield Ok(failure_event()),
            Err(e) => {
                warn!(error = %e, "chat task failed");
                yield Ok(failure_event());
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Run one chat turn. The sink is dropped when the turn ends, which closes
/// the frame channel.
fn spawn_turn(
    state: AppState,
    request: ChatRequest,
    cancel: CancellationToken,
    mut sink: ChannelSink,
) -> JoinHandle<Result<(), GatewayError>> {
    tokio::spawn(async move {
        let username = request.username.clone();
        match state.chat_service.stream_chat(request, &cancel, &mut sink).await {
            Ok(outcome) => {
                debug!(
                    username = %username,
                    session_id = %outcome.session_id,
                    created = outcome.created,
                    "chat turn complete"
                );
                Ok(())
            }
            Err(e) if e.is_cancellation() => {
                debug!(username = %username, "chat turn cancelled");
                Err(e)
            }
            Err(e) => {
                warn!(username = %username, error = %e, "chat turn failed");
                Err(e)
            }
        }
    })
}
