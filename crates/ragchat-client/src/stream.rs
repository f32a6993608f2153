//! Streaming chat request client.
//!
//! Converts a chat response body into a cancellable `Stream<Item = SseEvent>`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use reqwest::StatusCode;
use serde::Serialize;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use ragchat_core::types::{ChatOptions, HistoryEntry};

use crate::events::{SseEvent, interpret};
use crate::sse::FrameDecoder;
use crate::{BackendClient, ClientError};

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub history: Vec<HistoryEntry>,
    #[serde(flatten)]
    pub options: ChatOptions,
}

type BoxEventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, ClientError>> + Send>>;

/// Lazily decoded events of one chat response.
///
/// Single use: it ends at transport end-of-stream, after the first transport
/// error, or once its cancellation token fires. Cancelling ends the stream with
/// `None` and drops the response, releasing the connection.
pub struct EventStream {
    inner: BoxEventStream,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    token: CancellationToken,
    finished: bool,
}

impl EventStream {
    pub fn new<S>(inner: S) -> Self
    where
        S: Stream<Item = Result<SseEvent, ClientError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        Self {
            inner: Box::pin(inner),
            cancelled: Box::pin(token.clone().cancelled_owned()),
            token,
            finished: false,
        }
    }

    /// A stream that yields the given events and ends.
    pub fn from_events(events: Vec<SseEvent>) -> Self {
        Self::new(futures::stream::iter(events.into_iter().map(Ok)))
    }

    /// Handle that aborts this stream from anywhere.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drop the underlying transport and refuse further pulls.
    fn release(&mut self) {
        self.finished = true;
        self.inner = Box::pin(futures::stream::empty::<Result<SseEvent, ClientError>>());
    }
}

impl Stream for EventStream {
    type Item = Result<SseEvent, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            debug!("Chat stream cancelled");
            this.release();
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.release();
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

struct DecodeState<S> {
    bytes: Pin<Box<S>>,
    decoder: FrameDecoder,
    ready: VecDeque<SseEvent>,
}

/// Decode a byte stream into chat events, pulling one chunk at a time.
pub fn decode_events<S>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: FrameDecoder::new(),
        ready: VecDeque::new(),
    };

    EventStream::new(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state
                        .ready
                        .extend(state.decoder.feed(&chunk).iter().filter_map(interpret));
                }
                Some(Err(e)) => {
                    return Some((Err(ClientError::Http(e)), state));
                }
                None => {
                    state.decoder.finish();
                    return None;
                }
            }
        }
    }))
}

impl BackendClient {
    /// Open `POST /api/chat` and return its event stream.
    ///
    /// Fails before producing any event when the status is not a success or
    /// the response has no body.
    pub async fn stream_chat(
        &self,
        message: &str,
        history: Vec<HistoryEntry>,
        options: ChatOptions,
    ) -> Result<EventStream, ClientError> {
        let request = ChatRequest {
            message: message.to_string(),
            history,
            options,
        };
        self.open_chat(&request).await
    }

    pub(crate) async fn open_chat(&self, request: &ChatRequest) -> Result<EventStream, ClientError> {
        debug!(
            base_url = %self.base_url,
            history_len = request.history.len(),
            "Opening chat stream"
        );

        let response = self
            .http
            .post(self.url("/api/chat"))
            .header("accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::ChatRequestFailed {
                status: status.as_u16(),
            });
        }
        if status == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Err(ClientError::NoResponseBody);
        }

        Ok(decode_events(response.bytes_stream()))
    }
}
