//! Conversation state machine.
//!
//! Idle ⇄ Streaming. A turn starts with `send_message`, appends the user
//! message and an empty streaming placeholder in one state update, then folds
//! the backend's events into that placeholder in arrival order. At most one
//! turn is in flight; a send during a turn is dropped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use ragchat_client::{ChatRequest, ChatTransport, ClientError, SseEvent};
use ragchat_core::types::{ChatOptions, ChunksInfo, ConversationState, Message};
use ragchat_core::wire;

use crate::error_codes;

/// One conversation session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Conversation {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn ChatTransport>,
    state: watch::Sender<ConversationState>,
    in_flight: AtomicBool,
    active_turn: Mutex<Option<CancellationToken>>,
}

impl Conversation {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                state: watch::Sender::new(ConversationState::default()),
                in_flight: AtomicBool::new(false),
                active_turn: Mutex::new(None),
            }),
        }
    }

    /// Current state.
    pub fn snapshot(&self) -> ConversationState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.inner.state.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Run one turn to completion.
    ///
    /// Silently does nothing when `content` is blank or a turn is already in
    /// flight. The check and the flag update happen before the first
    /// suspension point, so two sends polled back to back start one turn.
    pub async fn send_message(&self, content: &str, options: ChatOptions) {
        let content = content.trim();
        if content.is_empty() {
            return;
        }
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Send ignored, a turn is already in flight");
            return;
        }

        let user = Message::user(content);
        let placeholder = Message::assistant_placeholder();
        let assistant_id = placeholder.id;
        let _turn = TurnGuard {
            inner: &*self.inner,
            assistant_id,
        };

        let token = CancellationToken::new();
        *self.lock_active_turn() = Some(token.clone());

        // History is read in the same update that appends the new pair.
        let mut history = Vec::new();
        self.inner.state.send_modify(|state| {
            history = state.history();
            state.messages.push(user);
            state.messages.push(placeholder);
            state.is_loading = true;
        });

        let request = ChatRequest {
            message: content.to_string(),
            history,
            options,
        };

        if let Err(e) = self.run_turn(&request, assistant_id, &token).await {
            if token.is_cancelled() {
                debug!(%e, "Turn failed after cancellation, ignoring");
            } else {
                self.fail_turn(assistant_id, &e);
            }
        }
    }

    /// Empty the message list and clear the error.
    ///
    /// An in-flight turn is cancelled; nothing it received afterwards is
    /// applied, and `is_loading` drops once that turn has unwound.
    pub fn clear_messages(&self) {
        if let Some(token) = self.lock_active_turn().as_ref() {
            token.cancel();
        }
        self.inner.state.send_modify(|state| {
            state.messages.clear();
            state.error = None;
        });
    }

    /// Clear the error only.
    pub fn clear_error(&self) {
        self.inner.state.send_if_modified(|state| state.error.take().is_some());
    }

    async fn run_turn(
        &self,
        request: &ChatRequest,
        assistant_id: Uuid,
        token: &CancellationToken,
    ) -> Result<(), ClientError> {
        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            opened = self.inner.transport.stream_chat(request) => opened?,
        };

        let mut answer = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Turn cancelled, releasing stream");
                    return Ok(());
                }
                next = stream.next() => next,
            };
            match next {
                Some(event) => self.apply(assistant_id, event?, &mut answer),
                None => return Ok(()),
            }
        }
    }

    /// Fold one event into the turn's assistant message.
    fn apply(&self, assistant_id: Uuid, event: SseEvent, answer: &mut String) {
        match event {
            SseEvent::Token { token } => {
                answer.push_str(&token);
                let content = answer.clone();
                self.update_message(assistant_id, |m| m.content = content);
            }
            SseEvent::Sources { sources } => {
                let sources = wire::to_internal(&sources);
                self.update_message(assistant_id, |m| m.sources = Some(sources));
            }
            SseEvent::Chunks(payload) => {
                let retrieval = ChunksInfo::from(payload);
                self.update_message(assistant_id, |m| m.retrieval = Some(retrieval));
            }
            SseEvent::Done(done) => {
                debug!(processing_time_ms = ?done.processing_time_ms, "Turn complete");
                self.update_message(assistant_id, |m| {
                    m.is_streaming = false;
                    m.processing_time_ms = done.processing_time_ms;
                });
            }
            SseEvent::Error(err) => {
                let text = error_codes::user_facing(&err);
                warn!(code = ?err.code, %text, "Server reported an error");
                self.inner.state.send_modify(|state| {
                    state.error = Some(text.clone());
                    if let Some(m) = state.message_mut(assistant_id) {
                        m.content = text;
                        m.is_streaming = false;
                    }
                });
            }
            SseEvent::Unknown { event, .. } => {
                debug!(event, "Ignoring unknown event");
            }
        }
    }

    /// Show a transport or request failure as the session error and as the answer.
    fn fail_turn(&self, assistant_id: Uuid, err: &ClientError) {
        let text = err.user_message();
        warn!(%err, "Chat turn failed");
        self.inner.state.send_modify(|state| {
            state.error = Some(text.clone());
            if let Some(m) = state.message_mut(assistant_id).filter(|m| m.is_streaming) {
                m.content = text;
                m.is_streaming = false;
            }
        });
    }

    /// Mutate a message by id. No-op (and no notification) if it was cleared.
    fn update_message(&self, id: Uuid, f: impl FnOnce(&mut Message)) {
        self.inner
            .state
            .send_if_modified(|state| match state.message_mut(id) {
                Some(m) => {
                    f(m);
                    true
                }
                None => false,
            });
    }

    fn lock_active_turn(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.inner
            .active_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ends the turn however `send_message` exits, including when its future is dropped.
struct TurnGuard<'a> {
    inner: &'a Inner,
    assistant_id: Uuid,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .active_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Cleared inside the update so a new turn cannot start before
        // `is_loading` is published as false.
        self.inner.state.send_modify(|state| {
            state.is_loading = false;
            if let Some(m) = state.message_mut(self.assistant_id) {
                m.is_streaming = false;
            }
            self.inner.in_flight.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use ragchat_client::{BackendClient, DonePayload, ErrorPayload, EventStream};
    use ragchat_core::types::{ChunkingStrategy, Role};
    use ragchat_core::wire::WireSource;

    use super::*;

    enum Reply {
        Events(Vec<SseEvent>),
        /// Yield these events, then never finish.
        Hang(Vec<SseEvent>),
        /// Yield these events, then fail.
        Break(Vec<SseEvent>),
        Reject(ClientError),
    }

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn json_error() -> ClientError {
        ClientError::Json(serde_json::from_str::<serde_json::Value>("{").unwrap_err())
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream, ClientError> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Events(Vec::new()));
            match reply {
                Reply::Events(events) => Ok(EventStream::from_events(events)),
                Reply::Hang(events) => Ok(EventStream::new(
                    futures::stream::iter(events.into_iter().map(Ok))
                        .chain(futures::stream::pending()),
                )),
                Reply::Break(events) => Ok(EventStream::new(
                    futures::stream::iter(events.into_iter().map(Ok))
                        .chain(futures::stream::once(async { Err(json_error()) })),
                )),
                Reply::Reject(err) => Err(err),
            }
        }
    }

    fn token(t: &str) -> SseEvent {
        SseEvent::Token { token: t.into() }
    }

    fn done() -> SseEvent {
        SseEvent::Done(DonePayload {
            processing_time_ms: Some(120),
            ..Default::default()
        })
    }

    fn sample_sources() -> SseEvent {
        SseEvent::Sources {
            sources: vec![WireSource {
                filename: "sample.txt".into(),
                start_line: 1,
                end_line: 10,
                content_preview: "preview".into(),
            }],
        }
    }

    fn assistant(state: &ConversationState) -> &Message {
        state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .expect("assistant message")
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ConversationState>,
        pred: impl FnMut(&ConversationState) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_successful_turn() {
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![
            token("Hello"),
            token(" World"),
            sample_sources(),
            done(),
        ])]);
        let conv = Conversation::new(transport.clone());

        conv.send_message("What is this?", ChatOptions::default()).await;

        let state = conv.snapshot();
        assert!(!state.is_loading);
        assert!(state.error.is_none());
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].role, Role::User);
        assert_eq!(state.messages[0].content, "What is this?");

        let answer = assistant(&state);
        assert_eq!(answer.content, "Hello World");
        assert!(!answer.is_streaming);
        assert_eq!(answer.processing_time_ms, Some(120));
        let sources = answer.sources.as_ref().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].filename, "sample.txt");
        assert_eq!(sources[0].end_line, 10);
        assert!(!conv.is_loading());
    }

    #[tokio::test]
    async fn test_content_is_trimmed_and_options_forwarded() {
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![done()])]);
        let conv = Conversation::new(transport.clone());
        let options = ChatOptions {
            strategy: Some(ChunkingStrategy::Large),
            use_reranking: Some(true),
            ..Default::default()
        };

        conv.send_message("  padded  ", options).await;

        assert_eq!(conv.snapshot().messages[0].content, "padded");
        let requests = transport.requests();
        assert_eq!(requests[0].message, "padded");
        assert_eq!(requests[0].options, options);
    }

    #[tokio::test]
    async fn test_blank_messages_are_ignored() {
        let transport = ScriptedTransport::new(Vec::new());
        let conv = Conversation::new(transport.clone());
        let mut rx = conv.subscribe();

        conv.send_message("", ChatOptions::default()).await;
        conv.send_message("   ", ChatOptions::default()).await;

        let state = conv.snapshot();
        assert!(state.messages.is_empty());
        assert!(!state.is_loading);
        assert!(!rx.has_changed().unwrap());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_back_to_back_sends_start_one_turn() {
        let transport = ScriptedTransport::new(vec![
            Reply::Hang(vec![token("one")]),
            Reply::Events(vec![token("two"), done()]),
        ]);
        let conv = Conversation::new(transport.clone());
        let mut rx = conv.subscribe();

        let observe = async {
            wait_for(&mut rx, |s| s.messages.last().is_some_and(|m| m.content == "one")).await;
            let seen = conv.snapshot();
            conv.clear_messages();
            seen
        };
        let ((), (), seen) = tokio::join!(
            conv.send_message("first", ChatOptions::default()),
            conv.send_message("second", ChatOptions::default()),
            observe,
        );

        let users: Vec<_> = seen
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .collect();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].content, "first");
        assert_eq!(seen.messages.len(), 2);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_send_while_streaming_is_dropped() {
        let transport = ScriptedTransport::new(vec![Reply::Hang(vec![token("par")])]);
        let conv = Conversation::new(transport.clone());
        let mut rx = conv.subscribe();

        let background = conv.clone();
        let turn = tokio::spawn(async move {
            background
                .send_message("slow question", ChatOptions::default())
                .await;
        });
        wait_for(&mut rx, |s| s.messages.last().is_some_and(|m| m.content == "par")).await;

        let state = conv.snapshot();
        assert!(state.is_loading);
        assert!(assistant(&state).is_streaming);

        conv.send_message("impatient", ChatOptions::default()).await;
        assert_eq!(conv.snapshot().messages.len(), 2);
        assert_eq!(transport.requests().len(), 1);

        conv.clear_messages();
        turn.await.unwrap();
    }

    #[tokio::test]
    async fn test_history_excludes_new_pair() {
        let transport = ScriptedTransport::new(vec![
            Reply::Events(vec![token("first answer"), done()]),
            Reply::Events(vec![token("second answer"), done()]),
        ]);
        let conv = Conversation::new(transport.clone());

        conv.send_message("q1", ChatOptions::default()).await;
        conv.send_message("q2", ChatOptions::default()).await;

        let requests = transport.requests();
        assert!(requests[0].history.is_empty());
        let history = &requests[1].history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "q1");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "first answer");
        assert_eq!(conv.snapshot().messages.len(), 4);
    }

    #[tokio::test]
    async fn test_error_event_with_unknown_code() {
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![SseEvent::Error(
            ErrorPayload {
                message: "Server error".into(),
                code: Some("500".into()),
            },
        )])]);
        let conv = Conversation::new(transport);

        conv.send_message("hi", ChatOptions::default()).await;

        let state = conv.snapshot();
        assert_eq!(state.error.as_deref(), Some("Server error"));
        let answer = assistant(&state);
        assert_eq!(answer.content, "Server error");
        assert!(!answer.is_streaming);
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_error_event_with_known_code_replaces_partial_answer() {
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![
            token("partial"),
            SseEvent::Error(ErrorPayload {
                message: "raw".into(),
                code: Some("RATE_LIMIT_EXCEEDED".into()),
            }),
        ])]);
        let conv = Conversation::new(transport);

        conv.send_message("hi", ChatOptions::default()).await;

        let expected = error_codes::message_for_code("RATE_LIMIT_EXCEEDED").unwrap();
        let state = conv.snapshot();
        assert_eq!(state.error.as_deref(), Some(expected));
        assert_eq!(assistant(&state).content, expected);
    }

    #[tokio::test]
    async fn test_rejected_request() {
        let transport = ScriptedTransport::new(vec![Reply::Reject(
            ClientError::ChatRequestFailed { status: 502 },
        )]);
        let conv = Conversation::new(transport);

        conv.send_message("hi", ChatOptions::default()).await;

        let state = conv.snapshot();
        assert_eq!(state.messages.len(), 2);
        let text = ClientError::ChatRequestFailed { status: 502 }.user_message();
        assert_eq!(state.error.as_deref(), Some(text.as_str()));
        assert_eq!(assistant(&state).content, text);
        assert!(!assistant(&state).is_streaming);
    }

    #[tokio::test]
    async fn test_network_failure_before_any_event() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = BackendClient::new(&format!("http://127.0.0.1:{port}"));
        let conv = Conversation::new(Arc::new(client));

        conv.send_message("anyone there?", ChatOptions::default()).await;

        let state = conv.snapshot();
        assert_eq!(state.messages.len(), 2);
        assert!(!state.is_loading);
        assert_eq!(
            state.error.as_deref(),
            Some(ragchat_client::NETWORK_ERROR_MESSAGE)
        );
        let placeholder = assistant(&state);
        assert!(!placeholder.is_streaming);
        assert_eq!(placeholder.content, ragchat_client::NETWORK_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_failure_mid_stream_overwrites_streaming_answer() {
        let transport = ScriptedTransport::new(vec![Reply::Break(vec![token("half an ans")])]);
        let conv = Conversation::new(transport);

        conv.send_message("hi", ChatOptions::default()).await;

        let state = conv.snapshot();
        let text = json_error().user_message();
        assert_eq!(state.error.as_deref(), Some(text.as_str()));
        assert_eq!(assistant(&state).content, text);
        assert!(!assistant(&state).is_streaming);
    }

    #[tokio::test]
    async fn test_failure_after_done_keeps_answer() {
        let transport =
            ScriptedTransport::new(vec![Reply::Break(vec![token("complete"), done()])]);
        let conv = Conversation::new(transport);

        conv.send_message("hi", ChatOptions::default()).await;

        let state = conv.snapshot();
        assert!(state.error.is_some());
        assert_eq!(assistant(&state).content, "complete");
    }

    #[tokio::test]
    async fn test_stream_ending_without_done_finalizes() {
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![token("cut")])]);
        let conv = Conversation::new(transport);

        conv.send_message("hi", ChatOptions::default()).await;

        let state = conv.snapshot();
        assert_eq!(assistant(&state).content, "cut");
        assert!(!assistant(&state).is_streaming);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_chunks_and_unknown_events() {
        let chunks: ragchat_client::ChunksPayload = serde_json::from_value(serde_json::json!({
            "chunks": [{"filename": "a.txt", "start_line": 1, "end_line": 3, "content": "abc"}],
            "documentSet": "original",
            "strategy": "standard"
        }))
        .unwrap();
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![
            SseEvent::Unknown {
                event: "heartbeat".into(),
                data: serde_json::json!({}),
            },
            SseEvent::Chunks(chunks),
            token("ok"),
            done(),
        ])]);
        let conv = Conversation::new(transport);

        conv.send_message("hi", ChatOptions::default()).await;

        let state = conv.snapshot();
        let answer = assistant(&state);
        let retrieval = answer.retrieval.as_ref().unwrap();
        assert_eq!(retrieval.chunks.len(), 1);
        assert_eq!(retrieval.document_set, "original");
        assert_eq!(answer.content, "ok");
        assert!(answer.sources.is_none());
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_later_sources_replace_earlier() {
        let mut second = sample_sources();
        if let SseEvent::Sources { sources } = &mut second {
            sources[0].filename = "other.txt".into();
        }
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![
            sample_sources(),
            second,
            done(),
        ])]);
        let conv = Conversation::new(transport);

        conv.send_message("hi", ChatOptions::default()).await;

        let state = conv.snapshot();
        let sources = assistant(&state).sources.as_ref().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].filename, "other.txt");
    }

    #[tokio::test]
    async fn test_clear_messages_cancels_in_flight_turn() {
        let transport = ScriptedTransport::new(vec![
            Reply::Hang(vec![token("never finished")]),
            Reply::Events(vec![token("fresh"), done()]),
        ]);
        let conv = Conversation::new(transport.clone());
        let mut rx = conv.subscribe();

        let background = conv.clone();
        let turn = tokio::spawn(async move {
            background.send_message("q", ChatOptions::default()).await;
        });
        wait_for(&mut rx, |s| {
            s.messages.last().is_some_and(|m| !m.content.is_empty())
        })
        .await;

        conv.clear_messages();
        tokio::time::timeout(Duration::from_secs(5), turn)
            .await
            .expect("cancelled turn should unwind")
            .unwrap();

        let state = conv.snapshot();
        assert!(state.messages.is_empty());
        assert!(state.error.is_none());
        assert!(!state.is_loading);

        conv.send_message("again", ChatOptions::default()).await;
        let state = conv.snapshot();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(assistant(&state).content, "fresh");
        assert!(transport.requests()[1].history.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_send_future_ends_turn() {
        let transport = ScriptedTransport::new(vec![Reply::Hang(Vec::new())]);
        let conv = Conversation::new(transport);

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            conv.send_message("q", ChatOptions::default()),
        )
        .await;
        assert!(result.is_err());

        let state = conv.snapshot();
        assert!(!state.is_loading);
        assert!(!assistant(&state).is_streaming);
        assert!(!conv.is_loading());
    }

    #[tokio::test]
    async fn test_clear_error_keeps_messages() {
        let transport = ScriptedTransport::new(vec![Reply::Reject(json_error())]);
        let conv = Conversation::new(transport);
        conv.send_message("hi", ChatOptions::default()).await;
        assert!(conv.snapshot().error.is_some());

        conv.clear_error();

        let state = conv.snapshot();
        assert!(state.error.is_none());
        assert_eq!(state.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_messages_when_idle() {
        let transport = ScriptedTransport::new(vec![Reply::Reject(json_error())]);
        let conv = Conversation::new(transport);
        conv.send_message("hi", ChatOptions::default()).await;

        conv.clear_messages();

        let state = conv.snapshot();
        assert!(state.messages.is_empty());
        assert!(state.error.is_none());
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_subscriber_sees_final_state() {
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![token("a"), token("b"), done()])]);
        let conv = Conversation::new(transport);
        let mut rx = conv.subscribe();

        conv.send_message("hi", ChatOptions::default()).await;

        assert!(rx.has_changed().unwrap());
        let state = rx.borrow_and_update().clone();
        assert_eq!(assistant(&state).content, "ab");
        assert!(!state.is_loading);
    }
}
