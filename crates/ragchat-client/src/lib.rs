//! HTTP client for the RAG chat backend.
//!
//! [`BackendClient::stream_chat`] opens the streaming chat endpoint and yields
//! typed [`SseEvent`]s; the REST helpers in [`documents`] cover health and
//! document management. The [`ChatTransport`] trait is the seam the
//! conversation layer drives, so it can run against an in-memory transport.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use ragchat_core::config::Config;

pub mod documents;
pub mod events;
pub mod sse;
pub mod stream;

pub use events::{ChunksPayload, DonePayload, ErrorPayload, SseEvent};
pub use stream::{ChatRequest, EventStream};

/// Shown when the backend could not be reached at all.
pub const NETWORK_ERROR_MESSAGE: &str =
    "Could not reach the server. Check your connection and try again.";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Chat request failed with status {status}")]
    ChatRequestFailed { status: u16 },

    #[error("Response has no body")]
    NoResponseBody,

    #[error("{detail}")]
    Api { status: u16, detail: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Text suitable for showing to the user in place of an answer.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::ChatRequestFailed { status } => {
                format!("The chat request failed (HTTP {status}).")
            }
            ClientError::NoResponseBody => "The server returned an empty response.".into(),
            ClientError::Api { detail, .. } => detail.clone(),
            ClientError::Http(_) => NETWORK_ERROR_MESSAGE.into(),
            ClientError::Json(_) => "The server sent a response that could not be read.".into(),
        }
    }
}

/// Something that can open a chat event stream.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream, ClientError>;
}

/// Client for one backend instance.
#[derive(Debug, Clone)]
pub struct BackendClient {
    pub base_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Build from config: base URL (env override applied) and connect timeout.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.request_timeout_secs() {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            base_url: config.base_url(),
            http: builder.build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ChatTransport for BackendClient {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream, ClientError> {
        self.open_chat(request).await
    }
}
