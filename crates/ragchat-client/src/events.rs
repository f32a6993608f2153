//! Typed chat events and the frame interpreter.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::trace;

use ragchat_core::types::{ChunkInfo, ChunksInfo};
use ragchat_core::wire::{WireChunkInfo, WireSource};

use crate::sse::RawFrame;

/// An application event decoded from one SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// One incremental piece of the answer.
    Token { token: String },
    /// Full source list for the current answer, wire-cased.
    Sources { sources: Vec<WireSource> },
    /// Retrieval introspection.
    Chunks(ChunksPayload),
    /// Successful completion.
    Done(DonePayload),
    /// Server-reported failure for this request.
    Error(ErrorPayload),
    /// A tag this client does not know. Kept, never acted upon.
    Unknown { event: String, data: Value },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChunksPayload {
    pub chunks: Vec<WireChunkInfo>,
    #[serde(rename = "documentSet", alias = "document_set", default)]
    pub document_set: String,
    #[serde(default)]
    pub strategy: String,
}

impl From<ChunksPayload> for ChunksInfo {
    fn from(p: ChunksPayload) -> Self {
        Self {
            chunks: p.chunks.into_iter().map(ChunkInfo::from).collect(),
            document_set: p.document_set,
            strategy: p.strategy,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DonePayload {
    /// Informational only: a value of the wrong type is treated as absent.
    #[serde(alias = "processingTimeMs", default, deserialize_with = "lenient_millis")]
    pub processing_time_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Whole milliseconds from any non-negative JSON number; `None` for anything else.
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| ms.round() as u64)
    }))
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

impl ErrorPayload {
    /// Accepts both `{message, code}` and the rate limiter's
    /// `{type: "error", data: {message, code}}` envelope.
    fn from_value(value: Value) -> serde_json::Result<Self> {
        if value.get("message").is_none() {
            if let Some(inner) = value.get("data").filter(|d| d.is_object()) {
                return serde_json::from_value(inner.clone());
            }
        }
        serde_json::from_value(value)
    }
}

#[derive(Deserialize)]
struct TokenPayload {
    token: String,
}

#[derive(Deserialize)]
struct SourcesPayload {
    sources: Vec<WireSource>,
}

/// Turn a raw frame into a typed event.
///
/// Returns `None` when the data is not JSON or does not fit the tag's shape;
/// one bad frame never ends the stream.
pub fn interpret(frame: &RawFrame) -> Option<SseEvent> {
    let data: Value = match serde_json::from_str(&frame.raw_data) {
        Ok(v) => v,
        Err(e) => {
            trace!(%e, event = %frame.event_name, data = %frame.raw_data, "Dropping frame with invalid JSON");
            return None;
        }
    };

    let parsed = match frame.event_name.as_str() {
        "token" => serde_json::from_value::<TokenPayload>(data)
            .map(|p| SseEvent::Token { token: p.token }),
        "sources" => serde_json::from_value::<SourcesPayload>(data)
            .map(|p| SseEvent::Sources { sources: p.sources }),
        "chunks" => serde_json::from_value::<ChunksPayload>(data).map(SseEvent::Chunks),
        "done" => serde_json::from_value::<DonePayload>(data).map(SseEvent::Done),
        "error" => ErrorPayload::from_value(data).map(SseEvent::Error),
        other => {
            return Some(SseEvent::Unknown {
                event: other.to_string(),
                data,
            });
        }
    };

    match parsed {
        Ok(event) => Some(event),
        Err(e) => {
            trace!(%e, event = %frame.event_name, "Dropping frame with unexpected shape");
            None
        }
    }
}
