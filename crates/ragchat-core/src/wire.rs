//! Backend wire shapes and the mapping to the internal model.
//!
//! The backend speaks underscore-separated field names (`start_line`); the
//! internal model in [`crate::types`] uses compact camel names. This module is
//! the only place the two meet. Every mapping is total and order-preserving.

use serde::{Deserialize, Serialize};

use crate::types::{
    ChunkInfo, DocumentContent, DocumentInfo, DocumentKind, DocumentList, DocumentStatus, Health,
    RebuildResult, Source, UploadResult,
};

/// A cited passage as the backend sends it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSource {
    pub filename: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content_preview: String,
}

impl From<WireSource> for Source {
    fn from(w: WireSource) -> Self {
        Self {
            filename: w.filename,
            start_line: w.start_line,
            end_line: w.end_line,
            content_preview: w.content_preview,
        }
    }
}

impl From<Source> for WireSource {
    fn from(s: Source) -> Self {
        Self {
            filename: s.filename,
            start_line: s.start_line,
            end_line: s.end_line,
            content_preview: s.content_preview,
        }
    }
}

/// Map wire-cased sources to the internal form.
pub fn to_internal(sources: &[WireSource]) -> Vec<Source> {
    sources.iter().cloned().map(Source::from).collect()
}

/// Map internal sources back to the wire form.
pub fn to_wire(sources: &[Source]) -> Vec<WireSource> {
    sources.iter().cloned().map(WireSource::from).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChunkInfo {
    pub filename: String,
    #[serde(default)]
    pub start_line: u32,
    #[serde(default)]
    pub end_line: u32,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl From<WireChunkInfo> for ChunkInfo {
    fn from(w: WireChunkInfo) -> Self {
        Self {
            filename: w.filename,
            start_line: w.start_line,
            end_line: w.end_line,
            content: w.content,
            score: w.score,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDocumentInfo {
    pub id: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    pub status: DocumentStatus,
    #[serde(default)]
    pub line_count: u32,
}

impl From<WireDocumentInfo> for DocumentInfo {
    fn from(w: WireDocumentInfo) -> Self {
        Self {
            id: w.id,
            filename: w.filename,
            kind: w.kind,
            status: w.status,
            line_count: w.line_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDocumentList {
    pub documents: Vec<WireDocumentInfo>,
    pub total: usize,
}

impl From<WireDocumentList> for DocumentList {
    fn from(w: WireDocumentList) -> Self {
        Self {
            documents: w.documents.into_iter().map(DocumentInfo::from).collect(),
            total: w.total,
        }
    }
}

/// Upload responses carry no underscore fields; the wire and internal shapes coincide.
pub type WireUploadResult = UploadResult;

#[derive(Debug, Clone, Deserialize)]
pub struct WireDocumentContent {
    pub id: String,
    pub filename: String,
    pub content: String,
    pub line_count: u32,
}

impl From<WireDocumentContent> for DocumentContent {
    fn from(w: WireDocumentContent) -> Self {
        Self {
            id: w.id,
            filename: w.filename,
            content: w.content,
            line_count: w.line_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireRebuildResult {
    pub status: String,
    pub chunk_count: u32,
    pub message: String,
}

impl From<WireRebuildResult> for RebuildResult {
    fn from(w: WireRebuildResult) -> Self {
        Self {
            status: w.status,
            chunk_count: w.chunk_count,
            message: w.message,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireHealth {
    pub status: String,
    pub model_loaded: bool,
    pub vectorstore_ready: bool,
    pub document_count: u32,
}

impl From<WireHealth> for Health {
    fn from(w: WireHealth) -> Self {
        Self {
            status: w.status,
            model_loaded: w.model_loaded,
            vectorstore_ready: w.vectorstore_ready,
            document_count: w.document_count,
        }
    }
}

/// Error body of a non-success REST response.
#[derive(Debug, Clone, Deserialize)]
pub struct WireErrorDetail {
    pub detail: String,
}
