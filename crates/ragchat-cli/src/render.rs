//! Terminal rendering of conversation state.

use std::fmt::Write as _;

use ragchat_core::types::{ConversationState, DocumentInfo, Message, Role, Source};

/// What to print to bring the terminal in line with the answer so far.
#[derive(Debug, PartialEq, Eq)]
pub enum Delta<'a> {
    /// The answer grew; print only the new tail.
    Append(&'a str),
    /// The answer was replaced (e.g. by an error text); reprint it whole.
    Replace(&'a str),
}

pub fn delta<'a>(shown: &str, content: &'a str) -> Delta<'a> {
    match content.strip_prefix(shown) {
        Some(tail) => Delta::Append(tail),
        None => Delta::Replace(content),
    }
}

/// The assistant message of the most recent turn.
pub fn current_answer(state: &ConversationState) -> Option<&Message> {
    state
        .messages
        .last()
        .filter(|m| m.role == Role::Assistant)
}

pub fn sources(sources: &[Source]) -> String {
    let mut out = String::new();
    for (i, s) in sources.iter().enumerate() {
        let _ = writeln!(
            out,
            "  [{}] {} (lines {}-{})",
            i + 1,
            s.filename,
            s.start_line,
            s.end_line
        );
    }
    out
}

/// Footer printed once a turn has finished.
pub fn footer(message: &Message) -> String {
    let mut out = String::new();
    if let Some(list) = message.sources.as_deref().filter(|s| !s.is_empty()) {
        out.push_str("Sources:\n");
        out.push_str(&sources(list));
    }
    if let Some(retrieval) = &message.retrieval {
        let _ = writeln!(
            out,
            "Retrieved {} chunks from the {} set ({} chunking)",
            retrieval.chunks.len(),
            retrieval.document_set,
            retrieval.strategy
        );
    }
    if let Some(ms) = message.processing_time_ms {
        let _ = writeln!(out, "({ms} ms)");
    }
    out
}

pub fn document_row(doc: &DocumentInfo) -> String {
    format!(
        "{:<12} {:<32} {:<9} {:<11} {:>6} lines",
        doc.id,
        doc.filename,
        format!("{:?}", doc.kind).to_lowercase(),
        format!("{:?}", doc.status).to_lowercase(),
        doc.line_count
    )
}

/// Document text with 1-based line numbers, matching source citations.
pub fn numbered(content: &str) -> String {
    let width = content.lines().count().max(1).to_string().len();
    let mut out = String::new();
    for (i, line) in content.lines().enumerate() {
        let _ = writeln!(out, "{:>width$} | {line}", i + 1);
    }
    out
}
