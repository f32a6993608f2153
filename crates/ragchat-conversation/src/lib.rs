//! Conversation layer: owns the message list and folds streamed events into it.
//!
//! A [`Conversation`] drives one turn at a time through a
//! [`ragchat_client::ChatTransport`] and publishes every state change on a
//! `watch` channel, so a front-end can re-render from [`Conversation::subscribe`].

pub mod conversation;
pub mod error_codes;

pub use conversation::Conversation;
