//! Core types, wire mapping, config, and errors for ragchat.

pub mod config;
pub mod error;
pub mod types;
pub mod wire;
