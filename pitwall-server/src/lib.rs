//! Pitwall Server Library
//!
//! Exposes server components for integration testing.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod messages;
pub mod registry;
pub mod state;
pub mod summarizer;
