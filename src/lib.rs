//! A chat client for DIAL chat-completion deployments.
//!
//! The library keeps a [`Conversation`] with a deployment, requesting replies
//! either whole or as a stream of text fragments decoded from server-sent
//! events by the [`sse`] module.

// Public modules
pub mod chat;
pub mod client;
pub mod client_logger;
pub mod conversation;
pub mod error;
pub mod observability;
pub mod sse;
pub mod types;

// Re-exports
pub use client::{CompletionClient, DialClient, FragmentStream};
pub use client_logger::{ClientLogger, StderrLogger};
pub use conversation::Conversation;
pub use error::{Error, Result};
pub use observability::register_biometrics;
pub use types::*;
