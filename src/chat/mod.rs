//! Chat application module for interactive conversations with a DIAL deployment.
//!
//! This module provides the REPL chat controller built on top of the
//! dial-chat client library. It supports:
//!
//! - Streaming responses with real-time fragment display
//! - Whole-response mode
//! - Rollback of turns whose request failed or was interrupted
//!
//! # Architecture
//!
//! The module is organized into several components:
//!
//! - [`config`]: CLI argument parsing and layered configuration
//! - [`session`]: Core chat session management and API interaction
//! - [`commands`]: Classification of console input
//! - [`render`]: Output rendering

mod commands;
mod config;
mod render;
mod session;

pub use commands::{ChatInput, EXIT_COMMAND, parse_input};
pub use config::{
    CONFIG_FILE_ENV, ChatArgs, ChatConfig, ConfigFile, DEFAULT_SYSTEM_PROMPT, ResponseMode,
};
pub use render::{PlainTextRenderer, Renderer};
pub use session::{ChatSession, SessionState};
