//! Classification of console input for the chat application.
//!
//! Every line the user types is either the exit sentinel, a blank line, or
//! a message to send to the model.

/// The reserved word that ends a chat session, matched case-insensitively.
pub const EXIT_COMMAND: &str = "exit";

/// A classified line of user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatInput<'a> {
    /// The user asked to leave.
    Exit,

    /// Nothing but whitespace; ignored.
    Blank,

    /// Text to send to the model, with surrounding whitespace trimmed.
    Message(&'a str),
}

/// Classifies a line of user input.
///
/// # Examples
///
/// ```
/// # use dial_chat::chat::{ChatInput, parse_input};
/// assert_eq!(parse_input("  Exit "), ChatInput::Exit);
/// assert_eq!(parse_input("   "), ChatInput::Blank);
/// assert_eq!(parse_input(" Hello! "), ChatInput::Message("Hello!"));
/// ```
pub fn parse_input(input: &str) -> ChatInput<'_> {
    let input = input.trim();
    if input.is_empty() {
        ChatInput::Blank
    } else if input.eq_ignore_ascii_case(EXIT_COMMAND) {
        ChatInput::Exit
    } else {
        ChatInput::Message(input)
    }
}
