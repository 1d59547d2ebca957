//! The conversation ledger.
//!
//! A [`Conversation`] owns the ordered turn history of one chat session.  It
//! only ever grows at the end, and the only other mutation is
//! [`Conversation::remove_last`], which the chat session uses to undo the
//! user message of a turn that failed.

use crate::error::{Error, Result};
use crate::types::Message;

/// Ordered, append-only history of messages, with rollback of the last append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to the end of the conversation.
    pub fn add(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Removes and returns the most recently added message.
    ///
    /// # Errors
    ///
    /// Returns a precondition error, leaving the conversation untouched, if
    /// there is nothing to remove.
    pub fn remove_last(&mut self) -> Result<Message> {
        self.messages
            .pop()
            .ok_or_else(|| Error::precondition("remove_last called on an empty conversation"))
    }

    /// The messages in conversational order.
    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    /// Iterates over the messages in conversational order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Returns the number of messages in the conversation.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the conversation holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
