//! Response shapes of the chat-completion endpoint.
//!
//! Only the fields dial-chat reads are modeled; everything else in the
//! response is ignored by serde.

use serde::{Deserialize, Serialize};

/// A non-streaming chat-completion response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletion {
    /// Candidate completions; dial-chat uses the first.
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

/// One candidate of a non-streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionChoice {
    /// The generated message.
    pub message: CompletionMessage,
}

/// The message body of a completion choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionMessage {
    /// The reply text; some deployments send `null`.
    #[serde(default)]
    pub content: Option<String>,
}

/// One frame of a streaming chat-completion response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    /// Candidate deltas; dial-chat uses the first.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

/// One candidate of a streaming frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    /// The incremental change; absent on some control frames.
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
}

/// The incremental part of a streaming frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    /// A text fragment, when the frame carries one.
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletion {
    /// The text of the first choice, or `None` when there are no choices.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .map(|choice| choice.message.content.as_deref().unwrap_or(""))
    }
}

impl ChatCompletionChunk {
    /// Consume the frame, returning the text delta of the first choice.
    pub fn into_first_delta(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
    }
}
