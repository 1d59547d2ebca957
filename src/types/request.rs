use serde::Serialize;

use crate::types::Message;

/// One chat-completion request.
///
/// The deployment id selects the URL path and is not part of the JSON body;
/// only `messages` and `stream` go on the wire.  The messages are borrowed
/// for the duration of a single call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestSpec<'a> {
    /// The deployment that should serve this request.
    #[serde(skip)]
    pub deployment_id: &'a str,

    /// The conversation so far, oldest first.
    pub messages: &'a [Message],

    /// Whether the reply should be streamed as server-sent events.
    pub stream: bool,
}

impl<'a> RequestSpec<'a> {
    /// Create a non-streaming request.
    pub fn new(deployment_id: &'a str, messages: &'a [Message]) -> Self {
        Self {
            deployment_id,
            messages,
            stream: false,
        }
    }

    /// Create a streaming request.
    pub fn streaming(deployment_id: &'a str, messages: &'a [Message]) -> Self {
        Self {
            deployment_id,
            messages,
            stream: true,
        }
    }
}
