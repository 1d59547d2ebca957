// Public modules
pub mod completion;
pub mod message;
pub mod request;

// Re-exports
pub use completion::{
    ChatCompletion, ChatCompletionChunk, ChunkChoice, ChunkDelta, CompletionChoice,
    CompletionMessage,
};
pub use message::{Message, Role};
pub use request::RequestSpec;
