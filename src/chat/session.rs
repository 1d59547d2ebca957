//! Core chat session management.
//!
//! This module provides the `ChatSession` struct which owns the conversation
//! and runs each turn against a [`CompletionClient`].  A turn is
//! transactional: the user message is appended before the request and
//! removed again if the request fails, so a failed exchange leaves the
//! history exactly as it was.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;

use crate::Error;
use crate::chat::commands::{ChatInput, parse_input};
use crate::chat::config::{ChatConfig, ResponseMode};
use crate::chat::render::Renderer;
use crate::client::CompletionClient;
use crate::conversation::Conversation;
use crate::error::Result;
use crate::observability::{SESSION_ROLLBACKS, SESSION_TURNS};
use crate::types::Message;

/// Where a chat session is in its input/completion cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the user to type something.
    AwaitingInput,

    /// A request is in flight.
    AwaitingCompletion,

    /// The user left; no further input is processed.
    Closed,
}

/// A chat session that manages conversation state and API interactions.
pub struct ChatSession<C: CompletionClient> {
    client: C,
    conversation: Conversation,
    mode: ResponseMode,
    state: SessionState,
}

impl<C: CompletionClient> ChatSession<C> {
    /// Creates a new chat session whose conversation starts with `system_prompt`.
    pub fn new(client: C, mode: ResponseMode, system_prompt: impl Into<String>) -> Self {
        let mut conversation = Conversation::new();
        conversation.add(Message::system(system_prompt));
        Self {
            client,
            conversation,
            mode,
            state: SessionState::AwaitingInput,
        }
    }

    /// Creates a new chat session using the mode and system prompt of `config`.
    pub fn from_config(client: C, config: &ChatConfig) -> Self {
        Self::new(client, config.mode, config.system_prompt.clone())
    }

    /// Processes one line of console input.
    ///
    /// The exit sentinel closes the session, blank lines are ignored, and
    /// anything else is sent as a user message.  Failures of the turn are
    /// reported through `renderer` and do not end the session.
    pub async fn handle_line(
        &mut self,
        line: &str,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> SessionState {
        if self.state == SessionState::Closed {
            return self.state;
        }
        match parse_input(line) {
            ChatInput::Exit => self.state = SessionState::Closed,
            ChatInput::Blank => {}
            ChatInput::Message(text) => {
                if let Err(err) = self.send(text, renderer, interrupted).await {
                    renderer.print_error(&err.to_string());
                }
            }
        }
        self.state
    }

    /// Sends a user message and renders the reply.
    ///
    /// This method:
    /// 1. Adds the user message to history
    /// 2. Requests a completion for the whole history
    /// 3. Renders the reply, fragment by fragment when streaming
    /// 4. Adds the complete assistant reply to history
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the user interrupts the
    /// reply; the user message is removed from history first.
    pub async fn send(
        &mut self,
        user_input: &str,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> Result<Message> {
        if self.state == SessionState::Closed {
            return Err(Error::precondition("session is closed"));
        }

        self.conversation.add(Message::user(user_input));
        self.state = SessionState::AwaitingCompletion;
        SESSION_TURNS.click();

        let outcome = self.request(renderer, interrupted).await;
        self.state = SessionState::AwaitingInput;

        match outcome {
            Ok(reply) => {
                self.conversation.add(reply.clone());
                Ok(reply)
            }
            Err(err) => {
                SESSION_ROLLBACKS.click();
                self.conversation.remove_last()?;
                Err(err)
            }
        }
    }

    async fn request(
        &self,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> Result<Message> {
        let messages = self.conversation.snapshot();
        match self.mode {
            ResponseMode::Complete => {
                let pending = self.client.complete(messages);
                let Some(reply) = unless_interrupted(interrupted, pending).await else {
                    return Err(interrupt(renderer));
                };
                let reply = reply?;
                renderer.print_text(reply.content());
                renderer.finish_response();
                Ok(reply)
            }
            ResponseMode::Streaming => {
                let pending = self.client.complete_streaming(messages);
                let Some(stream) = unless_interrupted(interrupted, pending).await else {
                    return Err(interrupt(renderer));
                };
                let mut stream = stream?;
                let mut content = String::new();
                loop {
                    let Some(next) = unless_interrupted(interrupted, stream.next()).await else {
                        drop(stream);
                        return Err(interrupt(renderer));
                    };
                    let Some(fragment) = next else {
                        break;
                    };
                    let fragment = fragment?;
                    renderer.print_text(&fragment);
                    content.push_str(&fragment);
                }
                renderer.finish_response();
                Ok(Message::assistant(content))
            }
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the conversation so far.
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Returns the number of messages in the conversation.
    pub fn message_count(&self) -> usize {
        self.conversation.len()
    }

    /// Returns how replies are requested.
    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    /// Changes how replies are requested.
    pub fn set_mode(&mut self, mode: ResponseMode) {
        self.mode = mode;
    }

    /// Returns the completion client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Closes the session, e.g. when the input stream ends.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

/// How often a pending request looks at the interrupt flag.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

async fn wait_for_interrupt(interrupted: &AtomicBool) {
    while !interrupted.load(Ordering::Relaxed) {
        tokio::time::sleep(INTERRUPT_POLL_INTERVAL).await;
    }
}

/// Runs `future` to completion unless the interrupt flag is raised first.
///
/// Returns `None` on interrupt, after dropping `future`.
async fn unless_interrupted<F: Future>(interrupted: &AtomicBool, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = wait_for_interrupt(interrupted) => None,
        output = future => Some(output),
    }
}

fn interrupt(renderer: &mut dyn Renderer) -> Error {
    renderer.print_interrupted();
    Error::abort("reply interrupted by user")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use futures::stream;

    use crate::client::FragmentStream;
    use crate::types::Role;

    enum Reply {
        Whole(Result<Message>),
        Streamed(Result<Vec<Result<String>>>),
        /// Yields the fragments, then stalls without ending.
        Stalled(Vec<String>),
        /// Never answers.
        Hang,
    }

    /// Replays canned replies and records the history each request saw.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<Reply>>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn with(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, messages: &[Message]) -> Reply {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected request")
        }

        fn requests(&self) -> Vec<Vec<Message>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CompletionClient for ScriptedClient {
        fn deployment(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, messages: &[Message]) -> Result<Message> {
            match self.next(messages) {
                Reply::Whole(reply) => reply,
                Reply::Hang => futures::future::pending().await,
                _ => panic!("expected a streaming request"),
            }
        }

        async fn complete_streaming(&self, messages: &[Message]) -> Result<FragmentStream> {
            match self.next(messages) {
                Reply::Streamed(fragments) => {
                    let fragments = fragments?;
                    Ok(Box::pin(stream::iter(fragments)))
                }
                Reply::Stalled(fragments) => Ok(Box::pin(
                    stream::iter(fragments.into_iter().map(Ok)).chain(stream::pending()),
                )),
                Reply::Hang => futures::future::pending().await,
                Reply::Whole(_) => panic!("expected a non-streaming request"),
            }
        }
    }

    #[derive(Default)]
    struct CapturingRenderer {
        text: String,
        errors: Vec<String>,
        finished: usize,
        interrupted: bool,
    }

    impl Renderer for CapturingRenderer {
        fn print_text(&mut self, text: &str) {
            self.text.push_str(text);
        }

        fn print_error(&mut self, error: &str) {
            self.errors.push(error.to_string());
        }

        fn print_info(&mut self, _info: &str) {}

        fn finish_response(&mut self) {
            self.finished += 1;
        }

        fn print_interrupted(&mut self) {
            self.interrupted = true;
        }
    }

    fn fragments(parts: &[&str]) -> Reply {
        Reply::Streamed(Ok(parts.iter().map(|p| Ok(p.to_string())).collect()))
    }

    fn session(mode: ResponseMode, replies: Vec<Reply>) -> ChatSession<ScriptedClient> {
        ChatSession::new(ScriptedClient::with(replies), mode, "Be terse.")
    }

    #[test]
    fn new_session_starts_with_system_prompt() {
        let session = session(ResponseMode::Streaming, Vec::new());
        assert_eq!(session.message_count(), 1);
        assert_eq!(session.conversation().snapshot()[0], Message::system("Be terse."));
        assert_eq!(session.state(), SessionState::AwaitingInput);
    }

    #[test]
    fn session_from_config() {
        let config = ChatConfig::new()
            .with_mode(ResponseMode::Complete)
            .with_system_prompt("Answer in French.");
        let mut session = ChatSession::from_config(ScriptedClient::default(), &config);
        assert_eq!(session.mode(), ResponseMode::Complete);
        assert_eq!(session.client().deployment(), "scripted");
        assert_eq!(
            session.conversation().snapshot(),
            &[Message::system("Answer in French.")]
        );

        session.set_mode(ResponseMode::Streaming);
        assert_eq!(session.mode(), ResponseMode::Streaming);
    }

    #[tokio::test]
    async fn successful_turn_appends_user_and_assistant() {
        let mut session = session(
            ResponseMode::Complete,
            vec![Reply::Whole(Ok(Message::assistant("Hello.")))],
        );
        let mut renderer = CapturingRenderer::default();
        let interrupted = AtomicBool::new(false);

        let reply = session.send("Hi", &mut renderer, &interrupted).await.unwrap();
        assert_eq!(reply, Message::assistant("Hello."));
        assert_eq!(session.message_count(), 3);
        assert_eq!(
            session.conversation().snapshot(),
            &[
                Message::system("Be terse."),
                Message::user("Hi"),
                Message::assistant("Hello."),
            ]
        );
        assert_eq!(renderer.text, "Hello.");
        assert_eq!(renderer.finished, 1);

        // The request saw the history including the new user message.
        let requests = session.client().requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0],
            vec![Message::system("Be terse."), Message::user("Hi")]
        );
    }

    #[tokio::test]
    async fn failed_turn_rolls_back() {
        let mut session = session(
            ResponseMode::Complete,
            vec![Reply::Whole(Err(Error::connection("refused", None)))],
        );
        let mut renderer = CapturingRenderer::default();
        let interrupted = AtomicBool::new(false);
        let before = session.conversation().clone();

        let err = session
            .send("Hi", &mut renderer, &interrupted)
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(session.conversation(), &before);
        assert_eq!(session.state(), SessionState::AwaitingInput);
        assert!(renderer.text.is_empty());
    }

    #[tokio::test]
    async fn empty_response_appends_nothing() {
        let mut session = session(
            ResponseMode::Complete,
            vec![Reply::Whole(Err(Error::empty_response("no choices")))],
        );
        let mut renderer = CapturingRenderer::default();
        let interrupted = AtomicBool::new(false);

        let state = session.handle_line("Hi", &mut renderer, &interrupted).await;
        assert_eq!(state, SessionState::AwaitingInput);
        assert_eq!(session.message_count(), 1);
        assert!(
            session
                .conversation()
                .iter()
                .all(|message| message.role() != Role::Assistant)
        );
        assert_eq!(renderer.errors.len(), 1);
        assert!(renderer.errors[0].contains("no choices"));
    }

    #[tokio::test]
    async fn streaming_turn_concatenates_fragments() {
        let mut session = session(
            ResponseMode::Streaming,
            vec![fragments(&["Hel", "lo", " world"])],
        );
        let mut renderer = CapturingRenderer::default();
        let interrupted = AtomicBool::new(false);

        let reply = session
            .send("Greet me", &mut renderer, &interrupted)
            .await
            .unwrap();
        assert_eq!(reply, Message::assistant("Hello world"));
        assert_eq!(renderer.text, "Hello world");
        assert_eq!(renderer.finished, 1);
        assert_eq!(session.message_count(), 3);
    }

    #[tokio::test]
    async fn streaming_with_no_fragments_appends_empty_reply() {
        let mut session = session(ResponseMode::Streaming, vec![fragments(&[])]);
        let mut renderer = CapturingRenderer::default();
        let interrupted = AtomicBool::new(false);

        let reply = session.send("Hi", &mut renderer, &interrupted).await.unwrap();
        assert_eq!(reply, Message::assistant(""));
        assert_eq!(session.message_count(), 3);
    }

    #[tokio::test]
    async fn streaming_failure_rolls_back() {
        let mut session = session(
            ResponseMode::Streaming,
            vec![
                Reply::Streamed(Err(Error::service_unavailable("overloaded", None))),
                Reply::Streamed(Ok(vec![
                    Ok("partial".to_string()),
                    Err(Error::streaming("connection reset", None)),
                ])),
            ],
        );
        let mut renderer = CapturingRenderer::default();
        let interrupted = AtomicBool::new(false);

        let err = session
            .send("one", &mut renderer, &interrupted)
            .await
            .unwrap_err();
        assert!(err.is_server_error());
        assert_eq!(session.message_count(), 1);

        let err = session
            .send("two", &mut renderer, &interrupted)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Streaming { .. }));
        assert_eq!(session.message_count(), 1);
        assert_eq!(renderer.text, "partial");
    }

    #[tokio::test]
    async fn interrupted_stream_rolls_back() {
        let mut session = session(ResponseMode::Streaming, vec![fragments(&["a", "b"])]);
        let mut renderer = CapturingRenderer::default();
        let interrupted = AtomicBool::new(true);

        let err = session
            .send("Hi", &mut renderer, &interrupted)
            .await
            .unwrap_err();
        assert!(err.is_abort());
        assert!(renderer.interrupted);
        assert!(renderer.text.is_empty());
        assert_eq!(session.message_count(), 1);
        assert_eq!(session.state(), SessionState::AwaitingInput);
    }

    fn raise_after(interrupted: &Arc<AtomicBool>, delay: Duration) {
        let interrupted = Arc::clone(interrupted);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            interrupted.store(true, Ordering::Relaxed);
        });
    }

    #[tokio::test]
    async fn interrupt_reaches_a_stalled_stream() {
        let mut session = session(
            ResponseMode::Streaming,
            vec![Reply::Stalled(vec!["Hel".to_string()])],
        );
        let mut renderer = CapturingRenderer::default();
        let interrupted = Arc::new(AtomicBool::new(false));
        raise_after(&interrupted, Duration::from_millis(100));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            session.send("Hi", &mut renderer, &interrupted),
        )
        .await
        .expect("interrupt was not noticed")
        .unwrap_err();
        assert!(err.is_abort());
        assert!(renderer.interrupted);
        assert_eq!(renderer.text, "Hel");
        assert_eq!(session.message_count(), 1);
    }

    #[tokio::test]
    async fn interrupt_reaches_a_pending_whole_reply() {
        let mut session = session(ResponseMode::Complete, vec![Reply::Hang]);
        let mut renderer = CapturingRenderer::default();
        let interrupted = Arc::new(AtomicBool::new(false));
        raise_after(&interrupted, Duration::from_millis(100));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            session.send("Hi", &mut renderer, &interrupted),
        )
        .await
        .expect("interrupt was not noticed")
        .unwrap_err();
        assert!(err.is_abort());
        assert!(renderer.interrupted);
        assert_eq!(renderer.finished, 0);
        assert_eq!(session.message_count(), 1);
        assert_eq!(session.state(), SessionState::AwaitingInput);
    }

    #[tokio::test]
    async fn ledger_length_over_mixed_turns() {
        let mut session = session(
            ResponseMode::Streaming,
            vec![
                fragments(&["first"]),
                Reply::Streamed(Err(Error::timeout("slow", Some(60.0)))),
                fragments(&["third"]),
            ],
        );
        let mut renderer = CapturingRenderer::default();
        let interrupted = AtomicBool::new(false);

        session.handle_line("1", &mut renderer, &interrupted).await;
        assert_eq!(session.message_count(), 3);
        session.handle_line("2", &mut renderer, &interrupted).await;
        assert_eq!(session.message_count(), 3);
        session.handle_line("3", &mut renderer, &interrupted).await;
        assert_eq!(session.message_count(), 5);

        let contents: Vec<&str> = session
            .conversation()
            .iter()
            .map(Message::content)
            .collect();
        assert_eq!(contents, vec!["Be terse.", "1", "first", "3", "third"]);

        // The third request did not see the failed second turn.
        let requests = session.client().requests();
        assert_eq!(requests[2].len(), 4);
        assert_eq!(requests[2][3], Message::user("3"));
    }

    #[tokio::test]
    async fn exit_closes_session() {
        let mut session = session(ResponseMode::Streaming, Vec::new());
        let mut renderer = CapturingRenderer::default();
        let interrupted = AtomicBool::new(false);

        assert_eq!(
            session.handle_line("   ", &mut renderer, &interrupted).await,
            SessionState::AwaitingInput
        );
        assert_eq!(
            session.handle_line(" EXIT ", &mut renderer, &interrupted).await,
            SessionState::Closed
        );
        assert_eq!(
            session.handle_line("Hi", &mut renderer, &interrupted).await,
            SessionState::Closed
        );
        assert!(session.client().requests().is_empty());
        assert_eq!(session.message_count(), 1);

        let err = session
            .send("Hi", &mut renderer, &interrupted)
            .await
            .unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn close_is_terminal() {
        let mut session = session(ResponseMode::Complete, Vec::new());
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
