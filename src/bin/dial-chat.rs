//! Interactive chat application for conversing with a DIAL deployment.
//!
//! # Usage
//!
//! ```bash
//! # Stream replies (the default)
//! DIAL_API_KEY=... dial-chat
//!
//! # Wait for whole replies
//! DIAL_API_KEY=... dial-chat --no-stream
//! ```
//!
//! The endpoint, deployment and request logging are configured through
//! `DIAL_ENDPOINT`, `DIAL_DEPLOYMENT`, `DIAL_LOG_REQUESTS` and
//! `DIAL_TIMEOUT_SECS`, or a YAML file named by `DIAL_CHAT_CONFIG`.
//!
//! Type `exit` to quit.  Ctrl+C while waiting for a reply interrupts it.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use dial_chat::DialClient;
use dial_chat::chat::{
    ChatArgs, ChatConfig, ChatInput, ChatSession, PlainTextRenderer, Renderer, ResponseMode,
    SessionState, parse_input,
};

/// Main entry point for the dial-chat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, _) = ChatArgs::from_command_line_relaxed("dial-chat [OPTIONS]");
    let config = ChatConfig::load(args)?;

    let client = DialClient::from_config(&config)?;
    let mut renderer = PlainTextRenderer::new();
    let mut rl = DefaultEditor::new()?;

    // Flag for interrupt handling during streaming
    let interrupted = Arc::new(AtomicBool::new(false));

    // Set up Ctrl+C handler
    let interrupted_clone = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::Relaxed);
    })?;

    println!(
        "DIAL Chat (deployment: {}, {})",
        config.deployment,
        match config.mode {
            ResponseMode::Streaming => "streaming",
            ResponseMode::Complete => "whole replies",
        }
    );
    println!("Enter system prompt (or press Enter to use default):");
    let system_prompt = match rl.readline("> ") {
        Ok(line) if !line.trim().is_empty() => line.trim().to_string(),
        Ok(_) | Err(ReadlineError::Interrupted) => config.system_prompt.clone(),
        Err(ReadlineError::Eof) => {
            println!("\nGoodbye!");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    renderer.print_info(&format!("System prompt set: {system_prompt}"));
    println!("Chat started. Type 'exit' to quit.\n");

    let mut session = ChatSession::new(client, config.mode, system_prompt);

    loop {
        // Reset interrupt flag before each input
        interrupted.store(false, Ordering::Relaxed);

        match rl.readline("You: ") {
            Ok(line) => {
                if let ChatInput::Message(text) = parse_input(&line) {
                    let _ = rl.add_history_entry(text);
                    print!("Assistant: ");
                    let _ = std::io::stdout().flush();
                }
                let state = session
                    .handle_line(&line, &mut renderer, &interrupted)
                    .await;
                if state == SessionState::Closed {
                    println!("Goodbye!");
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                session.close();
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {err}"));
                session.close();
                break;
            }
        }
    }

    Ok(())
}
