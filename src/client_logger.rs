//! Logging trait for completion client operations.
//!
//! This module provides the [`ClientLogger`] trait that allows users to capture
//! and log all traffic passing through a [`DialClient`](crate::DialClient).
//! A client built without a logger stays quiet; one built with
//! [`DialClient::with_logger`](crate::DialClient::with_logger) reports every
//! request, response and streamed fragment.

use std::io::{self, Write};
use std::sync::Mutex;

use crate::types::RequestSpec;

/// A trait for logging completion client operations.
///
/// # Example
///
/// ```rust,ignore
/// use dial_chat::{ClientLogger, RequestSpec};
///
/// struct CountingLogger(std::sync::atomic::AtomicUsize);
///
/// impl ClientLogger for CountingLogger {
///     fn log_request(&self, _url: &str, _request: &RequestSpec<'_>) {
///         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///     }
///     fn log_response(&self, _status: u16, _body: &str) {}
///     fn log_stream_start(&self, _status: u16) {}
///     fn log_stream_fragment(&self, _text: &str) {}
///     fn log_stream_end(&self, _completed: bool) {}
/// }
/// ```
pub trait ClientLogger: Send + Sync {
    /// Log an outgoing request before it is sent.
    fn log_request(&self, url: &str, request: &RequestSpec<'_>);

    /// Log the status and raw body of a non-streaming response.
    fn log_response(&self, status: u16, body: &str);

    /// Log the status of a streaming response once its headers arrive.
    fn log_stream_start(&self, status: u16);

    /// Log one text fragment of a streaming response.
    fn log_stream_fragment(&self, text: &str);

    /// Log the end of a streaming response.
    ///
    /// `completed` is false when the connection closed before the server
    /// signalled the end of the stream.
    fn log_stream_end(&self, completed: bool);
}

/// A [`ClientLogger`] that dumps traffic to a writer, stderr by default.
///
/// The API key never reaches the logger; the header block it prints shows a
/// redacted placeholder.
pub struct StderrLogger<W: Write + Send = io::Stderr> {
    out: Mutex<W>,
}

impl StderrLogger {
    /// Creates a logger that writes to stderr.
    pub fn new() -> Self {
        Self::with_writer(io::stderr())
    }
}

impl Default for StderrLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> StderrLogger<W> {
    /// Creates a logger that writes to `out`.
    pub fn with_writer(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Consumes the logger, returning the writer.
    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self, text: &str) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Logging must never fail a request.
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

fn pretty(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|err| format!("<unserializable: {err}>"))
}

impl<W: Write + Send> ClientLogger for StderrLogger<W> {
    fn log_request(&self, url: &str, request: &RequestSpec<'_>) {
        let title = if request.stream {
            "STREAM REQUEST"
        } else {
            "REQUEST"
        };
        let headers = serde_json::json!({
            "api-key": "<redacted>",
            "Content-Type": "application/json",
        });
        self.write(&format!(
            "\n=== {title} ===\nURL: {url}\nHeaders: {}\nBody: {}\n===============\n",
            pretty(&headers),
            pretty(request),
        ));
    }

    fn log_response(&self, status: u16, body: &str) {
        let body = match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) => pretty(&value),
            Err(_) => body.to_string(),
        };
        self.write(&format!(
            "\n=== RESPONSE ===\nStatus Code: {status}\nResponse: {body}\n================\n"
        ));
    }

    fn log_stream_start(&self, status: u16) {
        self.write(&format!("\n=== STREAM RESPONSE (Status: {status}) ===\n"));
    }

    fn log_stream_fragment(&self, _text: &str) {}

    fn log_stream_end(&self, completed: bool) {
        if completed {
            self.write("\n[Stream completed]\n======================\n");
        } else {
            self.write("\n[Stream closed before completion]\n======================\n");
        }
    }
}
