//! Observability for SMTP sessions.
//!
//! A session reports every command it sends and every reply it reads to a
//! [`SessionObserver`]. The session itself never prints. Commands arrive
//! already redacted, so no observer ever sees credentials.

use std::fmt;
use std::sync::Mutex;

use crate::protocol::SmtpResponse;

/// Receives the transcript of a session.
pub trait SessionObserver: Send + Sync + fmt::Debug {
    /// Called with the redacted form of each command line sent.
    fn on_command(&self, _line: &str) {}

    /// Called with each complete reply read.
    fn on_response(&self, _response: &SmtpResponse) {}

    /// Called when the message body is written after DATA.
    fn on_data(&self, _bytes: usize) {}

    /// Called for conditions the session continues past, such as a refused
    /// opportunistic STARTTLS.
    fn on_warning(&self, _message: &str) {}
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Formats a reply the way a transcript shows it.
///
/// Continuation lines are indented under the first.
pub fn format_response(response: &SmtpResponse) -> String {
    let mut text = String::new();
    if let Some(enhanced) = &response.enhanced_code {
        text.push_str(&enhanced.to_string());
        if !response.first_message().is_empty() {
            text.push(' ');
        }
    }
    text.push_str(&response.message.join("\n   "));
    format!("{} {}", response.code, text)
}

/// One line of a recorded transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    /// A line sent by the client.
    Client(String),
    /// A reply from the server.
    Server(String),
    /// A non-fatal condition.
    Warning(String),
}

impl fmt::Display for TranscriptEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptEntry::Client(line) => write!(f, "C: {}", line),
            TranscriptEntry::Server(line) => write!(f, "S: {}", line),
            TranscriptEntry::Warning(line) => write!(f, "W: {}", line),
        }
    }
}

/// Observer that records the transcript in memory.
#[derive(Debug, Default)]
pub struct TranscriptObserver {
    entries: Mutex<Vec<TranscriptEntry>>,
}

impl TranscriptObserver {
    /// Creates an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded entries.
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Returns the recorded transcript as `C:`/`S:` lines.
    pub fn lines(&self) -> Vec<String> {
        self.entries().iter().map(ToString::to_string).collect()
    }

    /// Returns the client lines only.
    pub fn commands(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                TranscriptEntry::Client(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    /// Returns the warnings only.
    pub fn warnings(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                TranscriptEntry::Warning(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    fn push(&self, entry: TranscriptEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

impl SessionObserver for TranscriptObserver {
    fn on_command(&self, line: &str) {
        self.push(TranscriptEntry::Client(line.to_string()));
    }

    fn on_response(&self, response: &SmtpResponse) {
        self.push(TranscriptEntry::Server(format_response(response)));
    }

    fn on_data(&self, bytes: usize) {
        self.push(TranscriptEntry::Client(format!(
            "[Message body, {} bytes]",
            bytes
        )));
        self.push(TranscriptEntry::Client(".".to_string()));
    }

    fn on_warning(&self, message: &str) {
        self.push(TranscriptEntry::Warning(message.to_string()));
    }
}

/// Observer that emits the transcript as `tracing` events.
///
/// Commands and replies are logged at DEBUG under the
/// `smtp_cli::transcript` target; warnings at WARN.
#[cfg(feature = "tracing")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

#[cfg(feature = "tracing")]
impl SessionObserver for TracingObserver {
    fn on_command(&self, line: &str) {
        tracing::debug!(target: "smtp_cli::transcript", "C: {}", line);
    }

    fn on_response(&self, response: &SmtpResponse) {
        tracing::debug!(target: "smtp_cli::transcript", "S: {}", format_response(response));
    }

    fn on_data(&self, bytes: usize) {
        tracing::debug!(target: "smtp_cli::transcript", "C: [Message body, {} bytes]", bytes);
        tracing::debug!(target: "smtp_cli::transcript", "C: .");
    }

    fn on_warning(&self, message: &str) {
        tracing::warn!(target: "smtp_cli::transcript", "{}", message);
    }
}
