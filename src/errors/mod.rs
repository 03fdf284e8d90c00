//! Error types for the SMTP sender.
//!
//! Every failure in the crate is an [`SmtpError`]. An error carries its
//! [`SmtpErrorKind`], a human-readable message and, when the failure came
//! from a server reply, the command that was sent, the code that was
//! expected, the code the server answered with and its literal text.

use std::fmt;
use thiserror::Error;

use crate::protocol::SmtpResponse;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// SMTP error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    /// TCP connect failed, or the greeting was missing or not 220.
    Connection,
    /// A connect or command deadline expired.
    Timeout,
    /// STARTTLS was refused, or the TLS handshake failed.
    Tls,
    /// The server answered a command with an unexpected code, or sent
    /// something that is not an SMTP reply.
    Protocol,
    /// A session operation was called out of order.
    Sequence,
    /// Authentication failed or no usable mechanism exists.
    Auth,
    /// The server rejected the sender or a recipient.
    Rejected,
    /// DATA was refused or the message transfer failed.
    Transfer,
    /// The message could not be composed.
    Compose,
    /// Configuration is invalid.
    Configuration,
    /// MX lookup failed.
    Dns,
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::Connection => write!(f, "Connection error"),
            SmtpErrorKind::Timeout => write!(f, "Timed out"),
            SmtpErrorKind::Tls => write!(f, "TLS error"),
            SmtpErrorKind::Protocol => write!(f, "Protocol error"),
            SmtpErrorKind::Sequence => write!(f, "Command sequence error"),
            SmtpErrorKind::Auth => write!(f, "Authentication failed"),
            SmtpErrorKind::Rejected => write!(f, "Rejected by server"),
            SmtpErrorKind::Transfer => write!(f, "Message transfer failed"),
            SmtpErrorKind::Compose => write!(f, "Message composition error"),
            SmtpErrorKind::Configuration => write!(f, "Invalid configuration"),
            SmtpErrorKind::Dns => write!(f, "DNS resolution failed"),
        }
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Creates a new enhanced status code.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class: u8 = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !(2..=5).contains(&class) {
            return None;
        }
        Some(Self {
            class,
            subject,
            detail,
        })
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// SMTP error with detailed information.
#[derive(Error, Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    /// Command or phase that failed, already redacted.
    command: Option<String>,
    expected_code: Option<u16>,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    server_text: Option<String>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new SMTP error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            command: None,
            expected_code: None,
            smtp_code: None,
            enhanced_code: None,
            server_text: None,
            cause: None,
        }
    }

    /// Builds an error from a reply that did not carry the expected code.
    ///
    /// `command` must already be in its redacted transcript form.
    pub fn from_response(
        kind: SmtpErrorKind,
        command: impl Into<String>,
        expected: u16,
        response: &SmtpResponse,
    ) -> Self {
        let command = command.into();
        let mut err = Self::new(kind, format!("{} failed, expected {}", command, expected))
            .with_command(command)
            .with_expected_code(expected)
            .with_smtp_code(response.code)
            .with_server_text(response.full_message());
        if let Some(enhanced) = &response.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }

    /// Sets the failing command or phase.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Sets the reply code that was expected.
    pub fn with_expected_code(mut self, code: u16) -> Self {
        self.expected_code = Some(code);
        self
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the server's literal reply text.
    pub fn with_server_text(mut self, text: impl Into<String>) -> Self {
        self.server_text = Some(text.into());
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns a copy of this error with a different kind.
    pub(crate) fn into_kind(mut self, kind: SmtpErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the failing command or phase, if known.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Returns the reply code that was expected, if any.
    pub fn expected_code(&self) -> Option<u16> {
        self.expected_code
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns the server's literal reply text if available.
    pub fn server_text(&self) -> Option<&str> {
        self.server_text.as_deref()
    }

    // Convenience constructors

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Connection, message)
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Timeout, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Tls, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Auth, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Protocol, message)
    }

    /// Creates a sequence error.
    pub fn sequence(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Sequence, message)
    }

    /// Creates a transfer error.
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Transfer, message)
    }

    /// Creates a composition error.
    pub fn compose(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Compose, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Configuration, message)
    }

    /// Creates a DNS error.
    pub fn dns(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Dns, message)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(command) = &self.command {
            if !self.message.contains(command.as_str()) {
                write!(f, " (during {})", command)?;
            }
        }
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        if let Some(text) = &self.server_text {
            if !text.is_empty() {
                write!(f, ": {}", text)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, 5);
        assert_eq!(code.subject, 1);
        assert_eq!(code.detail, 1);
        assert!(code.is_permanent());

        assert!(EnhancedStatusCode::parse("2.0").is_none());
        assert!(EnhancedStatusCode::parse("1.2.3").is_none());
        assert!(EnhancedStatusCode::parse("5.1.1.1").is_none());
        assert!(EnhancedStatusCode::parse("PGl0").is_none());
    }

    #[test]
    fn test_error_from_response() {
        let response = SmtpResponse::parse(&["550 5.1.1 No such user".to_string()]).unwrap();
        let err = SmtpError::from_response(
            SmtpErrorKind::Rejected,
            "RCPT TO:<nobody@example.com>",
            250,
            &response,
        );

        assert_eq!(err.kind(), SmtpErrorKind::Rejected);
        assert_eq!(err.command(), Some("RCPT TO:<nobody@example.com>"));
        assert_eq!(err.expected_code(), Some(250));
        assert_eq!(err.smtp_code(), Some(550));
        assert_eq!(err.server_text(), Some("No such user"));
        assert_eq!(
            err.to_string(),
            "Rejected by server: RCPT TO:<nobody@example.com> failed, expected 250 (SMTP 550) [5.1.1]: No such user"
        );
    }

    #[test]
    fn test_error_display_without_reply() {
        let err = SmtpError::connection("connection refused");
        assert_eq!(err.to_string(), "Connection error: connection refused");
        assert!(err.smtp_code().is_none());
    }

    #[test]
    fn test_error_display_names_phase() {
        let err = SmtpError::transfer("Connection reset").with_command("message body");
        assert_eq!(
            err.to_string(),
            "Message transfer failed: Connection reset (during message body)"
        );
    }

    #[test]
    fn test_error_cause_is_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = SmtpError::transfer("write failed").with_cause(io);
        assert!(err.source().is_some());
    }
}
