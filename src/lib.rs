//! # smtp-cli
//!
//! Sends one message per invocation to one SMTP server:
//! - RFC 5321 session with EHLO/HELO fallback and a strict command order
//! - STARTTLS (opportunistic or required) and implicit TLS
//! - PLAIN, LOGIN and CRAM-MD5 authentication
//! - MIME composition of text, HTML, attachments and inline parts
//! - Server selection by MX lookup when no host is given
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smtp_cli::{Email, SmtpClient, SmtpConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SmtpConfig::builder()
//!         .host("smtp.example.com")
//!         .port(587)
//!         .credentials("user@example.com", "password")
//!         .build()?;
//!
//!     let client = SmtpClient::new(config);
//!
//!     let email = Email::builder()
//!         .from("sender@example.com")?
//!         .to("recipient@example.com")?
//!         .subject("Hello from Rust!")
//!         .body_plain("This is a test email.")
//!         .build()?;
//!
//!     let report = client.send_email(&email).await?;
//!     println!("Accepted by {}: {}", report.server, report.response);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;
pub mod session;

// Transport layer
pub mod dns;
pub mod transport;

// Authentication
pub mod auth;

// Message composition
pub mod input;
pub mod mime;

// Observability
pub mod observability;

// Client
pub mod client;

// Mocks for testing
#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMechanism, Credentials};
pub use client::{SmtpClient, SmtpClientBuilder};
pub use config::{NetworkFamily, SmtpConfig, SmtpConfigBuilder, TlsConfig, TlsMode};
pub use dns::{DnsMxResolver, MxResolver};
pub use errors::{SmtpError, SmtpErrorKind, SmtpResult};
pub use crate::mime::{ComposedMessage, Composer, ComposerConfig, Message, TransferEncoding};
pub use observability::{NoopObserver, SessionObserver, TranscriptObserver};
pub use protocol::{Capabilities, SessionState, SmtpCommand, SmtpResponse};
pub use session::Session;
pub use transport::{SmtpTransport, TcpTransport};
pub use types::{
    Address, Attachment, ContentDisposition, Email, EmailBuilder, Envelope, RejectedRecipient,
    SendReport,
};
