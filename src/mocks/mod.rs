//! Mock implementations for testing.
//!
//! [`MockTransport`] replays scripted server replies and records everything
//! the session writes. Clones share state, so a test can hand one clone to a
//! [`Session`](crate::session::Session) and inspect the other afterwards.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dns::MxResolver;
use crate::errors::{SmtpError, SmtpResult};
use crate::protocol::{codes, SmtpResponse};
use crate::transport::SmtpTransport;
use crate::types::{Attachment, Email};

#[derive(Debug, Default)]
struct MockState {
    lines: Vec<String>,
    responses: VecDeque<SmtpResponse>,
    data_received: Vec<Vec<u8>>,
    tls_enabled: bool,
    tls_hosts: Vec<String>,
    shut_down: bool,
    fail_next: Option<SmtpError>,
    fail_tls: Option<SmtpError>,
    fail_data: Option<SmtpError>,
}

/// Mock SMTP transport for testing.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates a new mock transport with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread poisons the lock; the data is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a response.
    pub fn queue_response(&self, response: SmtpResponse) -> &Self {
        self.state().responses.push_back(response);
        self
    }

    /// Queues a response given as raw wire lines.
    ///
    /// # Panics
    ///
    /// Panics if the lines are not a valid reply.
    pub fn queue_raw(&self, lines: &[&str]) -> &Self {
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        let response = SmtpResponse::parse(&lines).unwrap_or_else(|e| panic!("bad script: {e}"));
        self.queue_response(response)
    }

    /// Queues an OK response.
    pub fn queue_ok(&self) -> &Self {
        self.queue_response(SmtpResponse::new(codes::OK, "OK"))
    }

    /// Queues an error response.
    pub fn queue_error(&self, code: u16, message: &str) -> &Self {
        self.queue_response(SmtpResponse::new(code, message))
    }

    /// Sets the next operation to fail.
    pub fn fail_next_with(&self, error: SmtpError) -> &Self {
        self.state().fail_next = Some(error);
        self
    }

    /// Makes the next message body write fail.
    pub fn fail_data_with(&self, error: SmtpError) -> &Self {
        self.state().fail_data = Some(error);
        self
    }

    /// Makes the next TLS upgrade fail.
    pub fn fail_tls_with(&self, error: SmtpError) -> &Self {
        self.state().fail_tls = Some(error);
        self
    }

    /// Returns the raw lines written, unredacted.
    pub fn recorded_lines(&self) -> Vec<String> {
        self.state().lines.clone()
    }

    /// Returns the command verbs written, e.g. `["EHLO", "MAIL", ...]`.
    pub fn recorded_verbs(&self) -> Vec<String> {
        self.state()
            .lines
            .iter()
            .map(|l| {
                l.split([' ', ':'])
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    /// Returns payloads written with `send_data`.
    pub fn received_data(&self) -> Vec<Vec<u8>> {
        self.state().data_received.clone()
    }

    /// Returns the host names TLS was negotiated for.
    pub fn tls_hosts(&self) -> Vec<String> {
        self.state().tls_hosts.clone()
    }

    /// Returns the number of scripted replies not yet consumed.
    pub fn pending_responses(&self) -> usize {
        self.state().responses.len()
    }

    /// Returns true once `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_line(&mut self, line: &str) -> SmtpResult<()> {
        let mut state = self.state();
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        if state.shut_down {
            return Err(SmtpError::connection("Connection is closed"));
        }
        state.lines.push(line.to_string());
        Ok(())
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        let mut state = self.state();
        if let Some(error) = state.fail_data.take().or_else(|| state.fail_next.take()) {
            state.shut_down = true;
            return Err(error);
        }
        state.data_received.push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let mut state = self.state();
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        state
            .responses
            .pop_front()
            .ok_or_else(|| SmtpError::connection("Server closed connection"))
    }

    async fn upgrade_tls(&mut self, host: &str) -> SmtpResult<()> {
        let mut state = self.state();
        if let Some(error) = state.fail_tls.take() {
            state.shut_down = true;
            return Err(error);
        }
        state.tls_enabled = true;
        state.tls_hosts.push(host.to_string());
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.state().tls_enabled
    }

    async fn shutdown(&mut self) {
        self.state().shut_down = true;
    }
}

/// Resolver answering from a fixed table.
#[derive(Debug, Default)]
pub struct MockMxResolver {
    records: HashMap<String, Vec<String>>,
    queried: Mutex<Vec<String>>,
}

impl MockMxResolver {
    /// Creates a resolver that knows no domains.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the exchangers for a domain, most preferred first.
    pub fn with_domain(mut self, domain: &str, hosts: &[&str]) -> Self {
        self.records.insert(
            domain.to_ascii_lowercase(),
            hosts.iter().map(|h| h.to_string()).collect(),
        );
        self
    }

    /// Returns the domains looked up so far.
    pub fn queried(&self) -> Vec<String> {
        self.queried
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MxResolver for MockMxResolver {
    async fn lookup_mx(&self, domain: &str) -> SmtpResult<Vec<String>> {
        if let Ok(mut queried) = self.queried.lock() {
            queried.push(domain.to_string());
        }
        self.records
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| SmtpError::dns(format!("No MX records found for {}", domain)))
    }
}

/// Creates a test email.
pub fn test_email() -> SmtpResult<Email> {
    Email::builder()
        .from("sender@example.com")?
        .to("recipient@example.com")?
        .subject("Test Subject")
        .body_plain("Test body")
        .build()
}

/// Creates a test email with HTML.
pub fn test_email_html() -> SmtpResult<Email> {
    Email::builder()
        .from("sender@example.com")?
        .to("recipient@example.com")?
        .subject("Test Subject")
        .body_plain("Plain text version")
        .body_html("<html><body><h1>HTML version</h1></body></html>")
        .build()
}

/// Creates a test email with attachment.
pub fn test_email_with_attachment() -> SmtpResult<Email> {
    Email::builder()
        .from("sender@example.com")?
        .to("recipient@example.com")?
        .subject("Test with Attachment")
        .body_plain("See attached")
        .attachment(Attachment::new("test.txt", b"Hello, World!".to_vec())?)
        .build()
}

/// Creates an EHLO response with standard capabilities.
pub fn ehlo_response() -> SmtpResponse {
    SmtpResponse {
        code: codes::OK,
        enhanced_code: None,
        message: vec![
            "smtp.example.com Hello".to_string(),
            "SIZE 10485760".to_string(),
            "AUTH PLAIN LOGIN CRAM-MD5".to_string(),
            "STARTTLS".to_string(),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ],
        is_multiline: true,
    }
}

/// Creates an EHLO response advertising the given AUTH mechanisms and no
/// STARTTLS.
pub fn ehlo_response_with_auth(mechanisms: &str) -> SmtpResponse {
    SmtpResponse {
        code: codes::OK,
        enhanced_code: None,
        message: vec![
            "smtp.example.com Hello".to_string(),
            format!("AUTH {}", mechanisms),
        ],
        is_multiline: true,
    }
}

/// Creates a greeting response.
pub fn greeting_response() -> SmtpResponse {
    SmtpResponse::new(codes::SERVICE_READY, "smtp.example.com ESMTP ready")
}

/// Creates an authentication success response.
pub fn auth_success_response() -> SmtpResponse {
    SmtpResponse::new(codes::AUTH_SUCCESS, "Authentication successful")
}

/// Creates a DATA ready response.
pub fn data_ready_response() -> SmtpResponse {
    SmtpResponse::new(codes::START_MAIL_INPUT, "Start mail input")
}

/// Creates an AUTH continue response.
pub fn auth_continue_response(challenge: &str) -> SmtpResponse {
    SmtpResponse::new(codes::AUTH_CONTINUE, challenge)
}
