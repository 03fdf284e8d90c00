//! SMTP protocol implementation.
//!
//! Command formatting, reply parsing, EHLO capability parsing, the session
//! state machine and DATA dot-stuffing (RFC 5321).

use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{EnhancedStatusCode, SmtpError, SmtpResult};

/// SMTP commands.
#[derive(Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// A bare line answering a 334 challenge.
    AuthResponse(String),
    /// MAIL FROM command with a bare address.
    MailFrom(String),
    /// RCPT TO command with a bare address.
    RcptTo(String),
    /// DATA command.
    Data,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending, without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::AuthResponse(line) => line.clone(),
            SmtpCommand::MailFrom(address) => format!("MAIL FROM:<{}>", address),
            SmtpCommand::RcptTo(address) => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Formats the command for transcripts and error messages.
    ///
    /// Authentication payloads are replaced with `[credentials]`.
    pub fn redacted(&self) -> String {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => format!("AUTH {} [credentials]", mechanism),
            SmtpCommand::AuthResponse(_) => "[credentials]".to_string(),
            other => other.to_smtp_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SmtpCommand({})", self.redacted())
    }
}

/// SMTP response from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Response message lines.
    pub message: Vec<String>,
    /// Whether this is a multiline response.
    pub is_multiline: bool,
}

impl SmtpResponse {
    /// Creates a new single-line response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
            is_multiline: false,
        }
    }

    /// Parses a response from raw lines (line terminators already removed).
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("Empty response"));
        }

        let mut messages = Vec::with_capacity(lines.len());
        let mut code = 0u16;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code = parse_code(line)?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(SmtpError::protocol(format!(
                    "Inconsistent status codes in multiline response: {} then {}",
                    code, parsed_code
                )));
            }

            messages.push(line.get(4..).unwrap_or("").to_string());
        }

        // 334 challenges are opaque base64 and must not be mangled
        let mut enhanced_code = None;
        if !(300..400).contains(&code) {
            if let Some((esc, rest)) = Self::parse_enhanced_code(&messages[0]) {
                enhanced_code = Some(esc);
                messages[0] = rest.trim().to_string();
            }
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
            is_multiline: lines.len() > 1,
        })
    }

    fn parse_enhanced_code(msg: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (first, rest) = match msg.split_once(' ') {
            Some((first, rest)) => (first, rest),
            None => (msg, ""),
        };
        let code = EnhancedStatusCode::parse(first)?;
        Some((code, rest))
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// Parses the three-digit code and checks the separator of one reply line.
pub(crate) fn parse_code(line: &str) -> SmtpResult<u16> {
    let digits = line
        .get(..3)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| SmtpError::protocol(format!("Invalid reply line: {:?}", line)))?;
    match line.as_bytes().get(3) {
        None | Some(b' ') | Some(b'-') => {}
        Some(_) => {
            return Err(SmtpError::protocol(format!(
                "Invalid reply separator: {:?}",
                line
            )))
        }
    }
    digits
        .parse()
        .map_err(|_| SmtpError::protocol(format!("Invalid status code: {:?}", line)))
}

/// Returns true if the reply line announces more lines to follow.
pub(crate) fn is_continuation(line: &str) -> bool {
    line.as_bytes().get(3) == Some(&b'-')
}

/// ESMTP capabilities advertised in the EHLO reply.
///
/// Keywords are upper-cased. AUTH tokens are upper-cased too, merged
/// across repeated lines (including the legacy `AUTH=` form) in the order
/// the server first listed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    domain: Option<String>,
    keywords: BTreeMap<String, Vec<String>>,
}

impl Capabilities {
    /// Parses capabilities from an EHLO response.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();
        let mut lines = response.message.iter();

        if let Some(first) = lines.next() {
            caps.domain = first.split_whitespace().next().map(str::to_string);
        }

        for line in lines {
            let mut tokens = line.split_whitespace();
            let Some(head) = tokens.next() else {
                continue;
            };
            let head = head.to_ascii_uppercase();

            let (keyword, mut params): (String, Vec<String>) =
                match head.strip_prefix("AUTH=") {
                    Some(first) => ("AUTH".to_string(), vec![first.to_string()]),
                    None => (head, Vec::new()),
                };
            params.extend(tokens.map(str::to_string));

            if keyword == "AUTH" {
                for p in params.iter_mut() {
                    p.make_ascii_uppercase();
                }
            }

            let entry = caps.keywords.entry(keyword).or_default();
            for param in params {
                if param.is_empty() || entry.contains(&param) {
                    continue;
                }
                entry.push(param);
            }
        }

        caps
    }

    /// Returns the domain the server named on the first EHLO line.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Returns true if no capability keyword was advertised.
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Checks if a capability keyword is advertised (case-insensitive).
    pub fn supports(&self, keyword: &str) -> bool {
        self.keywords.contains_key(&keyword.to_ascii_uppercase())
    }

    /// Returns the parameters of a capability keyword.
    pub fn params(&self, keyword: &str) -> &[String] {
        self.keywords
            .get(&keyword.to_ascii_uppercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns the advertised AUTH mechanisms in advertised order.
    pub fn auth_mechanisms(&self) -> &[String] {
        self.params("AUTH")
    }

    /// Returns true if STARTTLS is advertised.
    pub fn supports_starttls(&self) -> bool {
        self.supports("STARTTLS")
    }

    /// Returns the SIZE limit if advertised with a value.
    pub fn size(&self) -> Option<usize> {
        self.params("SIZE").first().and_then(|s| s.parse().ok())
    }

    /// Iterates over keyword and parameter pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.keywords
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Position of a session in the SMTP dialogue.
///
/// The order is strictly linear: a session only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// TCP (or implicit TLS) stream is open, greeting not yet read.
    Connected,
    /// A 220 greeting was received.
    Greeted,
    /// EHLO was accepted.
    Extended,
    /// The server only accepted HELO.
    Basic,
    /// STARTTLS completed and EHLO was re-issued.
    TlsUpgraded,
    /// AUTH completed.
    Authenticated,
    /// MAIL FROM was accepted.
    SenderSet,
    /// At least one RCPT TO was accepted.
    RecipientAccepted,
    /// The message was accepted after DATA.
    Transferred,
    /// QUIT was sent or the stream was dropped.
    Closed,
}

impl SessionState {
    /// Returns true if EHLO or HELO may be sent.
    pub fn can_hello(&self) -> bool {
        matches!(self, SessionState::Greeted)
    }

    /// Returns true if STARTTLS may be sent.
    pub fn can_start_tls(&self) -> bool {
        matches!(self, SessionState::Extended)
    }

    /// Returns true if authentication is allowed in this state.
    pub fn can_authenticate(&self) -> bool {
        matches!(
            self,
            SessionState::Extended | SessionState::Basic | SessionState::TlsUpgraded
        )
    }

    /// Returns true if MAIL FROM is allowed in this state.
    pub fn can_start_mail(&self) -> bool {
        matches!(
            self,
            SessionState::Extended
                | SessionState::Basic
                | SessionState::TlsUpgraded
                | SessionState::Authenticated
        )
    }

    /// Returns true if RCPT TO is allowed in this state.
    pub fn can_add_recipient(&self) -> bool {
        matches!(
            self,
            SessionState::SenderSet | SessionState::RecipientAccepted
        )
    }

    /// Returns true if DATA is allowed in this state.
    pub fn can_send_data(&self) -> bool {
        matches!(self, SessionState::RecipientAccepted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Prepares a message for DATA.
///
/// Bare LF becomes CRLF, lines starting with `.` get a second `.`, the body
/// is terminated with CRLF if needed, and the `.` CRLF end marker is
/// appended.
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 64 + 5);
    let mut at_line_start = true;
    let mut prev = None;

    for &b in body {
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        if b == b'\n' && prev != Some(b'\r') {
            out.push(b'\r');
        }
        out.push(b);
        at_line_start = b == b'\n';
        prev = Some(b);
    }

    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Reverses [`dot_stuff`], as a receiving server does.
///
/// Returns `None` if the end-of-data marker is missing.
pub fn dot_unstuff(payload: &[u8]) -> Option<Vec<u8>> {
    let body = if payload == b".\r\n" {
        &payload[..0]
    } else {
        payload.strip_suffix(b"\r\n.\r\n")?
    };

    let mut out = Vec::with_capacity(body.len() + 2);
    for (i, line) in body.split(|&b| b == b'\n').enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        match line.strip_prefix(b".") {
            Some(rest) => out.extend_from_slice(rest),
            None => out.extend_from_slice(line),
        }
    }
    if !body.is_empty() {
        out.extend_from_slice(b"\r\n");
    }
    Some(out)
}

/// Response codes for common SMTP operations.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Syntax error, command unrecognized.
    pub const SYNTAX_ERROR: u16 = 500;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u16 = 502;
}
