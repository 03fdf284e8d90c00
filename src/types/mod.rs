//! Core types for composing and sending one message.
//!
//! This module provides:
//! - Mailbox addresses with validation
//! - Attachments with content-type detection
//! - The [`Email`] description consumed by the composer
//! - Envelope derivation and the send report

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthMechanism;
use crate::errors::{SmtpError, SmtpResult};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Bare address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        let name = name.into();
        if name.chars().any(|c| c.is_control()) {
            return Err(SmtpError::compose(
                "Display name cannot contain control characters",
            ));
        }
        Ok(Self {
            name: (!name.is_empty()).then_some(name),
            email,
        })
    }

    /// Parses a mailbox (e.g., "John Doe <john@example.com>" or
    /// "john@example.com").
    pub fn parse(s: &str) -> SmtpResult<Self> {
        let s = s.trim();

        if let Some(start) = s.rfind('<') {
            let end = s[start..].find('>').map(|i| start + i).ok_or_else(|| {
                SmtpError::compose(format!("Unterminated angle address: {}", s))
            })?;
            let name = s[..start].trim();
            let email = s[start + 1..end].trim();
            return match name
                .strip_prefix('"')
                .and_then(|n| n.strip_suffix('"'))
            {
                Some(quoted) => Self::with_name(&unquote(quoted), email),
                None => Self::with_name(name.trim_matches('"').trim(), email),
            };
        }

        Self::new(s)
    }

    /// Validates an address according to RFC 5321 length limits.
    fn validate_email(email: &str) -> SmtpResult<()> {
        if email.is_empty() {
            return Err(SmtpError::compose("Email address cannot be empty"));
        }

        if email.len() > 254 {
            return Err(SmtpError::compose(
                "Email address too long (max 254 characters)",
            ));
        }

        let (local, domain) = match email.split_once('@') {
            Some((local, domain)) if !domain.contains('@') => (local, domain),
            _ => {
                return Err(SmtpError::compose(format!(
                    "Email address must contain exactly one @: {}",
                    email
                )))
            }
        };

        if local.is_empty() || local.len() > 64 {
            return Err(SmtpError::compose(format!(
                "Local part must be 1-64 characters: {}",
                email
            )));
        }

        if domain.is_empty() {
            return Err(SmtpError::compose(format!(
                "Domain cannot be empty: {}",
                email
            )));
        }

        if email.chars().any(|c| c.is_control() || c.is_whitespace() || c == '<' || c == '>') {
            return Err(SmtpError::compose(format!(
                "Email address contains invalid characters: {}",
                email
            )));
        }

        Ok(())
    }

    /// Returns the bare address.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the domain part.
    pub fn domain(&self) -> &str {
        self.email
            .split_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or_default()
    }
}

/// Removes quoted-pair escapes from a quoted display name.
fn unquote(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out.trim().to_string()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') => {
                f.write_str("\"")?;
                for c in name.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                write!(f, "\" <{}>", self.email)
            }
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => f.write_str(&self.email),
        }
    }
}

impl TryFrom<&str> for Address {
    type Error = SmtpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = SmtpError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

impl TryFrom<&String> for Address {
    type Error = SmtpError;

    fn try_from(s: &String) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

/// Content disposition for attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentDisposition {
    /// Regular attachment.
    #[default]
    Attachment,
    /// Inline content, referenced from the HTML body by Content-ID.
    Inline,
}

impl fmt::Display for ContentDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentDisposition::Attachment => write!(f, "attachment"),
            ContentDisposition::Inline => write!(f, "inline"),
        }
    }
}

/// Guesses a content type from a file extension.
///
/// Only a handful of common types are recognised; everything else is
/// `application/octet-stream`.
pub fn content_type_for(path: &str) -> mime::Mime {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("txt") => mime::TEXT_PLAIN,
        Some("htm" | "html") => mime::TEXT_HTML,
        Some("jpg" | "jpeg") => mime::IMAGE_JPEG,
        Some("png") => mime::IMAGE_PNG,
        Some("gif") => mime::IMAGE_GIF,
        Some("pdf") => mime::APPLICATION_PDF,
        Some("zip") => "application/zip"
            .parse()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM),
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

/// Returns the final path component, accepting both separators.
fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// File attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// Base name used in headers.
    pub filename: String,
    /// MIME content type.
    pub content_type: mime::Mime,
    /// Binary content.
    pub data: Vec<u8>,
    /// Content disposition.
    pub disposition: ContentDisposition,
}

impl Attachment {
    /// Creates an attachment, guessing the type from the extension.
    ///
    /// Only the base name of `path` is kept.
    pub fn new(path: &str, data: Vec<u8>) -> SmtpResult<Self> {
        Self::build(path, content_type_for(path), data)
    }

    /// Creates an attachment with an explicit content type.
    pub fn with_content_type(path: &str, content_type: &str, data: Vec<u8>) -> SmtpResult<Self> {
        let parsed: mime::Mime = content_type.trim().parse().map_err(|e| {
            SmtpError::compose(format!("Invalid content type '{}'", content_type)).with_cause(e)
        })?;
        Self::build(path, parsed, data)
    }

    fn build(path: &str, content_type: mime::Mime, data: Vec<u8>) -> SmtpResult<Self> {
        let filename = base_name(path);
        if filename.is_empty() {
            return Err(SmtpError::compose(format!(
                "Attachment path has no file name: {}",
                path
            )));
        }
        if filename.chars().any(|c| c.is_control() || c == '"') {
            return Err(SmtpError::compose(format!(
                "Attachment file name contains invalid characters: {}",
                filename
            )));
        }
        Ok(Self {
            filename: filename.to_string(),
            content_type,
            data,
            disposition: ContentDisposition::Attachment,
        })
    }

    /// Sets the content disposition to inline.
    pub fn inline(mut self) -> Self {
        self.disposition = ContentDisposition::Inline;
        self
    }

    /// Returns true for inline attachments.
    pub fn is_inline(&self) -> bool {
        self.disposition == ContentDisposition::Inline
    }

    /// Returns the Content-ID of an inline attachment (its file name).
    pub fn content_id(&self) -> Option<&str> {
        self.is_inline().then_some(self.filename.as_str())
    }

    /// Returns the CID reference for use in HTML (e.g., "cid:logo.png").
    pub fn cid_reference(&self) -> Option<String> {
        self.content_id().map(|id| format!("cid:{}", id))
    }
}

/// Splits an attachment argument of the form `path[@type/subtype]`.
///
/// The suffix after the last `@` only counts as a type override if it
/// contains a `/`, so paths with `@` in them still work.
pub fn split_attachment_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.rsplit_once('@') {
        Some((path, content_type)) if content_type.contains('/') && !path.is_empty() => {
            (path, Some(content_type))
        }
        _ => (spec, None),
    }
}

/// Parses a `Name: value` header argument.
pub fn parse_header_line(line: &str) -> SmtpResult<(String, String)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| SmtpError::compose(format!("Header must be 'Name: value': {}", line)))?;
    let name = name.trim();
    validate_header_name(name)?;
    validate_header_value(value)?;
    Ok((name.to_string(), value.trim().to_string()))
}

pub(crate) fn validate_header_name(name: &str) -> SmtpResult<()> {
    if name.is_empty()
        || name
            .chars()
            .any(|c| !c.is_ascii_graphic() || c == ':')
    {
        return Err(SmtpError::compose(format!("Invalid header name: {:?}", name)));
    }
    Ok(())
}

pub(crate) fn validate_header_value(value: &str) -> SmtpResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(SmtpError::compose(format!(
            "Header value cannot contain line breaks: {:?}",
            value
        )));
    }
    Ok(())
}

/// Message description consumed by the composer.
///
/// Every field is optional except that sending needs at least one
/// recipient; see [`Email::envelope`].
#[derive(Debug, Clone, Default)]
pub struct Email {
    /// Author mailbox.
    pub from: Option<Address>,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// CC recipients.
    pub cc: Vec<Address>,
    /// BCC recipients; never written to headers.
    pub bcc: Vec<Address>,
    /// Subject line.
    pub subject: Option<String>,
    /// Plain text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
    /// Attachments, regular and inline.
    pub attachments: Vec<Attachment>,
    /// Default headers to drop, by exact name.
    pub remove_headers: Vec<String>,
    /// Headers whose value is replaced (or appended if absent).
    pub replace_headers: Vec<(String, String)>,
    /// Header lines added verbatim.
    pub add_headers: Vec<String>,
    /// Explicit envelope sender.
    pub mail_from: Option<String>,
    /// Explicit envelope recipients.
    pub rcpt_to: Vec<String>,
}

impl Email {
    /// Creates a new email builder.
    pub fn builder() -> EmailBuilder {
        EmailBuilder::default()
    }

    /// Returns the header recipients in To, Cc, Bcc order.
    pub fn all_recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Derives the SMTP envelope for this message.
    pub fn envelope(&self) -> SmtpResult<Envelope> {
        Envelope::derive(
            self.mail_from.as_deref(),
            self.from.as_ref(),
            &self.rcpt_to,
            self.all_recipients(),
        )
    }
}

/// Builder for [`Email`].
#[derive(Debug, Default)]
pub struct EmailBuilder {
    email: Email,
}

impl EmailBuilder {
    /// Sets the author mailbox.
    pub fn from(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.email.from = Some(address.try_into()?);
        Ok(self)
    }

    /// Adds a primary recipient.
    pub fn to(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.email.to.push(address.try_into()?);
        Ok(self)
    }

    /// Adds multiple primary recipients.
    pub fn to_many<I, A>(mut self, addresses: I) -> SmtpResult<Self>
    where
        I: IntoIterator<Item = A>,
        A: TryInto<Address, Error = SmtpError>,
    {
        for addr in addresses {
            self.email.to.push(addr.try_into()?);
        }
        Ok(self)
    }

    /// Adds a CC recipient.
    pub fn cc(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.email.cc.push(address.try_into()?);
        Ok(self)
    }

    /// Adds a BCC recipient.
    pub fn bcc(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.email.bcc.push(address.try_into()?);
        Ok(self)
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.email.subject = Some(subject.into());
        self
    }

    /// Sets the plain text body.
    pub fn body_plain(mut self, text: impl Into<String>) -> Self {
        self.email.text = Some(text.into());
        self
    }

    /// Sets the HTML body.
    pub fn body_html(mut self, html: impl Into<String>) -> Self {
        self.email.html = Some(html.into());
        self
    }

    /// Adds an attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.email.attachments.push(attachment);
        self
    }

    /// Adds an inline attachment.
    pub fn inline(mut self, attachment: Attachment) -> Self {
        self.email.attachments.push(attachment.inline());
        self
    }

    /// Drops a default header by exact, case-sensitive name.
    pub fn remove_header(mut self, name: impl Into<String>) -> Self {
        self.email.remove_headers.push(name.into());
        self
    }

    /// Replaces a header value, appending the header if it is absent.
    pub fn replace_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.email.replace_headers.push((name.into(), value.into()));
        self
    }

    /// Adds a header line verbatim, e.g. `"X-Mailer: smtp-cli"`.
    pub fn add_header(mut self, line: impl Into<String>) -> Self {
        self.email.add_headers.push(line.into());
        self
    }

    /// Sets the envelope sender used in MAIL FROM.
    pub fn mail_from(mut self, address: impl Into<String>) -> Self {
        self.email.mail_from = Some(address.into());
        self
    }

    /// Adds an envelope recipient used in RCPT TO.
    pub fn rcpt_to(mut self, address: impl Into<String>) -> Self {
        self.email.rcpt_to.push(address.into());
        self
    }

    /// Builds the email, validating header edits.
    pub fn build(self) -> SmtpResult<Email> {
        let email = self.email;

        if let Some(subject) = &email.subject {
            validate_header_value(subject)?;
        }
        for name in &email.remove_headers {
            validate_header_name(name)?;
        }
        for (name, value) in &email.replace_headers {
            validate_header_name(name)?;
            validate_header_value(value)?;
        }
        for line in &email.add_headers {
            parse_header_line(line)?;
        }

        Ok(email)
    }
}

/// The SMTP envelope: who MAIL FROM and RCPT TO name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Reverse path; empty for the null sender `<>`.
    pub sender: String,
    /// Forward paths, in RCPT order.
    pub recipients: Vec<String>,
}

impl Envelope {
    /// Creates an envelope from bare addresses.
    pub fn new(sender: impl Into<String>, recipients: Vec<String>) -> SmtpResult<Self> {
        let envelope = Self {
            sender: sender.into(),
            recipients,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Derives an envelope the way the header fields imply.
    ///
    /// The sender is `mail_from` if given, else the bare address of `from`,
    /// else the null sender. Recipients are `rcpt_to` if non-empty, else
    /// the bare addresses of `header_recipients`.
    pub fn derive<'a>(
        mail_from: Option<&str>,
        from: Option<&Address>,
        rcpt_to: &[String],
        header_recipients: impl IntoIterator<Item = &'a Address>,
    ) -> SmtpResult<Self> {
        let sender = match (mail_from, from) {
            (Some(explicit), _) => explicit.trim().to_string(),
            (None, Some(from)) => from.email.clone(),
            (None, None) => String::new(),
        };

        let recipients = if rcpt_to.is_empty() {
            header_recipients
                .into_iter()
                .map(|a| a.email.clone())
                .collect()
        } else {
            rcpt_to.iter().map(|r| r.trim().to_string()).collect()
        };

        Self::new(sender, recipients)
    }

    fn validate(&self) -> SmtpResult<()> {
        if self.recipients.is_empty() {
            return Err(SmtpError::configuration("No recipients given"));
        }
        for address in std::iter::once(&self.sender).chain(&self.recipients) {
            if address.contains(|c: char| c.is_control() || c == '<' || c == '>') {
                return Err(SmtpError::configuration(format!(
                    "Invalid envelope address: {:?}",
                    address
                )));
            }
        }
        if self.recipients.iter().any(|r| r.is_empty()) {
            return Err(SmtpError::configuration("Empty envelope recipient"));
        }
        Ok(())
    }

    /// Returns the domain of the first recipient, used for MX lookup.
    pub fn first_recipient_domain(&self) -> Option<&str> {
        self.recipients
            .first()
            .and_then(|r| r.rsplit_once('@'))
            .map(|(_, domain)| domain)
            .filter(|d| !d.is_empty())
    }
}

/// A recipient the server refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecipient {
    /// The rejected address.
    pub address: String,
    /// SMTP status code, if the server answered.
    pub code: Option<u16>,
    /// Server text or error description.
    pub message: String,
}

impl fmt::Display for RejectedRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "<{}>: {} {}", self.address, code, self.message),
            None => write!(f, "<{}>: {}", self.address, self.message),
        }
    }
}

/// Outcome of a successful send.
#[derive(Debug, Clone)]
pub struct SendReport {
    /// Server the message was handed to.
    pub server: String,
    /// Recipients the server accepted.
    pub accepted: Vec<String>,
    /// Text of the final reply to the message body.
    pub response: String,
    /// Whether the session was encrypted.
    pub tls: bool,
    /// Mechanism used to authenticate, if any.
    pub mechanism: Option<AuthMechanism>,
    /// Wall time from connect to the final reply.
    pub duration: Duration,
}
