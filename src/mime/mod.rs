//! MIME composition for email messages.
//!
//! Provides RFC 5322 message formatting with:
//! - Header encoding (RFC 2047 Q encoding)
//! - Quoted-printable and Base64 content encoding
//! - Multipart message construction
//! - Attachment and inline part handling
//!
//! The composer never touches the network. Apart from the clock and the
//! random part of Message-ID and boundaries, its output is a pure function
//! of the [`Email`] and [`ComposerConfig`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::local_hostname;
use crate::errors::{SmtpError, SmtpResult};
use crate::types::{Address, Attachment, ContentDisposition, Email};

const MAX_LINE: usize = 76;
const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferEncoding {
    /// 7-bit ASCII (no encoding).
    #[serde(rename = "7bit")]
    SevenBit,
    /// 8-bit data.
    #[serde(rename = "8bit")]
    EightBit,
    /// Raw binary.
    #[serde(rename = "binary")]
    Binary,
    /// Quoted-printable encoding.
    #[default]
    #[serde(rename = "quoted-printable")]
    QuotedPrintable,
    /// Base64 encoding.
    #[serde(rename = "base64")]
    Base64,
    /// Content passed through as given.
    #[serde(rename = "identity")]
    Identity,
}

impl TransferEncoding {
    /// Returns the header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::EightBit => "8bit",
            TransferEncoding::Binary => "binary",
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Base64 => "base64",
            TransferEncoding::Identity => "identity",
        }
    }

    /// Encodes content for the wire.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        match self {
            TransferEncoding::QuotedPrintable => encode_quoted_printable(data).into_bytes(),
            TransferEncoding::Base64 => encode_base64_lines(data),
            _ => data.to_vec(),
        }
    }
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_value())
    }
}

impl FromStr for TransferEncoding {
    type Err = SmtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "7bit" => Ok(TransferEncoding::SevenBit),
            "8bit" => Ok(TransferEncoding::EightBit),
            "binary" => Ok(TransferEncoding::Binary),
            "quoted-printable" => Ok(TransferEncoding::QuotedPrintable),
            "base64" => Ok(TransferEncoding::Base64),
            "identity" => Ok(TransferEncoding::Identity),
            other => Err(SmtpError::configuration(format!(
                "Unknown transfer encoding: {}",
                other
            ))),
        }
    }
}

/// Encodes bytes as quoted-printable.
///
/// Every byte outside 33..=126 and `=` becomes `=XX`, including CR and LF,
/// so any input round-trips. Soft line breaks keep lines at 76 columns or
/// less and never split an escape. A trailing space is escaped.
pub fn encode_quoted_printable(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / 2);
    let mut column = 0;

    for (i, &byte) in data.iter().enumerate() {
        let last = i + 1 == data.len();
        let literal = ((33..=126).contains(&byte) && byte != b'=') || (byte == b' ' && !last);
        let width = if literal { 1 } else { 3 };
        // Leave room for the '=' of a soft break unless nothing follows
        let limit = if last { MAX_LINE } else { MAX_LINE - 1 };

        if column + width > limit {
            out.push_str("=\r\n");
            column = 0;
        }

        if literal {
            out.push(byte as char);
        } else {
            out.push('=');
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0x0f) as usize] as char);
        }
        column += width;
    }

    out
}

/// Encodes bytes as base64 in CRLF-terminated lines of 76 characters.
pub fn encode_base64_lines(data: &[u8]) -> Vec<u8> {
    let encoded = BASE64.encode(data);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / MAX_LINE * 2 + 2);
    for chunk in encoded.as_bytes().chunks(MAX_LINE) {
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn needs_encoding(value: &str) -> bool {
    value
        .bytes()
        .any(|b| (b < b' ' || b > b'~') && b != b'\t')
}

/// Q-encodes a value into RFC 2047 encoded words.
///
/// In a phrase (display name) only alphanumerics and `!*+-/` stay literal.
fn encode_words(value: &str, charset: &str, phrase: bool) -> String {
    let prefix = format!("=?{}?Q?", charset);
    let budget = 75usize.saturating_sub(prefix.len() + 2).max(12);

    let mut words = Vec::new();
    let mut current = String::new();
    let mut buf = [0u8; 4];

    for ch in value.chars() {
        let mut token = String::new();
        for &byte in ch.encode_utf8(&mut buf).as_bytes() {
            let literal = if phrase {
                byte.is_ascii_alphanumeric() || b"!*+-/".contains(&byte)
            } else {
                (33..=126).contains(&byte) && !b"=?_".contains(&byte)
            };
            if byte == b' ' {
                token.push('_');
            } else if literal {
                token.push(byte as char);
            } else {
                token.push('=');
                token.push(HEX[(byte >> 4) as usize] as char);
                token.push(HEX[(byte & 0x0f) as usize] as char);
            }
        }

        // Characters are never split across words
        if !current.is_empty() && current.len() + token.len() > budget {
            words.push(std::mem::take(&mut current));
        }
        current.push_str(&token);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .iter()
        .map(|w| format!("{}{}?=", prefix, w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Encodes unstructured header text (e.g. Subject) if it is not plain ASCII.
pub fn encode_header_text(value: &str, charset: &str) -> String {
    if needs_encoding(value) {
        encode_words(value, charset, false)
    } else {
        value.to_string()
    }
}

/// Formats a mailbox for a header, Q-encoding a non-ASCII display name.
pub fn format_mailbox(address: &Address, charset: &str) -> String {
    match &address.name {
        Some(name) if needs_encoding(name) => {
            format!("{} <{}>", encode_words(name, charset, true), address.email)
        }
        _ => address.to_string(),
    }
}

/// Folds a header line at whitespace so lines stay under 78 characters
/// where possible.
fn fold_header(header: &str) -> String {
    if header.len() <= 78 {
        return header.to_string();
    }

    let mut result = String::new();
    let mut current_line = String::new();

    for word in header.split(' ') {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= MAX_LINE
            || (result.is_empty() && !current_line.contains(' '))
        {
            // The field name always shares a line with the first word
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push_str("\r\n ");
            current_line = word.to_string();
        }
    }

    result.push_str(&current_line);
    result
}

/// Settings that shape composed messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposerConfig {
    /// Host name used in Message-ID.
    pub hostname: String,
    /// Charset declared for text parts and encoded words.
    pub charset: String,
    /// Transfer encoding of text parts.
    pub text_encoding: TransferEncoding,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            hostname: local_hostname(),
            charset: "UTF-8".to_string(),
            text_encoding: TransferEncoding::QuotedPrintable,
        }
    }
}

/// One leaf of the MIME tree.
#[derive(Debug, Clone, PartialEq)]
pub struct MimePart {
    content_type: String,
    charset: Option<String>,
    encoding: TransferEncoding,
    disposition: Option<ContentDisposition>,
    content_id: Option<String>,
    filename: Option<String>,
    content: Vec<u8>,
}

impl MimePart {
    /// Creates a `text/<subtype>` part.
    pub fn text(subtype: &str, body: &str, charset: &str, encoding: TransferEncoding) -> Self {
        Self {
            content_type: format!("text/{}", subtype),
            charset: Some(charset.to_string()),
            encoding,
            disposition: None,
            content_id: None,
            filename: None,
            content: body.as_bytes().to_vec(),
        }
    }

    /// Creates a base64 part for an attachment.
    pub fn attachment(attachment: &Attachment) -> Self {
        Self {
            content_type: attachment.content_type.to_string(),
            charset: None,
            encoding: TransferEncoding::Base64,
            disposition: Some(attachment.disposition),
            content_id: attachment.content_id().map(str::to_string),
            filename: Some(attachment.filename.clone()),
            content: attachment.data.clone(),
        }
    }

    /// Returns the content type without parameters.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Returns the transfer encoding.
    pub fn encoding(&self) -> TransferEncoding {
        self.encoding
    }

    /// Returns the raw (unencoded) content.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    fn headers(&self, charset: &str) -> Vec<(String, String)> {
        let mut headers = Vec::with_capacity(4);
        let filename = self
            .filename
            .as_deref()
            .map(|f| encode_header_text(f, charset));

        let content_type = match (&self.charset, &filename) {
            (Some(cs), _) => format!("{}; charset=\"{}\"", self.content_type, cs),
            (None, Some(name)) => format!("{}; name=\"{}\"", self.content_type, name),
            (None, None) => self.content_type.clone(),
        };
        headers.push(("Content-Type".to_string(), content_type));
        headers.push((
            "Content-Transfer-Encoding".to_string(),
            self.encoding.header_value().to_string(),
        ));

        if let Some(id) = &self.content_id {
            headers.push(("Content-ID".to_string(), format!("<{}>", id)));
        }

        if let Some(disposition) = self.disposition {
            let value = match &filename {
                Some(name) => format!("{}; filename=\"{}\"", disposition, name),
                None => disposition.to_string(),
            };
            headers.push(("Content-Disposition".to_string(), value));
        }

        headers
    }
}

/// Multipart container flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultipartKind {
    Mixed,
    Alternative,
    Related,
}

impl MultipartKind {
    fn subtype(&self) -> &'static str {
        match self {
            MultipartKind::Mixed => "mixed",
            MultipartKind::Alternative => "alternative",
            MultipartKind::Related => "related",
        }
    }
}

#[derive(Debug, Clone)]
enum MimeNode {
    Part(MimePart),
    Multipart {
        kind: MultipartKind,
        boundary: String,
        children: Vec<MimeNode>,
    },
}

impl MimeNode {
    fn headers(&self, charset: &str) -> Vec<(String, String)> {
        match self {
            MimeNode::Part(part) => part.headers(charset),
            MimeNode::Multipart { kind, boundary, .. } => vec![(
                "Content-Type".to_string(),
                format!("multipart/{}; boundary=\"{}\"", kind.subtype(), boundary),
            )],
        }
    }

    fn write_body(&self, out: &mut Vec<u8>, charset: &str) {
        match self {
            MimeNode::Part(part) => {
                let body = part.encoding.encode(&part.content);
                out.extend_from_slice(&body);
                if !body.is_empty() && !body.ends_with(b"\r\n") {
                    out.extend_from_slice(b"\r\n");
                }
            }
            MimeNode::Multipart {
                boundary, children, ..
            } => {
                for child in children {
                    out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
                    for (name, value) in child.headers(charset) {
                        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
                    }
                    out.extend_from_slice(b"\r\n");
                    child.write_body(out, charset);
                }
                out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
            }
        }
    }
}

/// A message ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    content: Vec<u8>,
    message_id: Option<String>,
}

impl ComposedMessage {
    /// Returns the message bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.content
    }

    /// Consumes the message, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.content
    }

    /// Returns the Message-ID header value, unless it was removed.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }
}

/// What gets sent after DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A complete message supplied by the caller, sent as is.
    Raw(Vec<u8>),
    /// A message built by [`Composer`].
    Composed(ComposedMessage),
}

impl Message {
    /// Returns the message bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Raw(bytes) => bytes,
            Message::Composed(message) => message.as_bytes(),
        }
    }

    /// Returns the Message-ID of a composed message.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Message::Raw(_) => None,
            Message::Composed(message) => message.message_id(),
        }
    }
}

/// Builds RFC 5322 messages from [`Email`] descriptions.
#[derive(Debug, Clone, Default)]
pub struct Composer {
    config: ComposerConfig,
}

impl Composer {
    /// Creates a composer.
    pub fn new(config: ComposerConfig) -> Self {
        Self { config }
    }

    /// Returns the composer settings.
    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Composes a message dated now.
    pub fn compose(&self, email: &Email) -> SmtpResult<ComposedMessage> {
        self.compose_at(email, Local::now().fixed_offset())
    }

    /// Composes a message with the given Date.
    pub fn compose_at(
        &self,
        email: &Email,
        date: DateTime<FixedOffset>,
    ) -> SmtpResult<ComposedMessage> {
        let charset = self.config.charset.as_str();
        let mut headers = self.default_headers(email, &date);

        headers.retain(|(name, _)| !email.remove_headers.contains(name));

        for (name, value) in &email.replace_headers {
            match headers.iter_mut().find(|(existing, _)| existing == name) {
                Some(header) => header.1 = value.clone(),
                None => headers.push((name.clone(), value.clone())),
            }
        }

        let message_id = headers
            .iter()
            .find(|(name, _)| name == "Message-ID")
            .map(|(_, value)| value.clone());

        let mut out = Vec::new();
        for (name, value) in &headers {
            if value.contains(['\r', '\n']) {
                return Err(SmtpError::compose(format!(
                    "Header {} contains a line break",
                    name
                )));
            }
            out.extend_from_slice(fold_header(&format!("{}: {}", name, value)).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for line in &email.add_headers {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        match self.body_tree(email, &date) {
            Some(body) => {
                for (name, value) in body.headers(charset) {
                    out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
                }
                out.extend_from_slice(b"\r\n");
                body.write_body(&mut out, charset);
            }
            None => out.extend_from_slice(b"\r\n"),
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            bytes = out.len(),
            message_id = message_id.as_deref().unwrap_or(""),
            "Composed message"
        );

        Ok(ComposedMessage {
            content: out,
            message_id,
        })
    }

    fn default_headers(&self, email: &Email, date: &DateTime<FixedOffset>) -> Vec<(String, String)> {
        let charset = self.config.charset.as_str();
        let mut headers = Vec::with_capacity(8);
        let list = |addresses: &[Address]| {
            addresses
                .iter()
                .map(|a| format_mailbox(a, charset))
                .collect::<Vec<_>>()
                .join(", ")
        };

        if let Some(from) = &email.from {
            headers.push(("From".to_string(), format_mailbox(from, charset)));
        }
        if !email.to.is_empty() {
            headers.push(("To".to_string(), list(email.to.as_slice())));
        }
        if !email.cc.is_empty() {
            headers.push(("Cc".to_string(), list(email.cc.as_slice())));
        }
        if let Some(subject) = &email.subject {
            headers.push(("Subject".to_string(), encode_header_text(subject, charset)));
        }
        headers.push((
            "Date".to_string(),
            date.format("%a, %d %b %Y %H:%M:%S %z").to_string(),
        ));
        headers.push(("Message-ID".to_string(), self.generate_message_id(date)));
        headers.push(("MIME-Version".to_string(), "1.0".to_string()));

        headers
    }

    /// Builds the part tree.
    ///
    /// Inline attachments go into a multipart/related around the HTML body;
    /// without an HTML body they are carried like regular attachments.
    fn body_tree(&self, email: &Email, date: &DateTime<FixedOffset>) -> Option<MimeNode> {
        let charset = self.config.charset.as_str();
        let encoding = self.config.text_encoding;

        let plain = email
            .text
            .as_deref()
            .map(|t| MimeNode::Part(MimePart::text("plain", t, charset, encoding)));

        let mut related = Vec::new();
        let mut attachments = Vec::new();
        for attachment in &email.attachments {
            let node = MimeNode::Part(MimePart::attachment(attachment));
            if attachment.is_inline() && email.html.is_some() {
                related.push(node);
            } else {
                attachments.push(node);
            }
        }

        let html = email.html.as_deref().map(|h| {
            let part = MimeNode::Part(MimePart::text("html", h, charset, encoding));
            if related.is_empty() {
                part
            } else {
                let mut children = vec![part];
                children.append(&mut related);
                self.multipart(MultipartKind::Related, children, date)
            }
        });

        let body = match (plain, html) {
            (Some(plain), Some(html)) => Some(self.multipart(
                MultipartKind::Alternative,
                vec![plain, html],
                date,
            )),
            (plain, html) => plain.or(html),
        };

        if attachments.is_empty() {
            return body;
        }

        let children = body.into_iter().chain(attachments).collect();
        Some(self.multipart(MultipartKind::Mixed, children, date))
    }

    fn multipart(
        &self,
        kind: MultipartKind,
        children: Vec<MimeNode>,
        date: &DateTime<FixedOffset>,
    ) -> MimeNode {
        MimeNode::Multipart {
            kind,
            boundary: self.generate_boundary(date),
            children,
        }
    }

    /// Generates a unique message ID.
    fn generate_message_id(&self, date: &DateTime<FixedOffset>) -> String {
        format!(
            "<{}.{}.{}@{}>",
            date.timestamp(),
            std::process::id(),
            Uuid::new_v4().simple(),
            self.config.hostname
        )
    }

    /// Generates a unique boundary.
    fn generate_boundary(&self, date: &DateTime<FixedOffset>) -> String {
        format!(
            "----=_Part_{}_{}_{}",
            date.timestamp(),
            std::process::id(),
            Uuid::new_v4().simple()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn fixed_date() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 5, 14, 7, 9)
            .unwrap()
    }

    fn composer() -> Composer {
        Composer::new(ComposerConfig {
            hostname: "client.example.org".to_string(),
            ..ComposerConfig::default()
        })
    }

    fn compose(email: &Email) -> String {
        let message = composer().compose_at(email, fixed_date()).unwrap();
        String::from_utf8(message.into_bytes()).unwrap()
    }

    fn header_names(message: &str) -> Vec<String> {
        message
            .split("\r\n\r\n")
            .next()
            .unwrap()
            .split("\r\n")
            .filter(|l| !l.starts_with(' '))
            .map(|l| l.split(':').next().unwrap().to_string())
            .collect()
    }

    fn boundaries(message: &str) -> Vec<String> {
        message
            .split("boundary=\"")
            .skip(1)
            .map(|rest| rest.split('"').next().unwrap().to_string())
            .collect()
    }

    fn base() -> crate::types::EmailBuilder {
        Email::builder()
            .from("Sender <sender@example.com>")
            .unwrap()
            .to("recipient@example.com")
            .unwrap()
            .subject("Test Subject")
    }

    #[test]
    fn test_plain_only_is_single_part() {
        let message = compose(&base().body_plain("Hello World!").build().unwrap());

        assert_eq!(
            header_names(&message),
            vec![
                "From",
                "To",
                "Subject",
                "Date",
                "Message-ID",
                "MIME-Version",
                "Content-Type",
                "Content-Transfer-Encoding"
            ]
        );
        assert!(message.starts_with("From: Sender <sender@example.com>\r\n"));
        assert!(message.contains("Date: Tue, 05 Mar 2024 14:07:09 +0200\r\n"));
        assert!(message.contains("MIME-Version: 1.0\r\n"));
        assert!(message.contains("Content-Type: text/plain; charset=\"UTF-8\"\r\n"));
        assert!(message.contains("Content-Transfer-Encoding: quoted-printable\r\n"));
        assert!(message.ends_with("\r\n\r\nHello World!\r\n"));
        assert!(!message.contains("boundary"));
    }

    #[test]
    fn test_plain_and_html_is_alternative() {
        let message = compose(
            &base()
                .body_plain("plain text")
                .body_html("<p>html</p>")
                .build()
                .unwrap(),
        );

        assert!(message.contains("Content-Type: multipart/alternative; boundary="));
        let b = &boundaries(&message)[0];
        let parts: Vec<&str> = message.split(&format!("--{}\r\n", b)).collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].starts_with("Content-Type: text/plain"));
        assert!(parts[2].starts_with("Content-Type: text/html"));
        assert!(message.ends_with(&format!("--{}--\r\n", b)));
    }

    #[test]
    fn test_plain_with_attachment_is_mixed() {
        let attachment = Attachment::new("/data/report.pdf", b"%PDF-1.4".to_vec()).unwrap();
        let message = compose(&base().body_plain("See attached").attachment(attachment).build().unwrap());

        assert!(message.contains("Content-Type: multipart/mixed; boundary="));
        assert!(message.contains("Content-Type: application/pdf; name=\"report.pdf\"\r\n"));
        assert!(message.contains("Content-Transfer-Encoding: base64\r\n"));
        assert!(message.contains("Content-Disposition: attachment; filename=\"report.pdf\"\r\n"));
        assert!(message.contains(&format!("\r\n\r\n{}\r\n", BASE64.encode(b"%PDF-1.4"))));
        assert!(!message.contains("/data/"));
    }

    #[test]
    fn test_both_bodies_with_attachment_nests_alternative() {
        let message = compose(
            &base()
                .body_plain("plain")
                .body_html("<b>html</b>")
                .attachment(Attachment::new("a.txt", b"x".to_vec()).unwrap())
                .build()
                .unwrap(),
        );

        let mixed = message.find("multipart/mixed").unwrap();
        let alternative = message.find("multipart/alternative").unwrap();
        let attachment = message.find("name=\"a.txt\"").unwrap();
        assert!(mixed < alternative && alternative < attachment);
        assert_eq!(boundaries(&message).len(), 2);
    }

    #[test]
    fn test_inline_attachments_wrap_html_in_related() {
        let logo = Attachment::new("img/logo.png", vec![0x89, b'P', b'N', b'G']).unwrap();
        let message = compose(
            &base()
                .body_html("<img src=\"cid:logo.png\">")
                .inline(logo)
                .build()
                .unwrap(),
        );

        assert!(message.contains("Content-Type: multipart/related; boundary="));
        assert!(message.contains("Content-ID: <logo.png>\r\n"));
        assert!(message.contains("Content-Disposition: inline; filename=\"logo.png\"\r\n"));
        assert!(!message.contains("multipart/mixed"));
        let html = message.find("text/html").unwrap();
        let image = message.find("image/png").unwrap();
        assert!(html < image);
    }

    #[test]
    fn test_inline_without_html_goes_to_mixed() {
        let message = compose(
            &base()
                .body_plain("no html")
                .inline(Attachment::new("logo.png", vec![1]).unwrap())
                .build()
                .unwrap(),
        );
        assert!(message.contains("multipart/mixed"));
        assert!(!message.contains("multipart/related"));
        assert!(message.contains("Content-ID: <logo.png>"));
    }

    #[test]
    fn test_bcc_is_not_written() {
        let message = compose(
            &base()
                .cc("Carol <carol@example.com>")
                .unwrap()
                .bcc("hidden@example.com")
                .unwrap()
                .body_plain("x")
                .build()
                .unwrap(),
        );
        assert!(message.contains("Cc: Carol <carol@example.com>\r\n"));
        assert!(!message.contains("hidden@example.com"));
    }

    #[test]
    fn test_header_edit_order() {
        let email = base()
            .body_plain("x")
            .remove_header("Date")
            .remove_header("to")
            .replace_header("Subject", "Replaced")
            .replace_header("X-Priority", "1")
            .add_header("X-Mailer: smtp-cli")
            .add_header("X-Mailer: again")
            .build()
            .unwrap();
        let message = compose(&email);

        assert_eq!(
            header_names(&message),
            vec![
                "From",
                "To",
                "Subject",
                "Message-ID",
                "MIME-Version",
                "X-Priority",
                "X-Mailer",
                "X-Mailer",
                "Content-Type",
                "Content-Transfer-Encoding"
            ]
        );
        assert!(message.contains("Subject: Replaced\r\n"));
        assert_eq!(message.matches("Subject:").count(), 1);
        assert!(message.contains("X-Mailer: smtp-cli\r\nX-Mailer: again\r\n"));
    }

    #[test]
    fn test_removed_message_id() {
        let email = base().body_plain("x").remove_header("Message-ID").build().unwrap();
        let composed = composer().compose_at(&email, fixed_date()).unwrap();
        assert!(composed.message_id().is_none());

        let email = base().body_plain("x").build().unwrap();
        let composed = composer().compose_at(&email, fixed_date()).unwrap();
        let id = composed.message_id().unwrap();
        assert!(id.starts_with(&format!("<{}.", fixed_date().timestamp())));
        assert!(id.ends_with("@client.example.org>"));
    }

    #[test]
    fn test_non_ascii_subject_and_name_are_q_encoded() {
        let email = Email::builder()
            .from("Jürgen Müller <j@example.com>")
            .unwrap()
            .to("a@example.com")
            .unwrap()
            .subject("Grüße")
            .body_plain("x")
            .build()
            .unwrap();
        let message = compose(&email);

        assert!(message.contains("Subject: =?UTF-8?Q?Gr=C3=BC=C3=9Fe?=\r\n"));
        assert!(message.contains("From: =?UTF-8?Q?J=C3=BCrgen_M=C3=BCller?= <j@example.com>\r\n"));
    }

    #[test]
    fn test_long_subject_uses_several_words() {
        let subject = "ü".repeat(40);
        let encoded = encode_header_text(&subject, "UTF-8");
        let words: Vec<&str> = encoded.split(' ').collect();
        assert!(words.len() > 1);
        for word in words {
            assert!(word.len() <= 75);
            assert!(word.starts_with("=?UTF-8?Q?") && word.ends_with("?="));
            // An escape is never split
            assert_eq!(word.matches("=C3=BC").count() * 6 + 12, word.len());
        }
    }

    #[test]
    fn test_ascii_subject_passes_through() {
        assert_eq!(encode_header_text("Hello = world?", "UTF-8"), "Hello = world?");
    }

    #[test]
    fn test_empty_message() {
        let email = Email::builder().to("a@example.com").unwrap().build().unwrap();
        let message = compose(&email);
        assert!(message.starts_with("To: a@example.com\r\n"));
        assert!(message.ends_with("MIME-Version: 1.0\r\n\r\n"));
        assert!(!message.contains("Content-Type"));
    }

    #[test]
    fn test_base64_text_encoding() {
        let composer = Composer::new(ComposerConfig {
            hostname: "h".to_string(),
            charset: "ISO-8859-1".to_string(),
            text_encoding: TransferEncoding::Base64,
        });
        let email = base().body_plain("hello").build().unwrap();
        let message = String::from_utf8(
            composer.compose_at(&email, fixed_date()).unwrap().into_bytes(),
        )
        .unwrap();

        assert!(message.contains("Content-Type: text/plain; charset=\"ISO-8859-1\"\r\n"));
        assert!(message.contains("Content-Transfer-Encoding: base64\r\n"));
        assert!(message.ends_with("\r\n\r\naGVsbG8=\r\n"));
    }

    #[test]
    fn test_output_stable_apart_from_ids_and_date() {
        let email = base()
            .body_plain("plain")
            .body_html("<i>html</i>")
            .attachment(Attachment::new("a.zip", vec![0, 1, 2, 3]).unwrap())
            .build()
            .unwrap();

        let normalize = |message: ComposedMessage| {
            let id = message.message_id().unwrap().to_string();
            let mut text = String::from_utf8(message.into_bytes()).unwrap();
            text = text.replace(&id, "<ID>");
            for (i, b) in boundaries(&text).iter().enumerate() {
                text = text.replace(b.as_str(), &format!("B{}", i));
            }
            text
        };

        let first = normalize(composer().compose_at(&email, fixed_date()).unwrap());
        let second = normalize(composer().compose_at(&email, fixed_date()).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_boundaries_are_unique() {
        let composer = composer();
        let date = fixed_date();
        let a = composer.generate_boundary(&date);
        let b = composer.generate_boundary(&date);
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("----=_Part_{}_{}_", date.timestamp(), std::process::id())));
    }

    #[rstest]
    #[case(b"Hello World!".as_slice())]
    #[case(b"a=b\r\nline two\r\n".as_slice())]
    #[case(b"trailing space ".as_slice())]
    #[case("Grüße aus Köln, ünïcödé everywhere. Grüße aus Köln, ünïcödé everywhere. Grüße aus Köln! ".as_bytes())]
    #[case(&[0u8, 255, 61, 13, 10, 9, 32, 46])]
    fn test_quoted_printable_round_trip(#[case] input: &[u8]) {
        let encoded = encode_quoted_printable(input);

        for line in encoded.split("\r\n") {
            assert!(line.len() <= 76, "line too long: {:?}", line);
        }
        assert!(!encoded.ends_with(' '));

        let decoded =
            quoted_printable::decode(encoded.as_bytes(), quoted_printable::ParseMode::Strict)
                .unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_quoted_printable_round_trip_all_bytes() {
        let input: Vec<u8> = (0..=255u8).cycle().take(2048).collect();
        let encoded = encode_quoted_printable(&input);
        let decoded =
            quoted_printable::decode(encoded.as_bytes(), quoted_printable::ParseMode::Strict)
                .unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_quoted_printable_escapes() {
        assert_eq!(encode_quoted_printable(b"a=b"), "a=3Db");
        assert_eq!(encode_quoted_printable(b"\r\n"), "=0D=0A");
        assert_eq!(encode_quoted_printable("é".as_bytes()), "=C3=A9");

        // Escapes near the line limit move to the next line whole
        let input = [b"x".repeat(74), vec![0xff]].concat();
        let encoded = encode_quoted_printable(&input);
        assert_eq!(encoded, format!("{}=\r\n=FF", "x".repeat(74)));
    }

    #[test]
    fn test_base64_lines() {
        let data = vec![0xabu8; 200];
        let encoded = String::from_utf8(encode_base64_lines(&data)).unwrap();
        let lines: Vec<&str> = encoded.trim_end().split("\r\n").collect();
        assert!(lines[..lines.len() - 1].iter().all(|l| l.len() == 76));
        assert!(encoded.ends_with("\r\n"));
        assert_eq!(BASE64.decode(lines.concat()).unwrap(), data);
    }

    #[rstest]
    #[case("7bit", TransferEncoding::SevenBit)]
    #[case("8BIT", TransferEncoding::EightBit)]
    #[case("binary", TransferEncoding::Binary)]
    #[case("Quoted-Printable", TransferEncoding::QuotedPrintable)]
    #[case("base64", TransferEncoding::Base64)]
    #[case("identity", TransferEncoding::Identity)]
    fn test_transfer_encoding_from_str(#[case] input: &str, #[case] expected: TransferEncoding) {
        assert_eq!(input.parse::<TransferEncoding>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_transfer_encoding() {
        assert!("uuencode".parse::<TransferEncoding>().is_err());
    }

    #[test]
    fn test_fold_long_header() {
        let value = vec!["someone@example.com"; 8].join(", ");
        let folded = fold_header(&format!("To: {}", value));
        assert!(folded.contains("\r\n "));
        assert!(folded.split("\r\n").all(|l| l.len() <= 78));
    }
}
