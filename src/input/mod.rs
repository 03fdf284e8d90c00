//! Reading message content from files and standard input.

use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::types::{split_attachment_spec, Attachment};

/// Reads a whole file, or standard input when `source` is `-`.
pub async fn read_source(source: &str) -> SmtpResult<Vec<u8>> {
    if source == "-" {
        let mut data = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut data)
            .await
            .map_err(|e| SmtpError::configuration("Cannot read standard input").with_cause(e))?;
        return Ok(data);
    }

    tokio::fs::read(source)
        .await
        .map_err(|e| SmtpError::configuration(format!("Cannot read {}", source)).with_cause(e))
}

/// Resolves a body argument: the contents of `input` if it names an
/// existing file, otherwise `input` itself.
pub async fn body_content(input: &str) -> SmtpResult<String> {
    let is_file = !input.is_empty()
        && tokio::fs::metadata(Path::new(input))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);

    if !is_file {
        return Ok(input.to_string());
    }

    let data = read_source(input).await?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Loads an attachment given as `path[@type/subtype]`.
///
/// An unreadable file is a [`SmtpErrorKind::Compose`] error.
pub async fn read_attachment(spec: &str, inline: bool) -> SmtpResult<Attachment> {
    let (path, content_type) = split_attachment_spec(spec);
    let data = read_source(path)
        .await
        .map_err(|e| e.into_kind(SmtpErrorKind::Compose))?;

    let attachment = match content_type {
        Some(content_type) => Attachment::with_content_type(path, content_type, data)?,
        None => Attachment::new(path, data)?,
    };

    Ok(if inline { attachment.inline() } else { attachment })
}
