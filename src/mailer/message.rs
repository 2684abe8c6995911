//! Message composition
//!
//! Builds a multipart message: a plain-text body followed by one part per
//! attachment, typed from the file extension.

use crate::config::{MailConfig, Sensitivity};
use crate::error::{MailError, Result};
use lettre::Message;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use std::path::{Path, PathBuf};

/// A notification to send
#[derive(Debug, Clone, Default)]
pub struct MailMessage {
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub body: String,
    /// Files attached after the body
    pub attachments: Vec<PathBuf>,
}

impl MailMessage {
    /// Message with a subject and body
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    /// Add an attachment
    pub fn attach(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }
}

/// `Sensitivity` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensitivityHeader(pub String);

impl Header for SensitivityHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Sensitivity")
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

impl From<Sensitivity> for SensitivityHeader {
    fn from(value: Sensitivity) -> Self {
        Self(value.as_header().to_string())
    }
}

/// MIME type for an attachment, from its extension
pub fn content_type_for(path: &Path) -> ContentType {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "txt" | "log" | "csv" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    };
    ContentType::parse(mime).unwrap_or(ContentType::TEXT_PLAIN)
}

fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse::<Mailbox>()
        .map_err(|e| MailError::Compose(format!("bad address '{address}': {e}")).into())
}

/// Build the message for `config`'s recipients
///
/// `default_from` is used when the configuration names no sender.
pub fn build_message(config: &MailConfig, message: &MailMessage, default_from: &str) -> Result<Message> {
    let from = config.from.as_deref().unwrap_or(default_from);
    let mut builder = Message::builder().from(mailbox(from)?).subject(message.subject.clone());
    for address in &config.to {
        builder = builder.to(mailbox(address)?);
    }
    for address in &config.cc {
        builder = builder.cc(mailbox(address)?);
    }
    for address in &config.bcc {
        builder = builder.bcc(mailbox(address)?);
    }
    if let Some(sensitivity) = config.sensitivity {
        builder = builder.header(SensitivityHeader::from(sensitivity));
    }

    let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(message.body.clone()));
    for path in &message.attachments {
        let content = std::fs::read(path)
            .map_err(|e| MailError::Compose(format!("cannot attach {}: {e}", path.display())))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        parts = parts.singlepart(Attachment::new(filename).body(content, content_type_for(path)));
    }

    builder
        .multipart(parts)
        .map_err(|e| MailError::Compose(e.to_string()).into())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn config() -> MailConfig {
        MailConfig {
            to: vec!["ops@example.com".into()],
            cc: vec!["lead@example.com".into()],
            ..Default::default()
        }
    }

    #[test]
    fn message_has_recipients_subject_and_body() {
        let email = build_message(
            &config(),
            &MailMessage::new("nightly: FAILURE", "tile h12v04 failed"),
            "nightly@batch.example.com",
        )
        .unwrap();
        let text = String::from_utf8(email.formatted()).unwrap();
        assert!(text.contains("From: nightly@batch.example.com"));
        assert!(text.contains("To: ops@example.com"));
        assert!(text.contains("Cc: lead@example.com"));
        assert!(text.contains("Subject: nightly: FAILURE"));
        assert!(text.contains("tile h12v04 failed"));
        assert!(!text.contains("Sensitivity"));
        assert_eq!(email.envelope().to().len(), 2);
    }

    #[test]
    fn sensitivity_header_is_added() {
        let mut config = config();
        config.sensitivity = Some(Sensitivity::Confidential);
        let email = build_message(&config, &MailMessage::new("s", "b"), "a@b.c").unwrap();
        let text = String::from_utf8(email.formatted()).unwrap();
        assert!(text.contains("Sensitivity: Company-Confidential"));
    }

    #[test]
    fn attachments_are_typed_by_extension() {
        let temp = tempfile::tempdir().unwrap();
        let log = temp.path().join("20240102_030405.txt");
        let chart = temp.path().join("chart.png");
        std::fs::write(&log, "error details").unwrap();
        std::fs::write(&chart, [0x89, b'P', b'N', b'G']).unwrap();

        let message = MailMessage::new("s", "b").attach(&log).attach(&chart);
        let email = build_message(&config(), &message, "a@b.c").unwrap();
        let text = String::from_utf8(email.formatted()).unwrap();
        assert!(text.contains("20240102_030405.txt"));
        assert!(text.contains("image/png"));
        assert!(text.contains("multipart/mixed"));
    }

    #[test]
    fn bad_address_and_missing_attachment_are_compose_errors() {
        let mut bad = config();
        bad.to = vec!["not an address".into()];
        let err = build_message(&bad, &MailMessage::new("s", "b"), "a@b.c").unwrap_err();
        assert!(matches!(err, Error::Mail(MailError::Compose(_))));

        let message = MailMessage::new("s", "b").attach("/definitely/missing.txt");
        let err = build_message(&config(), &message, "a@b.c").unwrap_err();
        assert!(matches!(err, Error::Mail(MailError::Compose(_))));
    }

    #[test]
    fn unknown_extension_is_octet_stream() {
        assert_eq!(
            content_type_for(Path::new("x.bin")),
            ContentType::parse("application/octet-stream").unwrap()
        );
        assert_eq!(content_type_for(Path::new("X.JPG")), ContentType::parse("image/jpeg").unwrap());
    }
}
