//! Mail-facing types: envelopes, the mail collaborator contract, and the
//! success payload handed back to senders.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::AsyncRead;

use crate::errors::{SmtpError, SmtpResult};

/// SMTP envelope: reverse-path and forward-paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// MAIL FROM address; empty reverse-path when `None`.
    pub from: Option<String>,
    /// RCPT TO addresses.
    pub to: Vec<String>,
}

impl Envelope {
    /// Creates an envelope.
    pub fn new(from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            from: Some(from.into()),
            to,
        }
    }

    /// Validates that the envelope can drive a transaction.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.to.is_empty() {
            return Err(SmtpError::send("Envelope has no recipients"));
        }
        Ok(())
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.from.as_deref().unwrap_or("<>"),
            self.to.join(", ")
        )
    }
}

/// Byte stream carrying a mail body.
pub type BodyStream = Box<dyn AsyncRead + Send + Unpin>;

/// Contract for the mail being submitted.
///
/// The pool treats the mail as opaque: it needs the effective envelope,
/// the raw `Message-ID` header for the success payload, and a body byte
/// stream. Line-ending normalization and dot-stuffing happen downstream
/// in the connection, so the stream may use bare LF line breaks.
pub trait MailSource: Send + 'static {
    /// Returns the effective envelope (an explicit override, or one
    /// derived from the message headers).
    fn envelope(&self) -> SmtpResult<Envelope>;

    /// Returns the raw `Message-ID` header value, if any.
    fn message_id(&self) -> Option<String>;

    /// Takes the body stream. Called exactly once per submission.
    fn body(&mut self) -> SmtpResult<BodyStream>;
}

/// Strips `<`, `>` and whitespace from a raw `Message-ID` header value.
pub fn normalize_message_id(raw: Option<&str>) -> String {
    raw.map(|value| {
        value
            .chars()
            .filter(|c| !matches!(c, '<' | '>') && !c.is_whitespace())
            .collect()
    })
    .unwrap_or_default()
}

/// Success payload for a completed submission.
#[derive(Debug, Clone)]
pub struct SendInfo {
    /// The envelope the message was sent with.
    pub envelope: Envelope,
    /// Normalized message id; empty when the mail carried no header.
    pub message_id: String,
    /// The server's final DATA-accept reply line.
    pub response: String,
}

/// A simple in-memory mail, sufficient for most senders and for tests.
pub struct Mail {
    envelope: Envelope,
    message_id: Option<String>,
    body: Option<Vec<u8>>,
}

impl Mail {
    /// Creates a mail from an envelope and body bytes.
    pub fn new(envelope: Envelope, body: impl Into<Vec<u8>>) -> Self {
        Self {
            envelope,
            message_id: None,
            body: Some(body.into()),
        }
    }

    /// Sets the raw `Message-ID` header value.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

impl MailSource for Mail {
    fn envelope(&self) -> SmtpResult<Envelope> {
        self.envelope.validate()?;
        Ok(self.envelope.clone())
    }

    fn message_id(&self) -> Option<String> {
        self.message_id.clone()
    }

    fn body(&mut self) -> SmtpResult<BodyStream> {
        let body = self
            .body
            .take()
            .ok_or_else(|| SmtpError::send("Mail body was already consumed"))?;
        Ok(Box::new(std::io::Cursor::new(body)))
    }
}

/// Snapshot of the pool's occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStatus {
    /// Live resources.
    pub connections: usize,
    /// Resources currently eligible for a new submission.
    pub available: usize,
    /// Submissions waiting in the queue.
    pub queued: usize,
    /// Upper bound on concurrent resources.
    pub max_connections: usize,
}
