//! Error types for the pooled SMTP sender.
//!
//! Errors carry a kind from the pool's failure taxonomy plus, when the
//! server produced one, the SMTP reply code and RFC 2034 enhanced status
//! code. Errors are delivered per submission and never retried.

use std::fmt;
use thiserror::Error;

/// Result type for pool operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Failure categories surfaced by the pool and its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    /// Transport failure before login (TCP, DNS, greeting).
    Connect,
    /// TCP connect did not complete within `connection_timeout`.
    ConnectTimeout,
    /// Server banner did not arrive within `greeting_timeout`.
    GreetingTimeout,
    /// Socket inactivity exceeded `socket_timeout`.
    SocketTimeout,
    /// TLS negotiation or certificate failure.
    Tls,
    /// Login failed or the server rejected the SASL exchange.
    Auth,
    /// Malformed or unexpected server response.
    Protocol,
    /// MAIL, RCPT or DATA rejection, or a mid-DATA failure.
    Send,
    /// The server closed the connection mid-operation.
    ConnectionClosed,
    /// The submission was still queued when the pool closed.
    PoolClosed,
    /// Invalid options.
    Config,
}

impl SmtpErrorKind {
    /// Returns true for kinds that occur before authentication completes.
    pub fn is_connect_phase(&self) -> bool {
        matches!(
            self,
            SmtpErrorKind::Connect
                | SmtpErrorKind::ConnectTimeout
                | SmtpErrorKind::GreetingTimeout
                | SmtpErrorKind::Tls
                | SmtpErrorKind::Auth
        )
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::Connect => write!(f, "Connection failed"),
            SmtpErrorKind::ConnectTimeout => write!(f, "Connection timed out"),
            SmtpErrorKind::GreetingTimeout => write!(f, "Greeting timed out"),
            SmtpErrorKind::SocketTimeout => write!(f, "Socket timed out"),
            SmtpErrorKind::Tls => write!(f, "TLS failure"),
            SmtpErrorKind::Auth => write!(f, "Authentication failed"),
            SmtpErrorKind::Protocol => write!(f, "Protocol error"),
            SmtpErrorKind::Send => write!(f, "Message rejected"),
            SmtpErrorKind::ConnectionClosed => write!(f, "Connection closed"),
            SmtpErrorKind::PoolClosed => write!(f, "Pool closed"),
            SmtpErrorKind::Config => write!(f, "Invalid configuration"),
        }
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (1=addressing, 2=mailbox, 3=mail system, ...).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code from a string such as `"5.1.1"`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            class,
            subject,
            detail,
        })
    }

    /// Returns true for permanent failures (5.x.x).
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }

    /// Returns true for temporary failures (4.x.x).
    pub fn is_temporary(&self) -> bool {
        self.class == 4
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Pool error with failure kind and server detail.
#[derive(Error, Debug)]
#[error("{}", render(.kind, .message, .smtp_code, .enhanced_code))]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Attaches the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Attaches the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Attaches the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if the server produced one.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if the server produced one.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Creates a pre-login transport error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Connect, message)
    }

    /// Creates an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Auth, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Tls, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Protocol, message)
    }

    /// Creates a send rejection error.
    pub fn send(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Send, message)
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Config, message)
    }

    /// Creates the error delivered to submissions drained by `close()`.
    pub fn pool_closed() -> Self {
        Self::new(
            SmtpErrorKind::PoolClosed,
            "Connection pool was closed before the message could be sent",
        )
    }

    /// Creates the error for a connection that ended unexpectedly.
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionClosed, message)
    }

    /// Maps a server reply to an error, classifying by reply code.
    ///
    /// `in_transaction` selects the `Send` kind for rejections during
    /// MAIL/RCPT/DATA; outside a transaction the same codes are
    /// protocol-level failures.
    pub fn from_reply(code: u16, message: impl Into<String>, in_transaction: bool) -> Self {
        let kind = match code {
            530 | 534 | 535 | 538 => SmtpErrorKind::Auth,
            _ if in_transaction => SmtpErrorKind::Send,
            421 => SmtpErrorKind::ConnectionClosed,
            _ => SmtpErrorKind::Protocol,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

fn render(
    kind: &SmtpErrorKind,
    message: &str,
    smtp_code: &Option<u16>,
    enhanced_code: &Option<EnhancedStatusCode>,
) -> String {
    let mut out = format!("{}: {}", kind, message);
    if let Some(code) = smtp_code {
        out.push_str(&format!(" (SMTP {})", code));
    }
    if let Some(enhanced) = enhanced_code {
        out.push_str(&format!(" [{}]", enhanced));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, 5);
        assert_eq!(code.subject, 1);
        assert_eq!(code.detail, 1);
        assert!(code.is_permanent());
        assert!(!code.is_temporary());

        assert!(EnhancedStatusCode::parse("5.1").is_none());
        assert!(EnhancedStatusCode::parse("5.1.1.1").is_none());
        assert!(EnhancedStatusCode::parse("x.y.z").is_none());
    }

    #[test]
    fn reply_classification() {
        let err = SmtpError::from_reply(535, "Authentication credentials invalid", false);
        assert_eq!(err.kind(), SmtpErrorKind::Auth);
        assert_eq!(err.smtp_code(), Some(535));

        let err = SmtpError::from_reply(550, "Mailbox unavailable", true);
        assert_eq!(err.kind(), SmtpErrorKind::Send);

        let err = SmtpError::from_reply(421, "Service not available", false);
        assert_eq!(err.kind(), SmtpErrorKind::ConnectionClosed);
    }

    #[test]
    fn display_includes_codes() {
        let err = SmtpError::send("Recipient rejected")
            .with_smtp_code(550)
            .with_enhanced_code(EnhancedStatusCode::parse("5.1.1").unwrap());
        let text = err.to_string();
        assert!(text.contains("SMTP 550"));
        assert!(text.contains("5.1.1"));
    }

    #[test]
    fn connect_phase_kinds() {
        assert!(SmtpErrorKind::Auth.is_connect_phase());
        assert!(SmtpErrorKind::Tls.is_connect_phase());
        assert!(!SmtpErrorKind::Send.is_connect_phase());
        assert!(!SmtpErrorKind::PoolClosed.is_connect_phase());
    }
}
