//! SMTP protocol primitives.
//!
//! Commands, reply parsing (RFC 5321, multiline and RFC 2034 enhanced
//! codes), EHLO capability extraction, and the streaming DATA encoder.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpResult};

/// Well-known reply codes.
pub mod codes {
    /// Service ready (greeting).
    pub const SERVICE_READY: u16 = 220;
    /// Service closing transmission channel.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Requested action completed.
    pub const OK: u16 = 250;
    /// Authentication succeeded.
    pub const AUTH_SUCCESS: u16 = 235;
    /// Server challenge, continue the SASL exchange.
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}

/// Client-side SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO fallback.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Begin or continue authentication.
    Auth {
        /// Mechanism name (PLAIN, LOGIN, XOAUTH2).
        mechanism: String,
        /// Optional initial response.
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Reverse-path, without angle brackets.
        address: String,
    },
    /// RCPT TO command.
    RcptTo {
        /// Forward-path, without angle brackets.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset the current transaction.
    Rset,
    /// Quit the session.
    Quit,
}

impl SmtpCommand {
    /// Formats the command line, without the trailing CRLF.
    pub fn to_wire(&self) -> String {
        match self {
            SmtpCommand::Ehlo(name) => format!("EHLO {}", name),
            SmtpCommand::Helo(name) => format!("HELO {}", name),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(resp) => format!("AUTH {} {}", mechanism, resp),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::MailFrom { address } => format!("MAIL FROM:<{}>", address),
            SmtpCommand::RcptTo { address } => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns a loggable form with credentials elided.
    pub fn to_redacted(&self) -> String {
        match self {
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {} ****", mechanism),
            other => other.to_wire(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_redacted())
    }
}

/// A parsed server reply.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Reply code (e.g. 250, 354, 550).
    pub code: u16,
    /// Enhanced status code, when present on the first line.
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Reply text, one entry per line.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
        }
    }

    /// Parses a complete reply from its raw lines.
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("Empty server response"));
        }

        let mut message = Vec::with_capacity(lines.len());
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            if line.len() < 3 {
                return Err(SmtpError::protocol(format!("Response too short: {:?}", line)));
            }

            let parsed: u16 = line[..3]
                .parse()
                .map_err(|_| SmtpError::protocol(format!("Invalid reply code: {:?}", line)))?;

            if i == 0 {
                code = parsed;
            } else if parsed != code {
                return Err(SmtpError::protocol(
                    "Inconsistent reply codes in multiline response",
                ));
            }

            let text = if line.len() > 4 { &line[4..] } else { "" };
            if i == 0 {
                if let Some((esc, rest)) = Self::split_enhanced_code(text) {
                    enhanced_code = Some(esc);
                    message.push(rest.trim().to_string());
                    continue;
                }
            }
            message.push(text.to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            message,
        })
    }

    fn split_enhanced_code(text: &str) -> Option<(EnhancedStatusCode, &str)> {
        let mut parts = text.splitn(2, ' ');
        let code = EnhancedStatusCode::parse(parts.next()?)?;
        Some((code, parts.next().unwrap_or("")))
    }

    /// Returns true for 2xx replies.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first reply line.
    pub fn first_line(&self) -> &str {
        self.message.first().map(String::as_str).unwrap_or("")
    }

    /// Returns all reply lines joined with newlines.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts a non-success reply into an error.
    pub fn to_error(&self, in_transaction: bool) -> SmtpError {
        let mut err = SmtpError::from_reply(self.code, self.full_message(), in_transaction);
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_line())
    }
}

/// Capabilities advertised in the EHLO reply.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// STARTTLS offered.
    pub starttls: bool,
    /// 8BITMIME offered.
    pub eight_bit_mime: bool,
    /// PIPELINING offered.
    pub pipelining: bool,
    /// SIZE limit, when advertised with a value.
    pub size: Option<usize>,
    /// Advertised AUTH mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
}

impl EsmtpCapabilities {
    /// Extracts capabilities from an EHLO reply.
    pub fn from_ehlo(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        // First line is the server greeting; the rest are keywords.
        for line in response.message.iter().skip(1) {
            let mut tokens = line.split_whitespace();
            let keyword = match tokens.next() {
                Some(k) => k.to_uppercase(),
                None => continue,
            };

            match keyword.as_str() {
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "PIPELINING" => caps.pipelining = true,
                "SIZE" => caps.size = tokens.next().and_then(|v| v.parse().ok()),
                "AUTH" => {
                    for token in tokens {
                        if let Some(method) = AuthMethod::from_capability(token) {
                            caps.auth_mechanisms.insert(method);
                        }
                    }
                }
                _ => {}
            }
        }

        caps
    }
}

/// Streaming encoder for the DATA phase.
///
/// Normalizes bare LF and bare CR to CRLF, doubles dots at line starts,
/// and terminates the stream with `CRLF . CRLF`. Stateful so bodies can be
/// pushed chunk by chunk with line breaks split across chunk boundaries.
#[derive(Debug, Default)]
pub struct DataEncoder {
    at_line_start: bool,
    pending_cr: bool,
    ends_with_break: bool,
    finished: bool,
}

impl DataEncoder {
    /// Creates a new encoder.
    pub fn new() -> Self {
        Self {
            at_line_start: true,
            pending_cr: false,
            ends_with_break: false,
            finished: false,
        }
    }

    /// Encodes one chunk of body bytes into `out`.
    pub fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        debug_assert!(!self.finished);
        out.reserve(input.len() + input.len() / 16);

        for &byte in input {
            match byte {
                b'\n' => {
                    // LF, or the LF half of CRLF; either way emit CRLF once.
                    self.pending_cr = false;
                    out.extend_from_slice(b"\r\n");
                    self.at_line_start = true;
                    self.ends_with_break = true;
                }
                b'\r' => {
                    if self.pending_cr {
                        // The previous CR had no LF; it was a line break.
                        out.extend_from_slice(b"\r\n");
                        self.at_line_start = true;
                        self.ends_with_break = true;
                    }
                    self.pending_cr = true;
                }
                _ => {
                    if self.pending_cr {
                        out.extend_from_slice(b"\r\n");
                        self.pending_cr = false;
                        self.at_line_start = true;
                        self.ends_with_break = true;
                    }
                    if self.at_line_start && byte == b'.' {
                        out.push(b'.');
                    }
                    out.push(byte);
                    self.at_line_start = false;
                    self.ends_with_break = false;
                }
            }
        }
    }

    /// Flushes pending state and appends the `CRLF . CRLF` terminator.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        debug_assert!(!self.finished);
        self.finished = true;

        if self.pending_cr {
            out.extend_from_slice(b"\r\n");
            self.pending_cr = false;
            self.ends_with_break = true;
        }
        if !self.ends_with_break {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");
    }
}
