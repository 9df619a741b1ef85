//! SMTP authentication.
//!
//! Supports the mechanisms the pool negotiates:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely deployed)
//! - XOAUTH2 (Google/Microsoft OAuth bearer)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SmtpError, SmtpResult};

/// Authentication mechanisms supported by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication.
    Login,
    /// Google/Microsoft XOAUTH2.
    XOAuth2,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::XOAuth2 => "XOAUTH2",
        }
    }

    /// Parses a mechanism from an EHLO capability token.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "XOAUTH2" => Some(AuthMethod::XOAuth2),
            _ => None,
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::XOAuth2 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Login credentials.
#[derive(Clone)]
pub enum Credentials {
    /// Username and password.
    Plain {
        /// Account name.
        user: String,
        /// Account password.
        pass: SecretString,
    },
    /// Username and OAuth2 access token.
    XOAuth2 {
        /// Account name.
        user: String,
        /// OAuth2 bearer token.
        access_token: SecretString,
    },
}

impl Credentials {
    /// Creates username/password credentials.
    pub fn plain(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self::Plain {
            user: user.into(),
            pass: SecretString::new(pass.into()),
        }
    }

    /// Creates XOAUTH2 credentials.
    pub fn xoauth2(user: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self::XOAuth2 {
            user: user.into(),
            access_token: SecretString::new(access_token.into()),
        }
    }

    /// Returns the account name.
    pub fn user(&self) -> &str {
        match self {
            Credentials::Plain { user, .. } => user,
            Credentials::XOAuth2 { user, .. } => user,
        }
    }

    /// Returns the mechanisms these credentials can drive, best first.
    pub fn compatible_methods(&self) -> &'static [AuthMethod] {
        match self {
            Credentials::Plain { .. } => &[AuthMethod::Plain, AuthMethod::Login],
            Credentials::XOAuth2 { .. } => &[AuthMethod::XOAuth2],
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Plain { user, .. } => f
                .debug_struct("Credentials::Plain")
                .field("user", user)
                .finish_non_exhaustive(),
            Credentials::XOAuth2 { user, .. } => f
                .debug_struct("Credentials::XOAuth2")
                .field("user", user)
                .finish_non_exhaustive(),
        }
    }
}

/// SASL payload encoding helpers.
pub struct Authenticator;

impl Authenticator {
    /// Encodes the PLAIN initial response: `\0user\0pass`, base64.
    pub fn plain_initial_response(user: &str, pass: &SecretString) -> String {
        let payload = format!("\0{}\0{}", user, pass.expose_secret());
        BASE64.encode(payload.as_bytes())
    }

    /// Encodes the LOGIN username line.
    pub fn login_username(user: &str) -> String {
        BASE64.encode(user.as_bytes())
    }

    /// Encodes the LOGIN password line.
    pub fn login_password(pass: &SecretString) -> String {
        BASE64.encode(pass.expose_secret().as_bytes())
    }

    /// Encodes the XOAUTH2 initial response.
    pub fn xoauth2_initial_response(user: &str, access_token: &SecretString) -> String {
        let payload = format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            user,
            access_token.expose_secret()
        );
        BASE64.encode(payload.as_bytes())
    }

    /// Picks the best mechanism offered by the server that the credentials
    /// can drive, honoring an explicit preference when given.
    pub fn select_method(
        available: &[AuthMethod],
        credentials: &Credentials,
        preferred: Option<AuthMethod>,
    ) -> SmtpResult<AuthMethod> {
        if let Some(method) = preferred {
            if !credentials.compatible_methods().contains(&method) {
                return Err(SmtpError::auth(format!(
                    "Credentials cannot drive the {} mechanism",
                    method
                )));
            }
            // An explicit preference is honored even when the server did
            // not advertise it; some servers omit AUTH from EHLO.
            return Ok(method);
        }

        credentials
            .compatible_methods()
            .iter()
            .filter(|m| available.contains(m))
            .max_by_key(|m| m.priority())
            .copied()
            .ok_or_else(|| {
                SmtpError::auth(format!(
                    "No supported authentication mechanism (server offers: {})",
                    available
                        .iter()
                        .map(|m| m.mechanism_name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response() {
        let encoded =
            Authenticator::plain_initial_response("testuser", &SecretString::new("testpass".into()));
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, b"\0testuser\0testpass");
    }

    #[test]
    fn xoauth2_initial_response() {
        let encoded = Authenticator::xoauth2_initial_response(
            "user@example.com",
            &SecretString::new("ya29.token".into()),
        );
        let decoded = String::from_utf8(BASE64.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded, "user=user@example.com\x01auth=Bearer ya29.token\x01\x01");
    }

    #[test]
    fn method_selection_prefers_plain_over_login() {
        let creds = Credentials::plain("user", "pass");
        let method = Authenticator::select_method(
            &[AuthMethod::Login, AuthMethod::Plain],
            &creds,
            None,
        )
        .unwrap();
        assert_eq!(method, AuthMethod::Plain);
    }

    #[test]
    fn method_selection_honors_preference() {
        let creds = Credentials::plain("user", "pass");
        let method =
            Authenticator::select_method(&[AuthMethod::Plain], &creds, Some(AuthMethod::Login))
                .unwrap();
        assert_eq!(method, AuthMethod::Login);
    }

    #[test]
    fn xoauth2_credentials_refuse_password_mechanisms() {
        let creds = Credentials::xoauth2("user@example.com", "token");
        let result = Authenticator::select_method(
            &[AuthMethod::Plain, AuthMethod::Login],
            &creds,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn debug_hides_secrets() {
        let creds = Credentials::plain("user", "hunter2");
        let repr = format!("{:?}", creds);
        assert!(!repr.contains("hunter2"));
    }
}
