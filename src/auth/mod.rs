//! Authentication mechanisms for SMTP.
//!
//! Supports:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)
//!
//! The encoders here are pure; the dialogue itself lives in
//! [`Session::authenticate`](crate::session::Session::authenticate).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{SmtpError, SmtpResult};

/// Authentication mechanisms supported by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMechanism {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMechanism {
    /// All mechanisms, in no particular preference.
    pub const ALL: [AuthMechanism; 3] = [
        AuthMechanism::Plain,
        AuthMechanism::Login,
        AuthMechanism::CramMd5,
    ];

    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::Login => "LOGIN",
            AuthMechanism::CramMd5 => "CRAM-MD5",
        }
    }

    /// Parses from an SMTP capability token.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(AuthMechanism::Plain),
            "LOGIN" => Some(AuthMechanism::Login),
            "CRAM-MD5" => Some(AuthMechanism::CramMd5),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism_name())
    }
}

impl FromStr for AuthMechanism {
    type Err = SmtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.replace('_', "-");
        Self::from_capability(&normalized).ok_or_else(|| {
            SmtpError::configuration(format!("Unknown authentication mechanism: {}", s))
        })
    }
}

/// Username and password for AUTH.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Creates credentials from an already protected password.
    pub fn from_secret(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Authentication payload encoders.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(credentials: &Credentials) -> String {
        // Format: \0username\0password
        let response = format!(
            "\0{}\0{}",
            credentials.username,
            credentials.password.expose_secret()
        );
        BASE64.encode(response)
    }

    /// Generates LOGIN username response.
    pub fn login_username(credentials: &Credentials) -> String {
        BASE64.encode(&credentials.username)
    }

    /// Generates LOGIN password response.
    pub fn login_password(credentials: &Credentials) -> String {
        BASE64.encode(credentials.password.expose_secret())
    }

    /// Generates the CRAM-MD5 answer to a base64 challenge.
    pub fn cram_md5_response(challenge: &str, credentials: &Credentials) -> SmtpResult<String> {
        let challenge_bytes = BASE64.decode(challenge.trim()).map_err(|e| {
            SmtpError::authentication(format!("CRAM-MD5 challenge is not base64: {}", e))
                .with_cause(e)
        })?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(credentials.password.expose_secret().as_bytes())
            .map_err(|e| SmtpError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        // Format: username space hex-digest
        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        let response = format!("{} {}", credentials.username, hex_digest);
        Ok(BASE64.encode(response))
    }

    /// Picks the mechanism to use.
    ///
    /// Walks the server's AUTH tokens in advertised order and returns the
    /// first one that is supported here and present in `allowed`. An empty
    /// `allowed` list means any supported mechanism.
    pub fn select_mechanism(
        advertised: &[String],
        allowed: &[AuthMechanism],
    ) -> SmtpResult<AuthMechanism> {
        if advertised.is_empty() {
            return Err(SmtpError::authentication("no mechanisms available"));
        }

        advertised
            .iter()
            .filter_map(|token| AuthMechanism::from_capability(token))
            .find(|m| allowed.is_empty() || allowed.contains(m))
            .ok_or_else(|| {
                let allowed: Vec<&str> = if allowed.is_empty() {
                    AuthMechanism::ALL.iter().map(|m| m.mechanism_name()).collect()
                } else {
                    allowed.iter().map(|m| m.mechanism_name()).collect()
                };
                SmtpError::authentication(format!(
                    "no usable mechanism: server offers {}, allowed {}",
                    advertised.join(" "),
                    allowed.join(" ")
                ))
            })
    }
}
