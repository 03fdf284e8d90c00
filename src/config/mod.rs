//! Configuration types for the SMTP sender.
//!
//! Provides configuration with builder pattern for:
//! - Server connection settings (port, address family, local bind)
//! - TLS policy and trust anchors
//! - Authentication credentials and allowed mechanisms
//! - Timeouts

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{AuthMechanism, Credentials};
use crate::errors::{SmtpError, SmtpResult};

/// Default SMTP port.
pub const DEFAULT_PORT: u16 = 25;

/// Port that conventionally speaks implicit TLS (SMTPS).
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single command and its reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Never attempt TLS.
    None,
    /// Opportunistic STARTTLS (default).
    #[default]
    StartTls,
    /// Required STARTTLS (fail before AUTH if it cannot be established).
    StartTlsRequired,
    /// Implicit TLS from the first byte (port 465).
    Implicit,
}

/// Address family used when resolving and dialing the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkFamily {
    /// IPv4 or IPv6, in resolver order.
    #[default]
    Any,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

impl NetworkFamily {
    /// Returns true if the address belongs to this family.
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            NetworkFamily::Any => true,
            NetworkFamily::V4 => addr.is_ipv4(),
            NetworkFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// PEM file with CA certificates to trust.
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM files with CA certificates to trust.
    pub ca_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Creates a new TLS config builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Returns true if custom trust anchors replace the bundled roots.
    pub fn has_custom_roots(&self) -> bool {
        self.ca_file.is_some() || self.ca_path.is_some()
    }

    /// Validates the TLS configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if let Some(path) = &self.ca_file {
            if path.as_os_str().is_empty() {
                return Err(SmtpError::configuration("ca_file must not be empty"));
            }
        }
        if let Some(path) = &self.ca_path {
            if path.as_os_str().is_empty() {
                return Err(SmtpError::configuration("ca_path must not be empty"));
            }
        }

        if self.mode == TlsMode::None && self.has_custom_roots() {
            #[cfg(feature = "tracing")]
            tracing::warn!("CA certificates configured but TLS is disabled");
        }

        Ok(())
    }
}

/// Builder for TLS configuration.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    /// Sets the TLS mode.
    pub fn mode(mut self, mode: TlsMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Sets the CA certificate file.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_file = Some(path.into());
        self
    }

    /// Sets the CA certificate directory.
    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_path = Some(path.into());
        self
    }

    /// Builds the TLS configuration.
    pub fn build(self) -> SmtpResult<TlsConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Connection and session configuration for one send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname. When absent the MX of the first recipient's
    /// domain is used.
    pub host: Option<String>,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address family restriction.
    #[serde(default)]
    pub family: NetworkFamily,
    /// Local address to bind before connecting.
    pub local_addr: Option<SocketAddr>,
    /// Name announced in EHLO/HELO. Defaults to the local host name.
    pub helo_name: Option<String>,
    /// Send HELO only, never EHLO.
    #[serde(default)]
    pub disable_ehlo: bool,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Authentication username.
    pub username: Option<String>,
    /// Authentication password (serialization skipped for security).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Mechanisms allowed for AUTH. Empty means any supported mechanism.
    #[serde(default)]
    pub auth_mechanisms: Vec<AuthMechanism>,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}
fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if let Some(host) = &self.host {
            if host.trim().is_empty() {
                return Err(SmtpError::configuration("Host must not be empty"));
            }
        }

        if self.port == 0 {
            return Err(SmtpError::configuration("Port must be non-zero"));
        }

        if let Some(local) = &self.local_addr {
            if !self.family.matches(local) {
                return Err(SmtpError::configuration(format!(
                    "Local address {} does not match address family {:?}",
                    local, self.family
                )));
            }
        }

        match (&self.username, &self.password) {
            (Some(user), Some(_)) if user.is_empty() => {
                return Err(SmtpError::configuration("Username must not be empty"));
            }
            (Some(_), None) => {
                return Err(SmtpError::configuration("Username given without password"));
            }
            (None, Some(_)) => {
                return Err(SmtpError::configuration("Password given without username"));
            }
            _ => {}
        }

        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(SmtpError::configuration("Timeouts must be non-zero"));
        }

        self.tls.validate()
    }

    /// Returns the server address for a resolved host.
    pub fn address(&self, host: &str) -> String {
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Returns the credentials if authentication is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some(Credentials::from_secret(user.clone(), pass.clone())),
            _ => None,
        }
    }

    /// Returns the name announced in EHLO/HELO.
    pub fn helo_name(&self) -> String {
        match &self.helo_name {
            Some(name) => name.clone(),
            None => local_hostname(),
        }
    }
}

/// Returns the local host name, or `localhost` if it is not valid UTF-8.
pub fn local_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Parses a local bind address given as `ip` or `ip:port`.
pub fn parse_local_addr(s: &str) -> SmtpResult<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip = s
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map_err(|e| {
            SmtpError::configuration(format!("Invalid local address {:?}", s)).with_cause(e)
        })?;
    Ok(SocketAddr::new(ip, 0))
}

/// Splits a server given as `host`, `host:port`, `[v6]` or `[v6]:port`.
///
/// A bare IPv6 literal is taken as a host without port.
pub fn split_server(s: &str) -> SmtpResult<(String, Option<u16>)> {
    let invalid = || SmtpError::configuration(format!("Invalid server address {:?}", s));

    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail {
            "" => (host, None),
            _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
        }
    } else {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            _ => (s, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = port
        .map(|p| p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(invalid))
        .transpose()?;
    Ok((host.to_string(), port))
}

/// Builder for SMTP configuration.
#[derive(Debug, Default)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: u16,
    family: NetworkFamily,
    local_addr: Option<SocketAddr>,
    helo_name: Option<String>,
    disable_ehlo: bool,
    tls: TlsConfig,
    username: Option<String>,
    password: Option<SecretString>,
    auth_mechanisms: Vec<AuthMechanism>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SmtpConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Restricts the address family.
    pub fn family(mut self, family: NetworkFamily) -> Self {
        self.family = family;
        self
    }

    /// Binds the outgoing socket to a local address.
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Sets the name announced in EHLO/HELO.
    pub fn helo_name(mut self, name: impl Into<String>) -> Self {
        self.helo_name = Some(name.into());
        self
    }

    /// Sends HELO instead of EHLO.
    pub fn disable_ehlo(mut self, disable: bool) -> Self {
        self.disable_ehlo = disable;
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Restricts AUTH to the given mechanisms.
    pub fn auth_mechanisms(mut self, mechanisms: impl IntoIterator<Item = AuthMechanism>) -> Self {
        self.auth_mechanisms = mechanisms.into_iter().collect();
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Disables TLS.
    pub fn no_tls(mut self) -> Self {
        self.tls.mode = TlsMode::None;
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SmtpResult<SmtpConfig> {
        let config = SmtpConfig {
            host: self.host,
            port: if self.port == 0 { DEFAULT_PORT } else { self.port },
            family: self.family,
            local_addr: self.local_addr,
            helo_name: self.helo_name,
            disable_ehlo: self.disable_ehlo,
            tls: self.tls,
            username: self.username,
            password: self.password,
            auth_mechanisms: self.auth_mechanisms,
            connect_timeout: if self.connect_timeout == Duration::ZERO {
                DEFAULT_CONNECT_TIMEOUT
            } else {
                self.connect_timeout
            },
            command_timeout: if self.command_timeout == Duration::ZERO {
                DEFAULT_COMMAND_TIMEOUT
            } else {
                self.command_timeout
            },
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use secrecy::ExposeSecret;

    #[test]
    fn test_config_builder() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .port(587)
            .credentials("user", "pass")
            .auth_mechanisms([AuthMechanism::CramMd5])
            .build()
            .unwrap();

        assert_eq!(config.host.as_deref(), Some("smtp.example.com"));
        assert_eq!(config.port, 587);
        assert_eq!(config.username, Some("user".to_string()));
        assert!(config.password.is_some());
        assert_eq!(config.auth_mechanisms, vec![AuthMechanism::CramMd5]);

        let creds = config.credentials().unwrap();
        assert_eq!(creds.username(), "user");
        assert_eq!(creds.password().expose_secret(), "pass");
    }

    #[test]
    fn test_config_defaults() {
        let config = SmtpConfig::builder().build().unwrap();

        assert!(config.host.is_none());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(config.tls.mode, TlsMode::StartTls);
        assert_eq!(config.family, NetworkFamily::Any);
        assert!(config.credentials().is_none());
        assert!(!config.helo_name().is_empty());
    }

    #[test]
    fn test_config_validation() {
        let err = SmtpConfig::builder().host("  ").build().unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Configuration);

        let err = SmtpConfig::builder()
            .family(NetworkFamily::V6)
            .local_addr("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap_err();
        assert!(err.message().contains("address family"));

        let err = SmtpConfig::builder()
            .credentials("", "pass")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Configuration);
    }

    #[test]
    fn test_address_formatting() {
        let config = SmtpConfig::builder().port(2525).build().unwrap();
        assert_eq!(config.address("mx.example.com"), "mx.example.com:2525");
        assert_eq!(config.address("::1"), "[::1]:2525");
    }

    #[test]
    fn test_parse_local_addr() {
        assert_eq!(
            parse_local_addr("192.0.2.1").unwrap(),
            "192.0.2.1:0".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_local_addr("192.0.2.1:2500").unwrap().port(),
            2500
        );
        assert!(parse_local_addr("::1").unwrap().is_ipv6());
        assert!(parse_local_addr("[::1]").unwrap().is_ipv6());
        assert!(parse_local_addr("not-an-ip").is_err());
    }

    #[test]
    fn test_split_server() {
        assert_eq!(
            split_server("mx.example.com").unwrap(),
            ("mx.example.com".to_string(), None)
        );
        assert_eq!(
            split_server("mx.example.com:587").unwrap(),
            ("mx.example.com".to_string(), Some(587))
        );
        assert_eq!(split_server("[::1]:2525").unwrap(), ("::1".to_string(), Some(2525)));
        assert_eq!(split_server("[::1]").unwrap(), ("::1".to_string(), None));
        assert_eq!(split_server("2001:db8::25").unwrap(), ("2001:db8::25".to_string(), None));
        assert!(split_server("mx.example.com:smtp").is_err());
        assert!(split_server(":25").is_err());
        assert!(split_server("[::1").is_err());
    }

    #[test]
    fn test_tls_config() {
        let tls = TlsConfig::builder()
            .mode(TlsMode::StartTlsRequired)
            .ca_file("/etc/ssl/certs/ca.pem")
            .build()
            .unwrap();

        assert_eq!(tls.mode, TlsMode::StartTlsRequired);
        assert!(tls.has_custom_roots());
        assert!(TlsConfig::builder().ca_path("").build().is_err());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .credentials("user", "secret")
            .command_timeout(Duration::from_secs(90))
            .tls_mode(TlsMode::Implicit)
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"command_timeout\":\"1m 30s\""));
        assert!(json.contains("\"implicit\""));
        assert!(!json.contains("secret"));

        let back: SmtpConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command_timeout, Duration::from_secs(90));
        assert_eq!(back.tls.mode, TlsMode::Implicit);
        assert!(back.password.is_none());
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let config: SmtpConfig = serde_json::from_str(r#"{"host": "mx.example.net"}"#).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(config.auth_mechanisms.is_empty());
        assert!(config.validate().is_ok());
    }
}
