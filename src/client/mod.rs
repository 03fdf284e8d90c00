//! Main SMTP client implementation.
//!
//! [`SmtpClient`] sends one message per call over a fresh session:
//! resolve the server, connect, EHLO, apply the STARTTLS policy,
//! authenticate when credentials are configured, then MAIL, RCPT for every
//! envelope recipient, DATA and QUIT. QUIT is attempted on every exit path
//! once a session exists.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{SmtpConfig, TlsMode};
use crate::dns::{DnsMxResolver, MxResolver};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::{ComposedMessage, Composer, ComposerConfig};
use crate::observability::SessionObserver;
use crate::session::Session;
use crate::transport::SmtpTransport;
use crate::types::{Email, Envelope, RejectedRecipient, SendReport};

/// High-level SMTP client.
#[derive(Debug, Clone)]
pub struct SmtpClient {
    config: Arc<SmtpConfig>,
    composer: Composer,
    observer: Arc<dyn SessionObserver>,
    resolver: Option<Arc<dyn MxResolver>>,
}

impl SmtpClient {
    /// Creates a client with default composer settings.
    ///
    /// With the `tracing` feature the session transcript is emitted as
    /// `tracing` events; otherwise it is discarded.
    pub fn new(config: SmtpConfig) -> Self {
        Self::builder(config).build()
    }

    /// Creates a builder for the SMTP client.
    pub fn builder(config: SmtpConfig) -> SmtpClientBuilder {
        SmtpClientBuilder::new(config)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Returns the composer.
    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    /// Composes `email` without sending it.
    pub fn compose(&self, email: &Email) -> SmtpResult<ComposedMessage> {
        self.composer.compose(email)
    }

    /// Composes and sends an email, deriving the envelope from it.
    ///
    /// Without a configured host the server is the MX of the first To, Cc
    /// or Bcc recipient, even when explicit envelope recipients are set.
    pub async fn send_email(&self, email: &Email) -> SmtpResult<SendReport> {
        let envelope = email.envelope()?;
        let message = self.composer.compose(email)?;
        let domain = email
            .all_recipients()
            .map(|a| a.domain())
            .find(|d| !d.is_empty())
            .or_else(|| envelope.first_recipient_domain());
        self.transmit(&envelope, message.as_bytes(), domain).await
    }

    /// Sends a complete message to the envelope recipients.
    ///
    /// Without a configured host the server is the MX of the first
    /// envelope recipient's domain.
    pub async fn send(&self, envelope: &Envelope, message: &[u8]) -> SmtpResult<SendReport> {
        self.transmit(envelope, message, envelope.first_recipient_domain())
            .await
    }

    async fn transmit(
        &self,
        envelope: &Envelope,
        message: &[u8],
        domain: Option<&str>,
    ) -> SmtpResult<SendReport> {
        let start = Instant::now();
        let host = self.resolve_server(domain).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(host = %host, port = self.config.port, "Connecting");

        let session = Session::connect(&host, &self.config, Arc::clone(&self.observer)).await?;
        self.deliver(session, envelope, message, start).await
    }

    /// Sends a message over an already connected transport.
    ///
    /// `host` is used for certificate verification on STARTTLS.
    pub async fn send_via<T: SmtpTransport>(
        &self,
        transport: T,
        host: &str,
        envelope: &Envelope,
        message: &[u8],
    ) -> SmtpResult<SendReport> {
        let start = Instant::now();
        let session = Session::from_transport(transport, host, Arc::clone(&self.observer)).await?;
        self.deliver(session, envelope, message, start).await
    }

    /// Returns the configured host, or the most preferred MX of `domain`.
    async fn resolve_server(&self, domain: Option<&str>) -> SmtpResult<String> {
        if let Some(host) = &self.config.host {
            return Ok(host.clone());
        }

        let domain = domain.ok_or_else(|| {
            SmtpError::configuration("No server given and no recipient domain to look up")
        })?;

        let resolver: Arc<dyn MxResolver> = match &self.resolver {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::new(DnsMxResolver::from_system_conf()?),
        };

        let host = resolver
            .lookup_mx(domain)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SmtpError::dns(format!("No MX records found for {}", domain)))?;

        #[cfg(feature = "tracing")]
        tracing::info!(domain, host = %host, "Resolved MX record");

        Ok(host)
    }

    async fn deliver<T: SmtpTransport>(
        &self,
        mut session: Session<T>,
        envelope: &Envelope,
        message: &[u8],
        start: Instant,
    ) -> SmtpResult<SendReport> {
        let result = self.perform_transaction(&mut session, envelope, message).await;
        let host = session.host().to_string();
        let tls = session.is_tls();
        let mechanism = session.mechanism();
        session.close().await;

        let (accepted, response) = result?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            host = %host,
            recipients = accepted.len(),
            tls,
            "Message accepted: {}",
            response
        );

        Ok(SendReport {
            server: host,
            accepted,
            response,
            tls,
            mechanism,
            duration: start.elapsed(),
        })
    }

    /// Runs the dialogue from EHLO to the final reply.
    async fn perform_transaction<T: SmtpTransport>(
        &self,
        session: &mut Session<T>,
        envelope: &Envelope,
        message: &[u8],
    ) -> SmtpResult<(Vec<String>, String)> {
        let name = self.config.helo_name();
        if self.config.disable_ehlo {
            session.helo(&name).await?;
        } else {
            session.hello(&name).await?;
        }

        self.negotiate_tls(session).await?;

        if let Some(credentials) = self.config.credentials() {
            session
                .authenticate(&credentials, &self.config.auth_mechanisms)
                .await?;

            #[cfg(feature = "tracing")]
            tracing::debug!(mechanism = ?session.mechanism(), user = credentials.username(), "Authenticated");
        }

        session.mail_from(&envelope.sender).await?;

        let mut accepted = Vec::with_capacity(envelope.recipients.len());
        let mut rejected = Vec::new();
        for recipient in &envelope.recipients {
            match session.rcpt_to(recipient).await {
                Ok(()) => accepted.push(recipient.clone()),
                Err(e) if e.kind() == SmtpErrorKind::Rejected => {
                    rejected.push(RejectedRecipient {
                        address: recipient.clone(),
                        code: e.smtp_code(),
                        message: e.server_text().unwrap_or(e.message()).to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(first) = rejected.first() {
            let list = rejected
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            let mut err = SmtpError::new(
                SmtpErrorKind::Rejected,
                format!(
                    "{} of {} recipients rejected: {}",
                    rejected.len(),
                    envelope.recipients.len(),
                    list
                ),
            )
            .with_command(format!("RCPT TO:<{}>", first.address))
            .with_expected_code(250);
            if let Some(code) = first.code {
                err = err.with_smtp_code(code);
            }
            return Err(err);
        }

        let reply = session.transfer(message).await?;
        Ok((accepted, reply.full_message()))
    }

    /// Applies the STARTTLS policy.
    ///
    /// Required mode fails before any credentials are sent. Opportunistic
    /// mode reports a refused STARTTLS to the observer and carries on in
    /// plaintext, unless the handshake left the connection unusable.
    async fn negotiate_tls<T: SmtpTransport>(&self, session: &mut Session<T>) -> SmtpResult<()> {
        let required = match self.config.tls.mode {
            TlsMode::None | TlsMode::Implicit => return Ok(()),
            TlsMode::StartTls => false,
            TlsMode::StartTlsRequired => true,
        };

        if session.is_tls() {
            return Ok(());
        }

        if !session.capabilities().supports_starttls() {
            if required {
                return Err(SmtpError::tls("Server does not offer STARTTLS").with_command("STARTTLS"));
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(host = session.host(), "STARTTLS not offered, continuing in plaintext");
            return Ok(());
        }

        match session.start_tls().await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::info!(host = session.host(), "Connection upgraded to TLS");
                Ok(())
            }
            // Only a refusal before the upgrade leaves a usable plaintext session.
            Err(e) if required || session.is_broken() || session.is_tls() => Err(e),
            Err(e) if e.kind() != SmtpErrorKind::Tls => Err(e),
            Err(e) => {
                self.observer
                    .on_warning(&format!("STARTTLS failed, continuing without TLS: {}", e));
                Ok(())
            }
        }
    }
}

/// Builder for [`SmtpClient`].
#[derive(Debug)]
pub struct SmtpClientBuilder {
    config: SmtpConfig,
    composer: Option<ComposerConfig>,
    observer: Option<Arc<dyn SessionObserver>>,
    resolver: Option<Arc<dyn MxResolver>>,
}

impl SmtpClientBuilder {
    /// Creates a builder around a validated configuration.
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            composer: None,
            observer: None,
            resolver: None,
        }
    }

    /// Sets the composer settings.
    pub fn composer(mut self, config: ComposerConfig) -> Self {
        self.composer = Some(config);
        self
    }

    /// Sets the transcript observer.
    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sets the MX resolver used when no host is configured.
    pub fn resolver(mut self, resolver: Arc<dyn MxResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Builds the client.
    pub fn build(self) -> SmtpClient {
        let composer = self.composer.unwrap_or_else(|| ComposerConfig {
            hostname: self.config.helo_name(),
            ..ComposerConfig::default()
        });

        SmtpClient {
            config: Arc::new(self.config),
            composer: Composer::new(composer),
            observer: self.observer.unwrap_or_else(default_observer),
            resolver: self.resolver,
        }
    }
}

#[cfg(feature = "tracing")]
fn default_observer() -> Arc<dyn SessionObserver> {
    Arc::new(crate::observability::TracingObserver)
}

#[cfg(not(feature = "tracing"))]
fn default_observer() -> Arc<dyn SessionObserver> {
    Arc::new(crate::observability::NoopObserver)
}
