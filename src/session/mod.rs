//! SMTP session engine.
//!
//! A [`Session`] owns one connection and walks it through the dialogue in a
//! fixed order:
//!
//! ```text
//! Connected -> Greeted -> Extended | Basic -> [TlsUpgraded] -> [Authenticated]
//!           -> SenderSet -> RecipientAccepted* -> Transferred -> Closed
//! ```
//!
//! Every step sends one command and waits for its reply; nothing is
//! pipelined. A step called out of order fails with
//! [`SmtpErrorKind::Sequence`] without touching the wire. A reply with the
//! wrong code fails with an error naming the command, the expected code and
//! the server's text. The only step that retries is EHLO, which falls back
//! to HELO when the server answers 500 or 502.

use std::sync::Arc;

use crate::auth::{AuthMechanism, Authenticator, Credentials};
use crate::config::SmtpConfig;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::observability::{NoopObserver, SessionObserver};
use crate::protocol::{codes, dot_stuff, Capabilities, SessionState, SmtpCommand, SmtpResponse};
use crate::transport::{SmtpTransport, TcpTransport};

/// One SMTP connection and its dialogue state.
#[derive(Debug)]
pub struct Session<T: SmtpTransport = TcpTransport> {
    transport: T,
    host: String,
    helo_name: Option<String>,
    state: SessionState,
    capabilities: Capabilities,
    extended: bool,
    greeting: SmtpResponse,
    mechanism: Option<AuthMechanism>,
    observer: Arc<dyn SessionObserver>,
    /// Set once the stream can no longer carry commands.
    broken: bool,
}

impl Session<TcpTransport> {
    /// Connects to `host` and reads the greeting.
    pub async fn connect(
        host: &str,
        config: &SmtpConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> SmtpResult<Self> {
        let transport = TcpTransport::connect(host, config).await?;
        Self::from_transport(transport, host, observer).await
    }
}

impl<T: SmtpTransport> Session<T> {
    /// Wraps an open transport and reads the server greeting.
    ///
    /// Anything but a 220 greeting shuts the transport down and fails with
    /// [`SmtpErrorKind::Connection`]; no EHLO or HELO is ever sent.
    pub async fn from_transport(
        mut transport: T,
        host: impl Into<String>,
        observer: Arc<dyn SessionObserver>,
    ) -> SmtpResult<Self> {
        let greeting = match transport.read_response().await {
            Ok(greeting) => greeting,
            Err(e) => {
                transport.shutdown().await;
                let e = if e.kind() == SmtpErrorKind::Timeout {
                    e
                } else {
                    e.into_kind(SmtpErrorKind::Connection)
                };
                return Err(e.with_command("greeting"));
            }
        };
        observer.on_response(&greeting);

        if greeting.code != codes::SERVICE_READY {
            transport.shutdown().await;
            return Err(SmtpError::from_response(
                SmtpErrorKind::Connection,
                "greeting",
                codes::SERVICE_READY,
                &greeting,
            ));
        }

        Ok(Self {
            transport,
            host: host.into(),
            helo_name: None,
            state: SessionState::Greeted,
            capabilities: Capabilities::default(),
            extended: false,
            greeting,
            mechanism: None,
            observer,
            broken: false,
        })
    }

    /// Like [`from_transport`](Self::from_transport) without an observer.
    pub async fn from_transport_quiet(transport: T, host: impl Into<String>) -> SmtpResult<Self> {
        Self::from_transport(transport, host, Arc::new(NoopObserver)).await
    }

    /// Returns the current dialogue state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the capabilities from the most recent EHLO.
    ///
    /// Empty after a HELO fallback and between STARTTLS and the EHLO that
    /// follows it.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Returns true if the server accepted EHLO.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Returns true if the stream is encrypted.
    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Returns the server greeting.
    pub fn greeting(&self) -> &SmtpResponse {
        &self.greeting
    }

    /// Returns the host the session was opened to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the mechanism used by a successful AUTH.
    pub fn mechanism(&self) -> Option<AuthMechanism> {
        self.mechanism
    }

    /// Returns true once an I/O failure has made the stream unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn ensure(&self, allowed: bool, operation: &str) -> SmtpResult<()> {
        if allowed {
            Ok(())
        } else {
            Err(SmtpError::sequence(format!(
                "{} is not allowed in state {}",
                operation, self.state
            )))
        }
    }

    /// Sends one command and reads its reply.
    async fn command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let shown = command.redacted();
        if self.broken {
            return Err(SmtpError::connection("Connection is no longer usable").with_command(shown));
        }

        self.observer.on_command(&shown);
        if let Err(e) = self.transport.send_line(&command.to_smtp_string()).await {
            self.broken = true;
            return Err(e.with_command(shown));
        }

        match self.transport.read_response().await {
            Ok(response) => {
                self.observer.on_response(&response);
                Ok(response)
            }
            Err(e) => {
                self.broken = true;
                Err(e.with_command(shown))
            }
        }
    }

    /// Sends a command and requires a reply code.
    ///
    /// `label` names the step in the error; it defaults to the redacted
    /// command line.
    async fn exchange(
        &mut self,
        command: &SmtpCommand,
        expected: u16,
        kind: SmtpErrorKind,
        label: Option<&str>,
    ) -> SmtpResult<SmtpResponse> {
        let response = self.command(command).await?;
        if response.code != expected {
            let label = label
                .map(str::to_string)
                .unwrap_or_else(|| command.redacted());
            return Err(SmtpError::from_response(kind, label, expected, &response));
        }
        Ok(response)
    }

    /// EHLO with HELO fallback, or HELO alone. Does not touch `state`.
    async fn negotiate(&mut self, name: &str, allow_ehlo: bool) -> SmtpResult<()> {
        self.capabilities = Capabilities::default();
        self.extended = false;

        if allow_ehlo {
            let ehlo = SmtpCommand::Ehlo(name.to_string());
            let response = self.command(&ehlo).await?;
            match response.code {
                codes::OK => {
                    self.capabilities = Capabilities::from_ehlo_response(&response);
                    self.extended = true;
                    return Ok(());
                }
                codes::SYNTAX_ERROR | codes::NOT_IMPLEMENTED => {}
                _ => {
                    return Err(SmtpError::from_response(
                        SmtpErrorKind::Protocol,
                        ehlo.redacted(),
                        codes::OK,
                        &response,
                    ));
                }
            }
        }

        self.exchange(
            &SmtpCommand::Helo(name.to_string()),
            codes::OK,
            SmtpErrorKind::Protocol,
            None,
        )
        .await?;
        Ok(())
    }

    /// Sends EHLO, falling back to HELO on 500 or 502.
    ///
    /// Returns the parsed capabilities, which are empty after a fallback.
    pub async fn hello(&mut self, name: &str) -> SmtpResult<&Capabilities> {
        self.ensure(self.state.can_hello(), "EHLO")?;
        self.negotiate(name, true).await?;
        self.helo_name = Some(name.to_string());
        self.state = if self.extended {
            SessionState::Extended
        } else {
            SessionState::Basic
        };
        Ok(&self.capabilities)
    }

    /// Sends HELO only; the session stays without ESMTP capabilities.
    pub async fn helo(&mut self, name: &str) -> SmtpResult<()> {
        self.ensure(self.state.can_hello(), "HELO")?;
        self.negotiate(name, false).await?;
        self.helo_name = Some(name.to_string());
        self.state = SessionState::Basic;
        Ok(())
    }

    /// Upgrades the connection with STARTTLS and repeats EHLO over TLS.
    ///
    /// The certificate is verified against the host the session was opened
    /// to. Capabilities learned in plaintext are discarded. If the server
    /// refuses STARTTLS the session is unchanged and still usable; if the
    /// handshake itself fails the session is broken.
    pub async fn start_tls(&mut self) -> SmtpResult<()> {
        self.ensure(self.state.can_start_tls(), "STARTTLS")?;
        if self.transport.is_tls() {
            return Err(SmtpError::sequence("Connection is already encrypted"));
        }

        self.exchange(
            &SmtpCommand::StartTls,
            codes::SERVICE_READY,
            SmtpErrorKind::Tls,
            None,
        )
        .await?;

        if let Err(e) = self.transport.upgrade_tls(&self.host).await {
            self.broken = true;
            return Err(e.into_kind(SmtpErrorKind::Tls).with_command("STARTTLS"));
        }

        let name = self.helo_name.clone().unwrap_or_default();
        self.negotiate(&name, true).await?;
        self.state = SessionState::TlsUpgraded;
        Ok(())
    }

    /// Authenticates with the first advertised mechanism that `allowed`
    /// permits (an empty list permits all).
    ///
    /// Exactly one mechanism is tried. Returns the mechanism used.
    pub async fn authenticate(
        &mut self,
        credentials: &Credentials,
        allowed: &[AuthMechanism],
    ) -> SmtpResult<AuthMechanism> {
        self.ensure(self.state.can_authenticate(), "AUTH")?;
        let mechanism =
            Authenticator::select_mechanism(self.capabilities.auth_mechanisms(), allowed)?;

        let name = mechanism.mechanism_name();
        let step = |s: &str| format!("AUTH {} ({})", name, s);

        match mechanism {
            AuthMechanism::Plain => {
                let command = SmtpCommand::Auth {
                    mechanism: name.to_string(),
                    initial_response: Some(Authenticator::plain_initial_response(credentials)),
                };
                self.exchange(
                    &command,
                    codes::AUTH_SUCCESS,
                    SmtpErrorKind::Auth,
                    Some(&step("credentials")),
                )
                .await?;
            }
            AuthMechanism::Login => {
                let start = SmtpCommand::Auth {
                    mechanism: name.to_string(),
                    initial_response: None,
                };
                self.exchange(
                    &start,
                    codes::AUTH_CONTINUE,
                    SmtpErrorKind::Auth,
                    Some(&step("start")),
                )
                .await?;
                self.exchange(
                    &SmtpCommand::AuthResponse(Authenticator::login_username(credentials)),
                    codes::AUTH_CONTINUE,
                    SmtpErrorKind::Auth,
                    Some(&step("username")),
                )
                .await?;
                self.exchange(
                    &SmtpCommand::AuthResponse(Authenticator::login_password(credentials)),
                    codes::AUTH_SUCCESS,
                    SmtpErrorKind::Auth,
                    Some(&step("password")),
                )
                .await?;
            }
            AuthMechanism::CramMd5 => {
                let start = SmtpCommand::Auth {
                    mechanism: name.to_string(),
                    initial_response: None,
                };
                let challenge = self
                    .exchange(
                        &start,
                        codes::AUTH_CONTINUE,
                        SmtpErrorKind::Auth,
                        Some(&step("start")),
                    )
                    .await?;
                let answer =
                    Authenticator::cram_md5_response(challenge.first_message(), credentials)
                        .map_err(|e| {
                            SmtpError::authentication(format!(
                                "{}: {}",
                                step("challenge"),
                                e.message()
                            ))
                        })?;
                self.exchange(
                    &SmtpCommand::AuthResponse(answer),
                    codes::AUTH_SUCCESS,
                    SmtpErrorKind::Auth,
                    Some(&step("response")),
                )
                .await?;
            }
        }

        self.mechanism = Some(mechanism);
        self.state = SessionState::Authenticated;
        Ok(mechanism)
    }

    /// Sends `MAIL FROM:<address>`.
    pub async fn mail_from(&mut self, address: &str) -> SmtpResult<()> {
        self.ensure(self.state.can_start_mail(), "MAIL FROM")?;
        self.exchange(
            &SmtpCommand::MailFrom(address.to_string()),
            codes::OK,
            SmtpErrorKind::Rejected,
            None,
        )
        .await?;
        self.state = SessionState::SenderSet;
        Ok(())
    }

    /// Sends `RCPT TO:<address>`.
    ///
    /// A rejection leaves the state unchanged, so other recipients can
    /// still be tried.
    pub async fn rcpt_to(&mut self, address: &str) -> SmtpResult<()> {
        self.ensure(self.state.can_add_recipient(), "RCPT TO")?;
        self.exchange(
            &SmtpCommand::RcptTo(address.to_string()),
            codes::OK,
            SmtpErrorKind::Rejected,
            None,
        )
        .await?;
        self.state = SessionState::RecipientAccepted;
        Ok(())
    }

    /// Sends DATA, the dot-stuffed message and the end-of-data marker.
    ///
    /// Returns the server's final reply. Every failure from DATA onward is
    /// reported as [`SmtpErrorKind::Transfer`].
    pub async fn transfer(&mut self, message: &[u8]) -> SmtpResult<SmtpResponse> {
        self.ensure(self.state.can_send_data(), "DATA")?;
        self.exchange(
            &SmtpCommand::Data,
            codes::START_MAIL_INPUT,
            SmtpErrorKind::Transfer,
            None,
        )
        .await
        .map_err(|e| e.into_kind(SmtpErrorKind::Transfer))?;

        let payload = dot_stuff(message);
        if let Err(e) = self.transport.send_data(&payload).await {
            self.broken = true;
            return Err(SmtpError::transfer(format!(
                "Connection lost while sending the message body: {}",
                e.message()
            ))
            .with_command("message body")
            .with_cause(e));
        }
        self.observer.on_data(message.len());

        let response = match self.transport.read_response().await {
            Ok(response) => response,
            Err(e) => {
                self.broken = true;
                return Err(e
                    .into_kind(SmtpErrorKind::Transfer)
                    .with_command("end of data"));
            }
        };
        self.observer.on_response(&response);

        if response.code != codes::OK {
            return Err(SmtpError::from_response(
                SmtpErrorKind::Transfer,
                "end of data",
                codes::OK,
                &response,
            ));
        }

        self.state = SessionState::Transferred;
        Ok(response)
    }

    /// Sends QUIT if the stream is still usable, then shuts it down.
    ///
    /// Never fails; a missing or unexpected reply to QUIT is ignored.
    pub async fn close(mut self) {
        if !self.broken && self.state != SessionState::Closed {
            let _ = self.command(&SmtpCommand::Quit).await;
        }
        self.transport.shutdown().await;
        self.state = SessionState::Closed;
    }
}
