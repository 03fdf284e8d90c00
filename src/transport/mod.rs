//! Transport layer for SMTP connections.
//!
//! A transport moves lines and bytes over one TCP connection, optionally
//! upgraded to TLS. It knows nothing about the SMTP dialogue beyond how a
//! reply is framed.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::config::{NetworkFamily, SmtpConfig, TlsConfig, TlsMode};
use crate::errors::{SmtpError, SmtpResult};
use crate::protocol::{is_continuation, SmtpResponse};

/// Trait for SMTP transport abstraction.
#[async_trait]
pub trait SmtpTransport: Send + fmt::Debug {
    /// Sends one command line; CRLF is appended.
    async fn send_line(&mut self, line: &str) -> SmtpResult<()>;

    /// Sends raw bytes (the DATA payload).
    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()>;

    /// Reads one complete, possibly multi-line, reply.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;

    /// Performs a TLS handshake over the existing connection, verifying the
    /// certificate against `host`.
    async fn upgrade_tls(&mut self, host: &str) -> SmtpResult<()>;

    /// Returns true if the stream is encrypted.
    fn is_tls(&self) -> bool;

    /// Shuts the stream down. Never fails.
    async fn shutdown(&mut self);
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    stream: TransportStream,
    tls: TlsConfig,
    connect_timeout: Duration,
    command_timeout: Duration,
    peer: SocketAddr,
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<BufReader<tokio_rustls::client::TlsStream<TcpStream>>>),
    /// Left behind after a failed upgrade or a shutdown.
    Closed,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("tls", &self.is_tls())
            .field("closed", &matches!(self.stream, TransportStream::Closed))
            .finish()
    }
}

impl TcpTransport {
    /// Connects to `host` on the configured port.
    ///
    /// Resolves the host, keeps only addresses of the configured family,
    /// binds the configured local address if any, and dials each address
    /// in turn within the connect timeout. With [`TlsMode::Implicit`] the
    /// TLS handshake happens here, before any byte of SMTP is read. The
    /// greeting is left unread for the session.
    pub async fn connect(host: &str, config: &SmtpConfig) -> SmtpResult<Self> {
        let address = config.address(host);

        let (stream, peer) = timeout(
            config.connect_timeout,
            Self::dial(&address, config.family, config.local_addr),
        )
        .await
        .map_err(|_| {
            SmtpError::timeout(format!("Connect to {} timed out", address)).with_command("connect")
        })??;

        stream.set_nodelay(true).ok();

        #[cfg(feature = "tracing")]
        tracing::debug!(%peer, host, "Connected to SMTP server");

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            tls: config.tls.clone(),
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
            peer,
        };

        if config.tls.mode == TlsMode::Implicit {
            transport
                .upgrade_tls(host)
                .await
                .map_err(|e| e.with_command("implicit TLS"))?;
        }

        Ok(transport)
    }

    /// Returns the address of the server.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn dial(
        address: &str,
        family: NetworkFamily,
        local: Option<SocketAddr>,
    ) -> SmtpResult<(TcpStream, SocketAddr)> {
        let candidates: Vec<SocketAddr> = lookup_host(address)
            .await
            .map_err(|e| {
                SmtpError::connection(format!("Cannot resolve {}: {}", address, e)).with_cause(e)
            })?
            .filter(|a| family.matches(a))
            .filter(|a| local.map_or(true, |l| l.is_ipv4() == a.is_ipv4()))
            .collect();

        if candidates.is_empty() {
            return Err(SmtpError::connection(format!(
                "No usable {:?} address for {}",
                family, address
            )));
        }

        let mut last_error = None;
        for addr in candidates {
            match Self::dial_one(addr, local).await {
                Ok(stream) => return Ok((stream, addr)),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(%addr, error = %e, "Connect attempt failed");
                    last_error = Some(map_io_error(e, &addr.to_string()));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| SmtpError::connection(format!("Cannot connect to {}", address))))
    }

    async fn dial_one(addr: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
        match local {
            Some(local) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(local)?;
                socket.connect(addr).await
            }
            None => TcpStream::connect(addr).await,
        }
    }
}

/// Maps IO errors to SMTP errors.
fn map_io_error(error: io::Error, address: &str) -> SmtpError {
    let message = match error.kind() {
        io::ErrorKind::ConnectionRefused => format!("Connection refused by {}", address),
        io::ErrorKind::TimedOut => format!("Connect to {} timed out", address),
        io::ErrorKind::AddrNotAvailable => format!("Local address not available for {}", address),
        _ => format!("Cannot connect to {}: {}", address, error),
    };
    SmtpError::connection(message)
        .with_command("connect")
        .with_cause(error)
}

/// Longest reply line accepted, CRLF included. RFC 5321 allows 512.
const MAX_REPLY_LINE: usize = 4096;

/// Largest multi-line reply accepted.
const MAX_REPLY_BYTES: usize = 64 * 1024;

/// Reads lines until a reply is complete.
pub(crate) async fn read_response_inner<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    timeout_duration: Duration,
) -> SmtpResult<SmtpResponse> {
    let mut lines = Vec::new();
    let mut total = 0;

    loop {
        let mut raw = Vec::new();
        let mut limited = (&mut *reader).take(MAX_REPLY_LINE as u64);

        let n = timeout(timeout_duration, limited.read_until(b'\n', &mut raw))
            .await
            .map_err(|_| SmtpError::timeout("Timed out waiting for server reply"))?
            .map_err(|e| SmtpError::connection(format!("Read error: {}", e)).with_cause(e))?;

        if n == 0 {
            return Err(SmtpError::connection("Server closed connection"));
        }

        if !raw.ends_with(b"\n") && n >= MAX_REPLY_LINE {
            return Err(SmtpError::protocol(format!(
                "Reply line exceeds {} bytes",
                MAX_REPLY_LINE
            )));
        }

        total += n;
        if total > MAX_REPLY_BYTES {
            return Err(SmtpError::protocol(format!(
                "Reply exceeds {} bytes",
                MAX_REPLY_BYTES
            )));
        }

        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();

        let more = is_continuation(&line);
        lines.push(line);

        if !more {
            break;
        }
    }

    SmtpResponse::parse(&lines)
}

/// Writes and flushes within the deadline.
pub(crate) async fn write_all<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    timeout_duration: Duration,
) -> SmtpResult<()> {
    timeout(timeout_duration, writer.write_all(data))
        .await
        .map_err(|_| SmtpError::timeout("Write timed out"))?
        .map_err(|e| SmtpError::connection(format!("Write error: {}", e)).with_cause(e))?;

    timeout(timeout_duration, writer.flush())
        .await
        .map_err(|_| SmtpError::timeout("Flush timed out"))?
        .map_err(|e| SmtpError::connection(format!("Flush error: {}", e)).with_cause(e))?;

    Ok(())
}

#[cfg(feature = "rustls-tls")]
mod tls {
    use rustls::pki_types::CertificateDer;
    use rustls::RootCertStore;
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;
    use std::sync::Arc;

    use crate::config::TlsConfig;
    use crate::errors::{SmtpError, SmtpResult};

    /// Builds a connector trusting either the bundled web PKI roots or the
    /// configured CA file and directory.
    pub(super) fn connector(config: &TlsConfig) -> SmtpResult<tokio_rustls::TlsConnector> {
        let mut root_store = RootCertStore::empty();

        if config.has_custom_roots() {
            if let Some(file) = &config.ca_file {
                add_pem_file(&mut root_store, file)?;
            }
            if let Some(dir) = &config.ca_path {
                let entries = std::fs::read_dir(dir).map_err(|e| {
                    SmtpError::tls(format!("Cannot read CA directory {}: {}", dir.display(), e))
                        .with_cause(e)
                })?;
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_file() {
                        // Non-PEM files are common in CA directories (hash links, READMEs)
                        let _ = add_pem_file(&mut root_store, &path);
                    }
                }
            }
            if root_store.is_empty() {
                return Err(SmtpError::tls("No CA certificates found in configured paths"));
            }
        } else {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(tokio_rustls::TlsConnector::from(Arc::new(tls_config)))
    }

    fn add_pem_file(store: &mut RootCertStore, path: &Path) -> SmtpResult<usize> {
        let file = File::open(path).map_err(|e| {
            SmtpError::tls(format!("Cannot open CA file {}: {}", path.display(), e)).with_cause(e)
        })?;
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<_, _>>()
            .map_err(|e| {
                SmtpError::tls(format!("Invalid PEM in {}: {}", path.display(), e)).with_cause(e)
            })?;

        let mut added = 0;
        for cert in certs {
            store.add(cert).map_err(|e| {
                SmtpError::tls(format!("Bad CA certificate in {}: {}", path.display(), e))
                    .with_cause(e)
            })?;
            added += 1;
        }
        Ok(added)
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_line(&mut self, line: &str) -> SmtpResult<()> {
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.send_data(&buf).await
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        match &mut self.stream {
            TransportStream::Plain(stream) => {
                write_all(stream.get_mut(), data, self.command_timeout).await
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => {
                write_all(stream.get_mut(), data, self.command_timeout).await
            }
            TransportStream::Closed => Err(SmtpError::connection("Connection is closed")),
        }
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        match &mut self.stream {
            TransportStream::Plain(stream) => {
                read_response_inner(stream, self.command_timeout).await
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => {
                read_response_inner(stream.as_mut(), self.command_timeout).await
            }
            TransportStream::Closed => Err(SmtpError::connection("Connection is closed")),
        }
    }

    #[cfg(feature = "rustls-tls")]
    async fn upgrade_tls(&mut self, host: &str) -> SmtpResult<()> {
        use rustls::pki_types::ServerName;

        let reader = match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Plain(reader) => reader,
            other => {
                self.stream = other;
                return Err(SmtpError::tls("Connection is not a plain TCP stream"));
            }
        };

        // Anything buffered now was sent before the handshake and cannot be trusted
        if !reader.buffer().is_empty() {
            return Err(SmtpError::tls("Server sent data before the TLS handshake"));
        }

        let connector = tls::connector(&self.tls)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", host)))?;

        let tls_stream = timeout(
            self.connect_timeout,
            connector.connect(server_name, reader.into_inner()),
        )
        .await
        .map_err(|_| SmtpError::tls("TLS handshake timed out"))?
        .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(host, peer = %self.peer, "TLS established");

        self.stream = TransportStream::Tls(Box::new(BufReader::new(tls_stream)));
        Ok(())
    }

    #[cfg(not(feature = "rustls-tls"))]
    async fn upgrade_tls(&mut self, _host: &str) -> SmtpResult<()> {
        Err(SmtpError::tls("No TLS implementation available"))
    }

    fn is_tls(&self) -> bool {
        #[cfg(feature = "rustls-tls")]
        {
            matches!(self.stream, TransportStream::Tls(_))
        }
        #[cfg(not(feature = "rustls-tls"))]
        {
            false
        }
    }

    async fn shutdown(&mut self) {
        match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Plain(mut stream) => {
                let _ = stream.get_mut().shutdown().await;
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(mut stream) => {
                let _ = stream.get_mut().shutdown().await;
            }
            TransportStream::Closed => {}
        }
    }
}
