//! `smtp-cli`: send one message to one SMTP server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use smtp_cli::config::{
    parse_local_addr, split_server, DEFAULT_PORT, IMPLICIT_TLS_PORT,
};
use smtp_cli::input::{body_content, read_attachment, read_source};
use smtp_cli::types::parse_header_line;
use smtp_cli::{
    AuthMechanism, ComposerConfig, Email, NetworkFamily, SendReport, SmtpClient, SmtpConfig,
    SmtpError, SmtpErrorKind, SmtpResult, TlsConfig, TlsMode, TransferEncoding,
};

#[derive(Parser, Debug)]
#[command(name = "smtp-cli", version, about = "Send one email message over SMTP")]
struct Args {
    /// Host name or IP address of the SMTP server, optionally as host:port
    #[arg(long, help_heading = "Connection")]
    server: Option<String>,

    /// Port where the SMTP server is listening
    #[arg(long, default_value_t = DEFAULT_PORT, help_heading = "Connection")]
    port: u16,

    /// Use IPv4 only
    #[arg(short = '4', long = "ipv4", conflicts_with = "ipv6", help_heading = "Connection")]
    ipv4: bool,

    /// Use IPv6 only
    #[arg(short = '6', long = "ipv6", help_heading = "Connection")]
    ipv6: bool,

    /// Local address to bind, as ip or ip:port
    #[arg(long, value_name = "ADDR", help_heading = "Connection")]
    local_addr: Option<String>,

    /// Name to announce in EHLO/HELO
    #[arg(long, value_name = "NAME", help_heading = "Connection")]
    hello_host: Option<String>,

    /// Send HELO only, never EHLO
    #[arg(long, help_heading = "Connection")]
    disable_ehlo: bool,

    /// Connect timeout
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s", help_heading = "Connection")]
    connect_timeout: Duration,

    /// Per-command timeout
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m", help_heading = "Connection")]
    command_timeout: Duration,

    /// Never use STARTTLS, even if the server offers it
    #[arg(long, conflicts_with = "require_tls", help_heading = "Encryption")]
    disable_starttls: bool,

    /// Abort unless STARTTLS succeeds
    #[arg(long, help_heading = "Encryption")]
    require_tls: bool,

    /// Start in SMTP over TLS mode (SMTPS)
    #[arg(long, conflicts_with = "disable_ssl", help_heading = "Encryption")]
    ssl: bool,

    /// Don't start SMTPS even if the port is 465
    #[arg(long, help_heading = "Encryption")]
    disable_ssl: bool,

    /// Trust only the CA certificates in this PEM file
    #[arg(long, value_name = "FILE", help_heading = "Encryption")]
    ssl_ca_file: Option<PathBuf>,

    /// Trust only the CA certificates in PEM files in this directory
    #[arg(long, value_name = "DIR", help_heading = "Encryption")]
    ssl_ca_path: Option<PathBuf>,

    /// Username for SMTP authentication
    #[arg(long, env = "SMTP_USER", help_heading = "Authentication")]
    user: Option<String>,

    /// Password for SMTP authentication
    #[arg(long, env = "SMTP_PASS", hide_env_values = true, help_heading = "Authentication")]
    pass: Option<String>,

    /// Allow AUTH PLAIN
    #[arg(long, help_heading = "Authentication")]
    auth_plain: bool,

    /// Allow AUTH LOGIN
    #[arg(long, help_heading = "Authentication")]
    auth_login: bool,

    /// Allow AUTH CRAM-MD5
    #[arg(long, help_heading = "Authentication")]
    auth_cram_md5: bool,

    /// Allow every supported mechanism
    #[arg(long, help_heading = "Authentication")]
    auth: bool,

    /// Author mailbox, "Name <address>" or address only
    #[arg(long, help_heading = "Message")]
    from: Option<String>,

    /// Recipients (repeatable, comma separated)
    #[arg(long, value_delimiter = ',', help_heading = "Message")]
    to: Vec<String>,

    /// Carbon copy recipients (repeatable, comma separated)
    #[arg(long, value_delimiter = ',', help_heading = "Message")]
    cc: Vec<String>,

    /// Blind copy recipients (repeatable, comma separated)
    #[arg(long, value_delimiter = ',', help_heading = "Message")]
    bcc: Vec<String>,

    /// Address for MAIL FROM, overriding --from
    #[arg(long, value_name = "ADDRESS", help_heading = "Envelope")]
    mail_from: Option<String>,

    /// Address for RCPT TO, overriding --to/--cc/--bcc (repeatable)
    #[arg(long, value_name = "ADDRESS", help_heading = "Envelope")]
    rcpt_to: Vec<String>,

    /// Send this complete message file (or - for stdin) after DATA
    #[arg(long, value_name = "FILE", help_heading = "Message")]
    data: Option<String>,

    /// Subject of the message
    #[arg(long, help_heading = "Message")]
    subject: Option<String>,

    /// Plain text body, literal or a file name
    #[arg(long, value_name = "TEXT|FILE", help_heading = "Message")]
    body_plain: Option<String>,

    /// HTML body, literal or a file name
    #[arg(long, value_name = "HTML|FILE", help_heading = "Message")]
    body_html: Option<String>,

    /// Charset of the subject and text parts
    #[arg(long, default_value = "UTF-8", help_heading = "Message")]
    charset: String,

    /// Content-Transfer-Encoding of text parts
    #[arg(long, default_value = "quoted-printable", help_heading = "Message")]
    text_encoding: String,

    /// Attach a file, as path[@type/subtype] (repeatable)
    #[arg(long, value_name = "FILE", help_heading = "Message")]
    attach: Vec<String>,

    /// Attach a file inline, as path[@type/subtype] (repeatable)
    #[arg(long, value_name = "FILE", help_heading = "Message")]
    attach_inline: Vec<String>,

    /// Add a header line, "Name: value" (repeatable)
    #[arg(long, value_name = "HEADER", help_heading = "Headers")]
    add_header: Vec<String>,

    /// Replace a header, "Name: value" (repeatable)
    #[arg(long, value_name = "HEADER", help_heading = "Headers")]
    replace_header: Vec<String>,

    /// Remove a header by name (repeatable)
    #[arg(long, value_name = "NAME", help_heading = "Headers")]
    remove_header: Vec<String>,

    /// Print the session transcript (-vv for more)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Print the composed message instead of sending it
    #[arg(long)]
    print_only: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("smtp-cli: cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("smtp-cli: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("smtp_cli={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(args: Args) -> SmtpResult<()> {
    let config = build_config(&args)?;
    let composer = ComposerConfig {
        hostname: config.helo_name(),
        charset: args.charset.clone(),
        text_encoding: args.text_encoding.parse::<TransferEncoding>()?,
    };
    let email = build_email(&args).await?;
    let client = SmtpClient::builder(config).composer(composer).build();

    let report = match &args.data {
        Some(source) => {
            let data = read_source(source).await?;
            if args.print_only {
                return write_stdout(&data).await;
            }
            client.send(&email.envelope()?, &data).await?
        }
        None => {
            if args.print_only {
                let message = client.compose(&email)?;
                return write_stdout(message.as_bytes()).await;
            }
            client.send_email(&email).await?
        }
    };

    log_report(&report);
    Ok(())
}

fn build_config(args: &Args) -> SmtpResult<SmtpConfig> {
    let (host, port) = match &args.server {
        Some(server) => {
            let (host, port) = split_server(server)?;
            (Some(host), port.unwrap_or(args.port))
        }
        None => (None, args.port),
    };

    let mode = if args.ssl || (port == IMPLICIT_TLS_PORT && !args.disable_ssl) {
        TlsMode::Implicit
    } else if args.disable_starttls {
        TlsMode::None
    } else if args.require_tls {
        TlsMode::StartTlsRequired
    } else {
        TlsMode::StartTls
    };

    let mut tls = TlsConfig::builder().mode(mode);
    if let Some(file) = &args.ssl_ca_file {
        tls = tls.ca_file(file.clone());
    }
    if let Some(dir) = &args.ssl_ca_path {
        tls = tls.ca_path(dir.clone());
    }

    let family = if args.ipv4 {
        NetworkFamily::V4
    } else if args.ipv6 {
        NetworkFamily::V6
    } else {
        NetworkFamily::Any
    };

    let mut builder = SmtpConfig::builder()
        .port(port)
        .family(family)
        .disable_ehlo(args.disable_ehlo)
        .tls(tls.build()?)
        .auth_mechanisms(allowed_mechanisms(args))
        .connect_timeout(args.connect_timeout)
        .command_timeout(args.command_timeout);

    if let Some(host) = host {
        builder = builder.host(host);
    }
    if let Some(addr) = &args.local_addr {
        builder = builder.local_addr(parse_local_addr(addr)?);
    }
    if let Some(name) = &args.hello_host {
        builder = builder.helo_name(name.clone());
    }

    builder = match (&args.user, &args.pass) {
        (Some(user), Some(pass)) => builder.credentials(user.clone(), pass.clone()),
        (Some(_), None) => return Err(SmtpError::configuration("--user requires --pass")),
        (None, Some(_)) => return Err(SmtpError::configuration("--pass requires --user")),
        (None, None) => builder,
    };

    builder.build()
}

/// An empty list allows every mechanism.
fn allowed_mechanisms(args: &Args) -> Vec<AuthMechanism> {
    if args.auth {
        return Vec::new();
    }
    [
        (args.auth_plain, AuthMechanism::Plain),
        (args.auth_login, AuthMechanism::Login),
        (args.auth_cram_md5, AuthMechanism::CramMd5),
    ]
    .into_iter()
    .filter_map(|(enabled, mechanism)| enabled.then_some(mechanism))
    .collect()
}

fn addresses(values: &[String]) -> impl Iterator<Item = &str> {
    values.iter().map(|v| v.trim()).filter(|v| !v.is_empty())
}

async fn build_email(args: &Args) -> SmtpResult<Email> {
    let mut builder = Email::builder();

    if let Some(from) = &args.from {
        builder = builder.from(from.as_str())?;
    }
    for address in addresses(&args.to) {
        builder = builder.to(address)?;
    }
    for address in addresses(&args.cc) {
        builder = builder.cc(address)?;
    }
    for address in addresses(&args.bcc) {
        builder = builder.bcc(address)?;
    }
    if let Some(subject) = &args.subject {
        builder = builder.subject(subject.clone());
    }

    // A pre-formed message carries its own content
    if args.data.is_none() {
        if let Some(body) = &args.body_plain {
            builder = builder.body_plain(body_content(body).await?);
        }
        if let Some(body) = &args.body_html {
            builder = builder.body_html(body_content(body).await?);
        }
        for spec in &args.attach {
            builder = builder.attachment(read_attachment(spec, false).await?);
        }
        for spec in &args.attach_inline {
            builder = builder.inline(read_attachment(spec, true).await?);
        }
    }

    for line in &args.add_header {
        builder = builder.add_header(line.clone());
    }
    for line in &args.replace_header {
        let (name, value) = parse_header_line(line)?;
        builder = builder.replace_header(name, value);
    }
    for name in &args.remove_header {
        builder = builder.remove_header(name.trim().to_string());
    }

    if let Some(sender) = &args.mail_from {
        builder = builder.mail_from(sender.clone());
    }
    for recipient in addresses(&args.rcpt_to) {
        builder = builder.rcpt_to(recipient);
    }

    builder.build()
}

async fn write_stdout(bytes: &[u8]) -> SmtpResult<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(bytes).await.map_err(output_error)?;
    stdout.flush().await.map_err(output_error)
}

fn output_error(e: std::io::Error) -> SmtpError {
    SmtpError::new(SmtpErrorKind::Compose, "Cannot write to standard output").with_cause(e)
}

fn log_report(report: &SendReport) {
    tracing::info!(
        server = %report.server,
        recipients = report.accepted.len(),
        tls = report.tls,
        mechanism = ?report.mechanism,
        elapsed = %humantime::format_duration(report.duration),
        "Message accepted: {}",
        report.response
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("smtp-cli").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_server_port_overrides_port_flag() {
        let config = build_config(&parse(&["--server", "mx.example.com:2525", "--port", "26"])).unwrap();
        assert_eq!(config.host.as_deref(), Some("mx.example.com"));
        assert_eq!(config.port, 2525);
        assert_eq!(config.tls.mode, TlsMode::StartTls);
    }

    #[test]
    fn test_port_465_implies_implicit_tls() {
        let config = build_config(&parse(&["--server", "mx.example.com", "--port", "465"])).unwrap();
        assert_eq!(config.tls.mode, TlsMode::Implicit);

        let config = build_config(&parse(&[
            "--server",
            "mx.example.com:465",
            "--disable-ssl",
        ]))
        .unwrap();
        assert_eq!(config.tls.mode, TlsMode::StartTls);
    }

    #[test]
    fn test_tls_switches() {
        let config = build_config(&parse(&["--disable-starttls"])).unwrap();
        assert_eq!(config.tls.mode, TlsMode::None);

        let config = build_config(&parse(&["--require-tls"])).unwrap();
        assert_eq!(config.tls.mode, TlsMode::StartTlsRequired);

        assert!(Args::try_parse_from(["smtp-cli", "--require-tls", "--disable-starttls"]).is_err());
    }

    #[test]
    fn test_auth_switches() {
        assert!(allowed_mechanisms(&parse(&[])).is_empty());
        assert_eq!(
            allowed_mechanisms(&parse(&["--auth-login", "--auth-cram-md5"])),
            vec![AuthMechanism::Login, AuthMechanism::CramMd5]
        );
        assert!(allowed_mechanisms(&parse(&["--auth", "--auth-plain"])).is_empty());
    }

    #[test]
    fn test_user_requires_pass() {
        let err = build_config(&parse(&["--user", "alice"])).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_build_email_splits_recipients() {
        let args = parse(&[
            "--from",
            "Alice <alice@example.com>",
            "--to",
            "bob@example.com, carol@example.com",
            "--to",
            "dave@example.com",
            "--bcc",
            "eve@example.com",
            "--subject",
            "Hello",
            "--body-plain",
            "Hi all",
        ]);
        let email = build_email(&args).await.unwrap();

        assert_eq!(email.to.len(), 3);
        assert_eq!(email.to[1].email, "carol@example.com");

        let envelope = email.envelope().unwrap();
        assert_eq!(envelope.sender, "alice@example.com");
        assert_eq!(
            envelope.recipients,
            vec![
                "bob@example.com",
                "carol@example.com",
                "dave@example.com",
                "eve@example.com"
            ]
        );
    }

    #[tokio::test]
    async fn test_build_email_envelope_overrides() {
        let args = parse(&[
            "--from",
            "alice@example.com",
            "--to",
            "bob@example.com",
            "--mail-from",
            "bounces@example.com",
            "--rcpt-to",
            "archive@example.net",
        ]);
        let envelope = build_email(&args).await.unwrap().envelope().unwrap();
        assert_eq!(envelope.sender, "bounces@example.com");
        assert_eq!(envelope.recipients, vec!["archive@example.net"]);
    }
}
