//! Integration tests driving the client against a scripted SMTP server.

use std::sync::Arc;
use std::time::Duration;

use smtp_cli::protocol::dot_unstuff;
use smtp_cli::{
    AuthMechanism, ComposerConfig, Email, Envelope, SmtpClient, SmtpConfig, SmtpErrorKind,
    TlsMode, TranscriptObserver, TransferEncoding,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Received {
    commands: Vec<String>,
    payload: Vec<u8>,
}

impl Received {
    fn verbs(&self) -> Vec<String> {
        self.commands
            .iter()
            .map(|c| c.split_whitespace().next().unwrap_or("").to_ascii_uppercase())
            .collect()
    }

    fn body(&self) -> Vec<u8> {
        dot_unstuff(&self.payload).expect("end of data marker")
    }
}

/// Accepts one connection, sends `greeting`, then answers each command line
/// with `reply(line)`. The end of DATA is answered with `reply(".")`.
async fn start_server<F>(greeting: &'static str, reply: F) -> (u16, JoinHandle<Received>)
where
    F: Fn(&str) -> String + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut received = Received::default();

        write.write_all(greeting.as_bytes()).await.unwrap();

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let command = line.trim_end().to_string();
            received.commands.push(command.clone());

            if command.eq_ignore_ascii_case("DATA") {
                write
                    .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                    .await
                    .unwrap();
                loop {
                    let mut data_line = Vec::new();
                    if reader.read_until(b'\n', &mut data_line).await.unwrap() == 0 {
                        return received;
                    }
                    received.payload.extend_from_slice(&data_line);
                    if data_line == b".\r\n" {
                        break;
                    }
                }
                write.write_all(reply(".").as_bytes()).await.unwrap();
                continue;
            }

            write.write_all(reply(&command).as_bytes()).await.unwrap();
            if command.eq_ignore_ascii_case("QUIT") {
                break;
            }
        }
        received
    });

    (port, handle)
}

const GREETING: &str = "220 mx.test ESMTP ready\r\n";

fn verb(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

fn standard_reply(command: &str) -> String {
    match verb(command).as_str() {
        "EHLO" => "250-mx.test greets client.test\r\n250-PIPELINING\r\n250-8BITMIME\r\n250 AUTH PLAIN LOGIN CRAM-MD5\r\n",
        "HELO" => "250 mx.test\r\n",
        "AUTH" => "235 2.7.0 Authentication successful\r\n",
        "MAIL" | "RCPT" => "250 2.1.0 Ok\r\n",
        "." => "250 2.0.0 Ok: queued as 4F2A\r\n",
        "QUIT" => "221 2.0.0 Bye\r\n",
        _ => "502 5.5.2 Command not recognized\r\n",
    }
    .to_string()
}

fn config(port: u16) -> smtp_cli::SmtpConfigBuilder {
    SmtpConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .helo_name("client.test")
        .no_tls()
        .command_timeout(Duration::from_secs(5))
}

fn email() -> Email {
    Email::builder()
        .from("Alice <alice@example.com>")
        .unwrap()
        .to("bob@example.com")
        .unwrap()
        .subject("Integration")
        .body_plain("Hello Bob,\n.signature follows\n")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_send_composed_message() {
    let (port, server) = start_server(GREETING, standard_reply).await;
    let client = SmtpClient::new(config(port).build().unwrap());

    let report = client.send_email(&email()).await.unwrap();
    let received = server.await.unwrap();

    assert_eq!(
        received.commands,
        vec![
            "EHLO client.test",
            "MAIL FROM:<alice@example.com>",
            "RCPT TO:<bob@example.com>",
            "DATA",
            "QUIT"
        ]
    );
    assert_eq!(report.accepted, vec!["bob@example.com"]);
    assert_eq!(report.response, "Ok: queued as 4F2A");
    assert_eq!(report.server, "127.0.0.1");
    assert!(!report.tls);
    assert!(report.mechanism.is_none());

    let body = String::from_utf8(received.body()).unwrap();
    assert!(body.contains("Subject: Integration\r\n"));
    assert!(body.contains("MIME-Version: 1.0\r\n"));
}

#[tokio::test]
async fn test_body_survives_dot_transparency() {
    let (port, server) = start_server(GREETING, standard_reply).await;
    let client = SmtpClient::builder(config(port).build().unwrap())
        .composer(ComposerConfig {
            hostname: "client.test".to_string(),
            charset: "UTF-8".to_string(),
            text_encoding: TransferEncoding::EightBit,
        })
        .build();

    let email = Email::builder()
        .from("alice@example.com")
        .unwrap()
        .to("bob@example.com")
        .unwrap()
        .body_plain("Hello Bob,\r\n.signature follows\r\n.\r\n")
        .build()
        .unwrap();
    let message = client.compose(&email).unwrap();
    let envelope = email.envelope().unwrap();
    client.send(&envelope, message.as_bytes()).await.unwrap();

    let received = server.await.unwrap();
    assert!(received
        .payload
        .windows(4)
        .any(|w| w == b"\n..s"));

    let sent = message.as_bytes();
    assert_eq!(received.body(), sent.strip_suffix(b"\r\n").unwrap_or(sent));
}

#[tokio::test]
async fn test_auth_plain_with_restricted_mechanisms() {
    let (port, server) = start_server(GREETING, standard_reply).await;
    let transcript = Arc::new(TranscriptObserver::new());
    let client = SmtpClient::builder(
        config(port)
            .credentials("user", "password")
            .auth_mechanisms([AuthMechanism::Plain])
            .build()
            .unwrap(),
    )
    .observer(transcript.clone())
    .build();

    let report = client.send_email(&email()).await.unwrap();
    let received = server.await.unwrap();

    assert_eq!(report.mechanism, Some(AuthMechanism::Plain));
    assert_eq!(received.commands[1], "AUTH PLAIN AHVzZXIAcGFzc3dvcmQ=");
    assert!(transcript
        .commands()
        .contains(&"AUTH PLAIN [credentials]".to_string()));
    assert!(!transcript.lines().iter().any(|l| l.contains("AHVzZXIA")));
}

#[tokio::test]
async fn test_auth_login_exchange() {
    let (port, server) = start_server(GREETING, |command: &str| match command {
        "AUTH LOGIN" => "334 VXNlcm5hbWU6\r\n".to_string(),
        "dXNlcg==" => "334 UGFzc3dvcmQ6\r\n".to_string(),
        "cGFzc3dvcmQ=" => "235 2.7.0 Accepted\r\n".to_string(),
        other => standard_reply(other),
    })
    .await;
    let client = SmtpClient::new(
        config(port)
            .credentials("user", "password")
            .auth_mechanisms([AuthMechanism::Login])
            .build()
            .unwrap(),
    );

    let report = client.send_email(&email()).await.unwrap();
    let received = server.await.unwrap();

    assert_eq!(report.mechanism, Some(AuthMechanism::Login));
    assert_eq!(
        &received.commands[1..4],
        &["AUTH LOGIN", "dXNlcg==", "cGFzc3dvcmQ="]
    );
}

#[tokio::test]
async fn test_helo_fallback_then_auth_fails() {
    let (port, server) = start_server(GREETING, |command: &str| match verb(command).as_str() {
        "EHLO" => "500 5.5.1 Unrecognized command\r\n".to_string(),
        _ => standard_reply(command),
    })
    .await;
    let client = SmtpClient::new(
        config(port)
            .credentials("user", "password")
            .build()
            .unwrap(),
    );

    let err = client.send_email(&email()).await.unwrap_err();
    let received = server.await.unwrap();

    assert_eq!(err.kind(), SmtpErrorKind::Auth);
    assert!(err.to_string().contains("no mechanisms available"));
    assert_eq!(received.verbs(), vec!["EHLO", "HELO", "QUIT"]);
}

#[tokio::test]
async fn test_helo_fallback_without_credentials_sends() {
    let (port, server) = start_server(GREETING, |command: &str| match verb(command).as_str() {
        "EHLO" => "502 5.5.2 Not implemented\r\n".to_string(),
        _ => standard_reply(command),
    })
    .await;
    let client = SmtpClient::new(config(port).build().unwrap());

    client.send_email(&email()).await.unwrap();
    let received = server.await.unwrap();

    assert_eq!(
        received.verbs(),
        vec!["EHLO", "HELO", "MAIL", "RCPT", "DATA", "QUIT"]
    );
}

#[tokio::test]
async fn test_disable_ehlo_sends_helo_only() {
    let (port, server) = start_server(GREETING, standard_reply).await;
    let client = SmtpClient::new(config(port).disable_ehlo(true).build().unwrap());

    client.send_email(&email()).await.unwrap();
    let received = server.await.unwrap();

    assert_eq!(received.commands[0], "HELO client.test");
    assert!(!received.verbs().contains(&"EHLO".to_string()));
}

#[tokio::test]
async fn test_bad_greeting_sends_nothing() {
    let (port, server) = start_server("554 5.3.2 No service\r\n", standard_reply).await;
    let client = SmtpClient::new(config(port).build().unwrap());

    let err = client.send_email(&email()).await.unwrap_err();
    let received = server.await.unwrap();

    assert_eq!(err.kind(), SmtpErrorKind::Connection);
    assert_eq!(err.smtp_code(), Some(554));
    assert!(err.to_string().contains("No service"));
    assert!(received.commands.is_empty());
}

#[tokio::test]
async fn test_rejected_recipient_skips_data() {
    let (port, server) = start_server(GREETING, |command: &str| {
        if command == "RCPT TO:<nobody@example.com>" {
            "550 5.1.1 <nobody@example.com>: Recipient address rejected\r\n".to_string()
        } else {
            standard_reply(command)
        }
    })
    .await;
    let client = SmtpClient::new(config(port).build().unwrap());

    let envelope = Envelope::new(
        "alice@example.com",
        vec![
            "bob@example.com".to_string(),
            "nobody@example.com".to_string(),
        ],
    )
    .unwrap();
    let err = client
        .send(&envelope, b"Subject: x\r\n\r\nbody\r\n")
        .await
        .unwrap_err();
    let received = server.await.unwrap();

    assert_eq!(err.kind(), SmtpErrorKind::Rejected);
    assert_eq!(err.smtp_code(), Some(550));
    assert!(err.message().contains("nobody@example.com"));
    assert_eq!(received.verbs(), vec!["EHLO", "MAIL", "RCPT", "RCPT", "QUIT"]);
    assert!(received.payload.is_empty());
}

#[tokio::test]
async fn test_final_reply_rejection() {
    let (port, server) = start_server(GREETING, |command: &str| match command {
        "." => "554 5.7.1 Message rejected as spam\r\n".to_string(),
        other => standard_reply(other),
    })
    .await;
    let client = SmtpClient::new(config(port).build().unwrap());

    let err = client.send_email(&email()).await.unwrap_err();
    let received = server.await.unwrap();

    assert_eq!(err.kind(), SmtpErrorKind::Transfer);
    assert_eq!(err.smtp_code(), Some(554));
    assert_eq!(err.server_text(), Some("Message rejected as spam"));
    assert_eq!(received.verbs().last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_required_tls_without_starttls() {
    let (port, server) = start_server(GREETING, standard_reply).await;
    let client = SmtpClient::new(
        config(port)
            .tls_mode(TlsMode::StartTlsRequired)
            .credentials("user", "password")
            .build()
            .unwrap(),
    );

    let err = client.send_email(&email()).await.unwrap_err();
    let received = server.await.unwrap();

    assert_eq!(err.kind(), SmtpErrorKind::Tls);
    assert_eq!(received.verbs(), vec!["EHLO", "QUIT"]);
}

#[tokio::test]
async fn test_refused_starttls_is_a_warning() {
    let (port, server) = start_server(GREETING, |command: &str| match verb(command).as_str() {
        "EHLO" => "250-mx.test\r\n250 STARTTLS\r\n".to_string(),
        "STARTTLS" => "454 4.7.0 TLS not available\r\n".to_string(),
        _ => standard_reply(command),
    })
    .await;
    let transcript = Arc::new(TranscriptObserver::new());
    let client = SmtpClient::builder(config(port).tls_mode(TlsMode::StartTls).build().unwrap())
        .observer(transcript.clone())
        .build();

    let report = client.send_email(&email()).await.unwrap();
    let received = server.await.unwrap();

    assert!(!report.tls);
    assert_eq!(
        received.verbs(),
        vec!["EHLO", "STARTTLS", "MAIL", "RCPT", "DATA", "QUIT"]
    );
    assert_eq!(transcript.warnings().len(), 1);
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(stream);
    });

    let client = SmtpClient::new(
        config(port)
            .command_timeout(Duration::from_millis(200))
            .build()
            .unwrap(),
    );

    let err = client.send_email(&email()).await.unwrap_err();
    assert_eq!(err.kind(), SmtpErrorKind::Timeout);
    server.abort();
}
