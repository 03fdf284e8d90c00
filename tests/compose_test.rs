//! Integration tests composing messages from files on disk.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use smtp_cli::input::{body_content, read_attachment};
use smtp_cli::{Composer, ComposerConfig, Email};

fn composer() -> Composer {
    Composer::new(ComposerConfig {
        hostname: "client.test".to_string(),
        ..ComposerConfig::default()
    })
}

/// Returns the body of the part whose headers end with `marker`.
fn part_body<'a>(message: &'a str, marker: &str) -> &'a str {
    let start = message.find(marker).expect("part marker") + marker.len();
    let rest = message[start..]
        .strip_prefix("\r\n")
        .expect("blank line after part headers");
    let end = rest.find("\r\n--").expect("closing boundary");
    &rest[..end]
}

#[tokio::test]
async fn test_file_inputs_round_trip_through_encodings() {
    let dir = tempfile::tempdir().unwrap();

    let text_path = dir.path().join("body.txt");
    let text = "Grüße aus Köln\nZeile zwei = drei\n\tmit Tab am Ende \n";
    std::fs::write(&text_path, text).unwrap();

    let blob_path = dir.path().join("blob.bin");
    let blob: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
    std::fs::write(&blob_path, &blob).unwrap();

    let email = Email::builder()
        .from("Jürgen <juergen@example.com>")
        .unwrap()
        .to("anna@example.com")
        .unwrap()
        .subject("Bericht für März")
        .body_plain(body_content(text_path.to_str().unwrap()).await.unwrap())
        .attachment(
            read_attachment(blob_path.to_str().unwrap(), false)
                .await
                .unwrap(),
        )
        .build()
        .unwrap();

    let message = String::from_utf8(composer().compose(&email).unwrap().into_bytes()).unwrap();
    assert!(message.is_ascii());
    assert!(message.contains("Subject: =?UTF-8?Q?"));
    assert!(message.contains("From: =?UTF-8?Q?J=C3=BCrgen?= <juergen@example.com>\r\n"));

    let qp = part_body(&message, "Content-Transfer-Encoding: quoted-printable\r\n");
    let decoded =
        quoted_printable::decode(qp.as_bytes(), quoted_printable::ParseMode::Strict).unwrap();
    assert_eq!(decoded, text.as_bytes());

    let encoded = part_body(
        &message,
        "Content-Disposition: attachment; filename=\"blob.bin\"\r\n",
    );
    assert!(encoded.split("\r\n").all(|line| line.len() <= 76));
    let decoded = BASE64.decode(encoded.replace("\r\n", "")).unwrap();
    assert_eq!(decoded, blob);
    assert!(message.contains("Content-Type: application/octet-stream; name=\"blob.bin\"\r\n"));
}

#[tokio::test]
async fn test_inline_image_with_type_override() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("logo.img");
    std::fs::write(&image_path, [0x89, b'P', b'N', b'G', 0x0d, 0x0a]).unwrap();

    let spec = format!("{}@image/png", image_path.display());
    let email = Email::builder()
        .from("news@example.com")
        .unwrap()
        .to("reader@example.com")
        .unwrap()
        .body_plain("Logo attached")
        .body_html("<p><img src=\"cid:logo.img\"></p>")
        .inline(read_attachment(&spec, true).await.unwrap())
        .build()
        .unwrap();

    let message = String::from_utf8(composer().compose(&email).unwrap().into_bytes()).unwrap();

    let alternative = message.find("multipart/alternative").unwrap();
    let related = message.find("multipart/related").unwrap();
    let image = message.find("Content-Type: image/png; name=\"logo.img\"").unwrap();
    assert!(alternative < related && related < image);
    assert!(message.contains("Content-ID: <logo.img>\r\n"));
    assert!(message.contains("Content-Disposition: inline; filename=\"logo.img\"\r\n"));
    assert!(!message.contains("multipart/mixed"));
}
