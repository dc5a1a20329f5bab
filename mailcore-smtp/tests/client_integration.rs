//! Integration tests for the SMTP client against a minimal fake server.
//!
//! The fake server below is a line-oriented script runner, not a real SMTP
//! implementation — just enough to exercise the client's read/write loop,
//! multi-line EHLO response parsing, and STARTTLS upgrade.

use std::time::Duration;

use mailcore_smtp::client::{QuitAfter, SmtpClientBuilder};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Starts a fake server that greets, then replies `250 OK` (or the given
/// EHLO response) to every line it reads until the client disconnects.
async fn start_fake_server(ehlo_response: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"220 fake.example.com ESMTP\r\n").await.unwrap();

        let mut line = String::new();
        let mut in_data = false;
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            let upper = line.trim().to_ascii_uppercase();

            if in_data {
                if upper == "." {
                    in_data = false;
                    write_half.write_all(b"250 Message accepted\r\n").await.unwrap();
                }
                continue;
            }

            if upper.starts_with("EHLO") {
                write_half.write_all(ehlo_response.as_bytes()).await.unwrap();
            } else if upper == "QUIT" {
                write_half.write_all(b"221 Bye\r\n").await.unwrap();
                break;
            } else if upper.starts_with("DATA") {
                in_data = true;
                write_half.write_all(b"354 Go ahead\r\n").await.unwrap();
            } else {
                write_half.write_all(b"250 OK\r\n").await.unwrap();
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

#[tokio::test]
async fn connect_reads_the_greeting() {
    let port = start_fake_server("250 fake.example.com\r\n").await;

    let responses = SmtpClientBuilder::new(format!("127.0.0.1:{port}"), "fake.example.com")
        .quit_after(QuitAfter::Connect)
        .execute()
        .await
        .unwrap();

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].code, 220);
}

#[tokio::test]
async fn ehlo_parses_a_multiline_response() {
    let port = start_fake_server("250-fake.example.com\r\n250-STARTTLS\r\n250 SIZE 1000\r\n").await;

    let mut client = mailcore_smtp::client::SmtpClient::connect(
        &format!("127.0.0.1:{port}"),
        "fake.example.com".to_string(),
    )
    .await
    .unwrap();

    client.read_greeting().await.unwrap();
    let response = client.ehlo("client.example.com").await.unwrap();

    assert!(response.is_success());
    assert!(client.extension("STARTTLS").0);
    let (has_size, params) = client.extension("size");
    assert!(has_size);
    assert_eq!(params, "1000");
    assert!(!client.extension("AUTH").0);
}

#[tokio::test]
async fn full_transaction_reaches_quit() {
    let port = start_fake_server("250 fake.example.com\r\n").await;

    let responses = SmtpClientBuilder::new(format!("127.0.0.1:{port}"), "fake.example.com")
        .ehlo("client.example.com")
        .mail_from("sender@example.com")
        .rcpt_to("recipient@example.com")
        .data_with_content("Subject: Test\r\n\r\nHello\r\n")
        .execute()
        .await
        .unwrap();

    assert_eq!(responses.last().unwrap().code, 221);
    assert!(responses.iter().any(|r| r.code == 250));
}

#[tokio::test]
async fn mail_and_rcpt_reports_per_recipient_outcomes() {
    let port = start_fake_server("250 fake.example.com\r\n").await;

    let mut client = mailcore_smtp::client::SmtpClient::connect(
        &format!("127.0.0.1:{port}"),
        "fake.example.com".to_string(),
    )
    .await
    .unwrap();
    client.read_greeting().await.unwrap();
    client.ehlo("client.example.com").await.unwrap();

    let recipients = vec!["a@example.com".to_string(), "b@example.com".to_string()];
    let (mail_response, outcomes) = client
        .mail_and_rcpt("sender@example.com", None, &recipients)
        .await
        .unwrap();

    assert!(mail_response.is_success());
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.is_accepted()));
}

#[tokio::test]
async fn quit_after_mail_from_stops_the_conversation_early() {
    let port = start_fake_server("250 fake.example.com\r\n").await;

    let responses = SmtpClientBuilder::new(format!("127.0.0.1:{port}"), "fake.example.com")
        .ehlo("client.example.com")
        .mail_from("sender@example.com")
        .rcpt_to("recipient@example.com")
        .quit_after(QuitAfter::MailFrom)
        .execute()
        .await
        .unwrap();

    // Greeting + EHLO + MAIL FROM + QUIT; RCPT TO never sent.
    assert_eq!(responses.len(), 4);
    assert_eq!(responses.last().unwrap().code, 221);
}
