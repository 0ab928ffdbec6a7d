//! HttpSender against a local one-shot HTTP server

use postbox::{Envelope, EnvelopeSender, RateLimitHeaders, SendOutcome};
use postbox_http::{HttpSender, HttpSenderConfig};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};

struct Request {
    head: String,
    body: Vec<u8>,
}

/// Accept one connection, answer with `response`, return what was received
fn serve_once(response: &'static str) -> (String, JoinHandle<Request>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/api/1/envelope/", listener.local_addr().unwrap());

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);

        let mut head = String::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap();
            }
            head.push_str(&line);
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();

        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).unwrap();
        stream.flush().unwrap();

        Request { head, body }
    });

    (url, handle)
}

fn envelope() -> Envelope {
    Envelope::from_event(&serde_json::json!({ "message": "over the wire" })).unwrap()
}

#[test]
fn test_posts_envelope_body() {
    let (url, server) = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    let sender = HttpSender::new(HttpSenderConfig {
        auth_key: Some("public-key".to_string()),
        ..HttpSenderConfig::new(url)
    })
    .unwrap();

    let envelope = envelope();
    let body = envelope.to_bytes().unwrap();
    assert_eq!(sender.send(&body), SendOutcome::Success);

    let request = server.join().unwrap();
    let head = request.head.to_ascii_lowercase();
    assert!(head.starts_with("post /api/1/envelope/"));
    assert!(head.contains("content-type: application/x-sentry-envelope"));
    assert!(head.contains("sentry_key=public-key"));
    assert_eq!(Envelope::from_slice(&request.body).unwrap(), envelope);
}

#[test]
fn test_too_many_requests_carries_headers() {
    let (url, server) = serve_once(
        "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 30\r\nX-Sentry-Rate-Limits: 30:error:organization\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    );
    let sender = HttpSender::new(HttpSenderConfig::new(url)).unwrap();

    let outcome = sender.send(&envelope().to_bytes().unwrap());
    assert_eq!(
        outcome,
        SendOutcome::RateLimited(RateLimitHeaders {
            status: 429,
            rate_limits: Some("30:error:organization".to_string()),
            retry_after: Some("30".to_string()),
        })
    );
    server.join().unwrap();
}

#[test]
fn test_server_error_is_not_retried() {
    let (url, server) =
        serve_once("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    let sender = HttpSender::new(HttpSenderConfig::new(url)).unwrap();

    assert_eq!(
        sender.send(&envelope().to_bytes().unwrap()),
        SendOutcome::Failure { retryable: false }
    );
    server.join().unwrap();
}

#[test]
fn test_connection_refused_is_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/api/1/envelope/", listener.local_addr().unwrap());
    drop(listener);

    let sender = HttpSender::new(HttpSenderConfig {
        timeout_secs: 2,
        ..HttpSenderConfig::new(url)
    })
    .unwrap();

    assert_eq!(
        sender.send(b"{}\n"),
        SendOutcome::Failure { retryable: true }
    );
}
