use std::time::Duration;

use futures::StreamExt;
use scribe_providers::{
    delta_stream, ChatRequest, Delta, Endpoint, HttpTransport, ProviderError, ProxySettings,
    Transport, TransportSettings,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serves one canned response and hands back the raw request it received.
async fn serve_once(status_line: &str, content_type: &str, body: String) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let response = format!(
        "HTTP/1.1 {status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            if request_complete(&raw) {
                break;
            }
        }
        socket.write_all(response.as_bytes()).await.expect("write");
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&raw).to_string()
    });
    (format!("http://{addr}"), handle)
}

fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(split) = text.find("\r\n\r\n") else {
        return false;
    };
    let length = text[..split]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    raw.len() >= split + 4 + length
}

fn request(url: &str) -> ChatRequest {
    ChatRequest {
        endpoint: Endpoint::parse(Some(url)).expect("endpoint"),
        token: "sk-test-token-123".to_string(),
        body: json!({"model": "gpt-4o-mini", "messages": [], "stream": true}),
    }
}

#[tokio::test]
async fn streams_sse_body_and_sends_expected_headers() {
    let body = [
        r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
        "",
        r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#,
        "",
        "data: [DONE]",
        "",
        "",
    ]
    .join("\n");
    let (url, server) = serve_once("200 OK", "text/event-stream", body).await;
    let transport = HttpTransport::new(&TransportSettings::default()).expect("transport");

    let connection = transport.send(&request(&url)).await.expect("send");
    let mut stream = delta_stream(connection);
    let mut text = String::new();
    while let Some(delta) = stream.next().await.transpose().expect("delta") {
        if let Delta::Text {
            content: Some(content),
            ..
        } = delta
        {
            text.push_str(&content);
        }
    }
    assert_eq!(text, "Hi");

    let raw = server.await.expect("server").to_ascii_lowercase();
    assert!(raw.starts_with("post /v1/chat/completions "));
    assert!(raw.contains("authorization: bearer sk-test-token-123"));
    assert!(raw.contains("content-type: application/json"));
    assert!(raw.contains("cache-control: no-cache"));
}

#[tokio::test]
async fn context_length_error_is_typed() {
    let body = json!({"error": {
        "message": "maximum context length exceeded",
        "type": "invalid_request_error",
        "param": "messages",
        "code": "context_length_exceeded"
    }})
    .to_string();
    let (url, server) = serve_once("400 Bad Request", "application/json", body).await;
    let transport = HttpTransport::new(&TransportSettings::default()).expect("transport");

    let err = match transport.send(&request(&url)).await {
        Ok(_) => panic!("expected an error"),
        Err(err) => err,
    };
    assert!(err.is_context_length_exceeded());
    assert_eq!(err.to_string(), "maximum context length exceeded");
    server.await.expect("server");
}

#[tokio::test]
async fn server_errors_carry_provider_message() {
    let body = json!({"error": {"message": "The server is overloaded", "type": "server_error"}}).to_string();
    let (url, server) = serve_once("503 Service Unavailable", "application/json", body).await;
    let transport = HttpTransport::new(&TransportSettings::default()).expect("transport");

    match transport.send(&request(&url)).await {
        Err(ProviderError::Unknown { status, message }) => {
            assert_eq!(status, Some(503));
            assert_eq!(message, "The server is overloaded");
        }
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("expected an error"),
    }
    server.await.expect("server");
}

#[tokio::test]
async fn https_through_proxy_tunnels_with_basic_auth() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let proxy = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
            .await
            .ok();
        String::from_utf8_lossy(&raw).to_string()
    });
    let settings = TransportSettings {
        proxy: Some(ProxySettings {
            address: "127.0.0.1".to_string(),
            port,
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
        }),
        ..TransportSettings::default()
    };
    let transport = HttpTransport::new(&settings).expect("transport");

    assert!(transport
        .send(&request("https://api.example.com"))
        .await
        .is_err());

    let raw = proxy.await.expect("proxy");
    assert!(raw.starts_with("CONNECT api.example.com:443 HTTP/1.1\r\n"), "{raw}");
    assert!(raw
        .lines()
        .any(|line| line.eq_ignore_ascii_case("proxy-authorization: Basic dXNlcjpzZWNyZXQ=")));
}

#[tokio::test]
async fn stalled_body_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        while !request_complete(&raw) {
            let n = socket.read(&mut buf).await.expect("read");
            if n == 0 {
                return;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n")
            .await
            .expect("write");
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    let settings = TransportSettings {
        read_timeout: Duration::from_millis(200),
        ..TransportSettings::default()
    };
    let transport = HttpTransport::new(&settings).expect("transport");

    let connection = transport
        .send(&request(&format!("http://{addr}")))
        .await
        .expect("headers arrive in time");
    let mut stream = delta_stream(connection);
    let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("read timeout never fired");
    match next {
        Some(Err(ProviderError::Unknown { message, .. })) => {
            assert!(message.contains("timed out"), "{message}");
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
    server.abort();
}
