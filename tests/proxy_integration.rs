//! End-to-end test: a real proxy server forwarding plaintext HTTP through a
//! mock upstream proxy, with automatic session management enabled.

use headless_proxy::config::Config;
use headless_proxy::server::{self, ProxyState};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

/// Mock upstream proxy: records the request lines and session headers it
/// sees, replies 200 and issues session ids for create requests.
async fn mock_upstream(seen: Arc<Mutex<Vec<String>>>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 2048];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let request = String::from_utf8_lossy(&request).to_string();
                seen.lock().unwrap().push(request.clone());

                let request = request.to_ascii_lowercase();
                let response = if request.contains("x-crawlera-session: create") {
                    "HTTP/1.1 200 OK\r\nX-Crawlera-Session: sess-1\r\ncontent-length: 5\r\n\r\nhello"
                } else {
                    "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello"
                };
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

/// Reserve an ephemeral port for the proxy listener.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn proxied_get(proxy_addr: SocketAddr, url: &str, host: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: integration-test\r\nConnection: close\r\n\r\n",
        url, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forwards_through_upstream_with_sessions() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let upstream_addr = mock_upstream(seen.clone()).await;

    let config = Config {
        api_key: "integration-key".to_string(),
        bind_port: free_port(),
        crawlera_host: "127.0.0.1".to_string(),
        crawlera_port: upstream_addr.port(),
        ..Config::default()
    };
    let proxy_addr = config.bind();

    let state = ProxyState::new(config).unwrap();
    let shutdown = Arc::new(Notify::new());
    tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(state, shutdown).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // First request creates a session upstream.
    let response = proxied_get(proxy_addr, "http://example.com/page", "example.com").await;
    assert!(response.contains("200 OK"), "unexpected response: {response}");
    assert!(response.ends_with("hello"));

    // Second request reuses the session issued for the first one.
    let response = proxied_get(proxy_addr, "http://example.com/other", "example.com").await;
    assert!(response.contains("200 OK"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);

    // Requests reach the upstream in absolute form with the credential.
    assert!(seen[0].starts_with("GET http://example.com/page HTTP/1.1"));
    let first = seen[0].to_ascii_lowercase();
    assert!(first.contains("proxy-authorization: basic"));
    assert!(first.contains("x-crawlera-session: create"));
    // The synthesized referer falls back to the request URL itself.
    assert!(first.contains("referer: http://example.com/page"));

    let second = seen[1].to_ascii_lowercase();
    assert!(second.contains("x-crawlera-session: sess-1"));

    shutdown.notify_waiters();
}
