use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use trawl_client::ReqwestEngine;
use trawl_core::dispatcher::FetchDispatcher;
use trawl_core::rate_limit::{RateLimitConfig, RateLimiter};
use trawl_core::retry::RetryPolicy;
use trawl_core::robots::{RobotsCache, RobotsConfig};
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ROBOTS: &str = "User-agent: *\nDisallow: /private\n";

/// A wiremock server that already serves `ROBOTS`.
pub async fn server_with_robots() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ROBOTS))
        .mount(&server)
        .await;
    server
}

/// Dispatcher over a real HTTP engine with fast pacing and backoff.
pub fn dispatcher() -> FetchDispatcher<ReqwestEngine> {
    let engine = ReqwestEngine::with_timeout(Duration::from_secs(5))
        .expect("client")
        .allow_private_urls();
    FetchDispatcher::new(engine)
        .with_robots(Arc::new(RobotsCache::new(RobotsConfig::default())))
        .with_rate_limiter(Arc::new(RateLimiter::new(RateLimitConfig::new(
            Duration::ZERO,
            0,
        ))))
        .with_retry_policy(
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50))
                .with_jitter(0.0),
        )
}

/// Raw HTTP server that 404s `/robots.txt` and stalls every other response
/// after the headers and a few body bytes.
pub async fn stalled_body_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                if request.starts_with("GET /robots.txt") {
                    let _ = socket
                        .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    return;
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 4096\r\n\r\n<html><body>")
                    .await;
                tokio::time::sleep(Duration::from_secs(10)).await;
            });
        }
    });
    format!("http://{addr}")
}
