use std::collections::HashMap;
use std::error::Error as _;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client;
use reqwest::header::USER_AGENT;
use trawl_core::error::{AppError, FailureKind};
use trawl_core::fetch::{EngineError, EngineResponse, FetchRequest};
use trawl_core::traits::{FetchEngine, ProxyProber};
use url::Url;

/// Body fragments that identify a captcha or bot-challenge page.
const CAPTCHA_MARKERS: &[&str] = &[
    "g-recaptcha",
    "h-captcha",
    "cf-chl-",
    "/cdn-cgi/challenge-platform/",
    "captcha-delivery.com",
];

/// HTTP fetch engine using reqwest.
///
/// One client per proxy address is built lazily and reused. SSRF protection
/// is **enabled** by default: requests to private/reserved IP ranges are
/// refused. Use [`allow_private_urls`](Self::allow_private_urls) to disable
/// it (e.g. for CLI usage where the user controls the machine).
#[derive(Clone)]
pub struct ReqwestEngine {
    name: String,
    timeout: Duration,
    ssrf_protection: bool,
    direct: Client,
    proxied: Arc<Mutex<HashMap<String, Client>>>,
}

impl ReqwestEngine {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            name: "http".into(),
            timeout,
            ssrf_protection: true,
            direct: build_client(timeout, None)?,
            proxied: Arc::default(),
        })
    }

    /// Register under a different engine name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, EngineError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let mut clients = self.proxied.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Proxy client cache lock was poisoned, recovering");
            poisoned.into_inner()
        });
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_client(self.timeout, Some(proxy))
            .map_err(|e| EngineError::new(FailureKind::Connection, e.to_string()))?;
        clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

fn build_client(timeout: Duration, proxy: Option<&str>) -> Result<Client, AppError> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(10));
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| AppError::HttpError(format!("Invalid proxy '{proxy}': {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| AppError::HttpError(e.to_string()))
}

impl FetchEngine for ReqwestEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&self, request: &FetchRequest) -> Result<EngineResponse, EngineError> {
        if self.ssrf_protection {
            validate_url(&request.url, request.proxy.is_some()).await?;
        }

        let client = self.client_for(request.proxy.as_deref())?;
        let mut builder = client
            .get(&request.url)
            .header(USER_AGENT, &request.user_agent)
            .timeout(request.remaining());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify_error)?;
        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| {
            let mut err = classify_error(e);
            err.message = format!("Failed to read response body: {}", err.message);
            err
        })?;

        if let Some(marker) = detect_captcha(status_code, &body) {
            return Err(EngineError::new(
                FailureKind::Captcha,
                format!("challenge page ({marker}) at {final_url}"),
            ));
        }

        Ok(EngineResponse {
            status_code,
            body,
            final_url,
        })
    }
}

fn classify_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        return EngineError::new(FailureKind::Timeout, e.to_string());
    }
    if e.is_builder() {
        return EngineError::new(FailureKind::MalformedUrl, e.to_string());
    }
    if is_dns_failure(&e) {
        return EngineError::new(FailureKind::DnsNotFound, e.to_string());
    }
    if e.is_redirect() {
        return EngineError::new(FailureKind::ClientError(310), e.to_string());
    }
    EngineError::new(FailureKind::Connection, e.to_string())
}

/// reqwest does not expose resolver failures as a kind; walk the source chain.
fn is_dns_failure(e: &reqwest::Error) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        let text = err.to_string().to_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = err.source();
    }
    false
}

/// Challenge pages come back as 200, 403, 429 or 503.
pub(crate) fn detect_captcha(status: u16, body: &str) -> Option<&'static str> {
    if !matches!(status, 200..=299 | 403 | 429 | 503) {
        return None;
    }
    CAPTCHA_MARKERS.iter().copied().find(|m| body.contains(m))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL before fetching it.
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
///
/// Behind a proxy the proxy resolves the host, so only literal IP hosts are
/// checked. The lookup here is separate from the one reqwest does on connect:
/// a host that re-resolves to a private address in between (DNS rebinding)
/// is not caught.
async fn validate_url(url: &str, via_proxy: bool) -> Result<(), EngineError> {
    let parsed = Url::parse(url)
        .map_err(|e| EngineError::new(FailureKind::MalformedUrl, format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(EngineError::new(
                FailureKind::MalformedUrl,
                format!("URL scheme '{scheme}' is not allowed (only http/https)"),
            ));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| EngineError::new(FailureKind::MalformedUrl, "URL has no host"))?;
    let blocked = |ip: IpAddr| {
        EngineError::new(
            FailureKind::ClientError(403),
            format!("SSRF blocked: {host} resolves to private/reserved IP {ip}"),
        )
    };

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(blocked(ip));
        }
        return Ok(());
    }
    if via_proxy {
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            EngineError::new(
                FailureKind::DnsNotFound,
                format!("DNS resolution failed for {host}: {e}"),
            )
        })?
        .collect();

    if addrs.is_empty() {
        return Err(EngineError::new(
            FailureKind::DnsNotFound,
            format!("DNS resolution returned no addresses for {host}"),
        ));
    }
    match addrs.iter().find(|a| is_private_ip(a.ip())) {
        Some(addr) => Err(blocked(addr.ip())),
        None => Ok(()),
    }
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy probing
// ---------------------------------------------------------------------------

/// Probes a proxy by requesting a known endpoint through it.
#[derive(Clone)]
pub struct HttpProxyProber {
    target: String,
    timeout: Duration,
}

impl HttpProxyProber {
    pub const DEFAULT_TARGET: &'static str = "https://httpbin.org/ip";

    pub fn new() -> Self {
        Self::with_target(Self::DEFAULT_TARGET, Duration::from_secs(10))
    }

    pub fn with_target(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

impl Default for HttpProxyProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyProber for HttpProxyProber {
    async fn probe(&self, proxy: &str) -> bool {
        let client = match build_client(self.timeout, Some(proxy)) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(proxy, error = %e, "Proxy probe setup failed");
                return false;
            }
        };
        match client.get(&self.target).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(proxy, error = %e, "Proxy probe failed");
                false
            }
        }
    }
}
