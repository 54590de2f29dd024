use std::path::PathBuf;
use std::sync::Arc;

use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use trawl_core::error::{AppError, FailureKind};
use trawl_core::fetch::{EngineError, EngineResponse, FetchRequest};
use trawl_core::traits::FetchEngine;

use crate::http::detect_captcha;

/// Headless-browser engine using Chromium via the Chrome DevTools Protocol.
///
/// Renders JavaScript before returning the DOM, for SPAs and lazy-loaded
/// pages. One Chromium process is shared across clones; every attempt opens
/// a tab and closes it afterwards.
///
/// The proxy is fixed at launch ([`launch_with_proxy`](Self::launch_with_proxy));
/// per-request proxies from the dispatcher are not applied.
#[derive(Clone)]
pub struct BrowserEngine {
    browser: Arc<Browser>,
}

impl BrowserEngine {
    pub async fn launch() -> Result<Self, AppError> {
        Self::launch_inner(None).await
    }

    pub async fn launch_with_proxy(proxy: &str) -> Result<Self, AppError> {
        Self::launch_inner(Some(proxy)).await
    }

    async fn launch_inner(proxy: Option<&str>) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
        if let Some(bin) = find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }
        if let Some(proxy) = proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::Generic(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
        })
    }

    async fn render(&self, request: &FetchRequest) -> Result<EngineResponse, EngineError> {
        let nav_error =
            |e: chromiumoxide::error::CdpError| EngineError::new(FailureKind::Connection, e.to_string());

        let page = self.browser.new_page("about:blank").await.map_err(nav_error)?;
        page.set_user_agent(SetUserAgentOverrideParams::new(request.user_agent.clone()))
            .await
            .map_err(nav_error)?;
        page.goto(request.url.as_str()).await.map_err(nav_error)?;
        page.find_element("body").await.map_err(nav_error)?;

        let body = page.content().await.map_err(nav_error)?;
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| request.url.clone());
        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "Failed to close browser tab");
        }

        // CDP navigation does not surface the status; a rendered DOM counts as 200.
        if let Some(marker) = detect_captcha(200, &body) {
            return Err(EngineError::new(
                FailureKind::Captcha,
                format!("challenge page ({marker}) at {final_url}"),
            ));
        }
        Ok(EngineResponse::ok(body, final_url))
    }
}

impl FetchEngine for BrowserEngine {
    fn name(&self) -> &str {
        "browser"
    }

    async fn perform(&self, request: &FetchRequest) -> Result<EngineResponse, EngineError> {
        if request.proxy.is_some() {
            tracing::debug!(url = %request.url, "Browser engine ignores per-request proxy");
        }
        match tokio::time::timeout(request.remaining(), self.render(request)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::new(
                FailureKind::Timeout,
                format!("browser render of {} timed out", request.url),
            )),
        }
    }
}

/// Locate a real Chrome/Chromium binary. `CHROME_BIN` wins; the snap
/// wrapper at `/snap/bin/chromium` strips headless flags, so the binary
/// inside the snap is preferred over it.
fn find_chrome_binary() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    CANDIDATES.iter().map(PathBuf::from).find(|p| p.exists())
}
