//! Scraper Driver (C2): a thin, carrier-agnostic wrapper over a headless
//! Chrome session.
//!
//! Every carrier adapter drives the same small surface — navigate, inject a
//! script, wait for a DOM condition, evaluate an expression, close — so that
//! carrier-specific logic (C3) never touches `chromiumoxide` directly.

use std::time::Duration;

use chromiumoxide::Browser;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::proxy::config::ProxyConfig;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("navigation to {url} timed out or failed: {source}")]
    Navigate { url: String, source: anyhow::Error },
    #[error("proxy timed out")]
    ProxyTimeout,
    #[error("timed out waiting for page readiness")]
    PageWaitTimeout,
    #[error("script evaluation failed: {0}")]
    Evaluate(String),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Page-load/element-wait budgets, set once per session (§4.2: "incognito,
/// images disabled, certificate errors ignored, page-load timeout, retry=3").
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub nav_timeout: Duration,
    pub nav_retries: u32,
    pub disable_images: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            nav_timeout: Duration::from_secs(10),
            nav_retries: 3,
            disable_images: true,
        }
    }
}

/// A single headless-browser session plus the background handler task
/// `chromiumoxide` requires to drive its event loop.
pub struct ScraperDriver {
    browser: Browser,
    handler: Option<JoinHandle<()>>,
    page: Option<Page>,
    settings: DriverSettings,
    scripts_loaded: bool,
}

impl ScraperDriver {
    pub async fn launch(settings: DriverSettings, proxy: Option<&ProxyConfig>) -> DriverResult<Self> {
        let mut builder = BrowserConfig::builder()
            .incognito()
            .args(vec!["--ignore-certificate-errors", "--disable-gpu"]);
        if settings.disable_images {
            builder = builder.args(vec!["--blink-settings=imagesEnabled=false"]);
        }
        if let Some(proxy) = proxy {
            builder = builder.args(vec![format!("--proxy-server={}", proxy.to_host_port())]);
        }
        let config = builder
            .build()
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let (browser, mut handler_events) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move { while handler_events.next().await.is_some() {} });

        Ok(Self {
            browser,
            handler: Some(handler),
            page: None,
            settings,
            scripts_loaded: false,
        })
    }

    /// Navigate to `url`, retrying up to `nav_retries` times on failure.
    /// Proxy-induced timeouts are surfaced distinctly so carrier adapters
    /// can classify them as `ProxyTimeout` rather than a generic crash.
    pub async fn open(&mut self, url: &str) -> DriverResult<()> {
        self.scripts_loaded = false;
        let mut last_err = None;
        for attempt in 0..=self.settings.nav_retries {
            let page_result = tokio::time::timeout(self.settings.nav_timeout, async {
                let page = self.browser.new_page(url).await?;
                page.wait_for_navigation().await?;
                Ok::<_, anyhow::Error>(page)
            })
            .await;

            match page_result {
                Ok(Ok(page)) => {
                    self.page = Some(page);
                    return Ok(());
                }
                Ok(Err(source)) => last_err = Some(source),
                Err(_elapsed) => {
                    if attempt == self.settings.nav_retries {
                        return Err(DriverError::ProxyTimeout);
                    }
                    continue;
                }
            }
        }
        Err(DriverError::Navigate {
            url: url.to_string(),
            source: last_err.unwrap_or_else(|| anyhow::anyhow!("navigation failed")),
        })
    }

    fn page(&self) -> DriverResult<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| DriverError::Evaluate("no page loaded".into()))
    }

    /// Inject a script once per page load. Detected via the sentinel node
    /// `#op-token-elem` the scripts themselves stamp into the DOM.
    pub async fn inject(&mut self, script: &str) -> DriverResult<()> {
        if self.scripts_loaded {
            return Ok(());
        }
        self.page()?
            .evaluate(script)
            .await
            .map_err(|e| DriverError::Evaluate(e.to_string()))?;
        let marker = self
            .page()?
            .find_element("#op-token-elem")
            .await;
        if marker.is_ok() {
            self.scripts_loaded = true;
        }
        Ok(())
    }

    /// Resolve when any of `selectors` appears in the DOM, returning its
    /// index. Repeats transparently once on a mid-wait redirect: if the
    /// page's URL changed between the start of the wait and the deadline,
    /// that's a navigation the selectors raced against, so the wait is
    /// restarted with a fresh deadline exactly once.
    pub async fn wait_for_any(
        &self,
        selectors: &[&str],
        timeout: Duration,
    ) -> DriverResult<usize> {
        let page = self.page()?;
        let mut deadline = tokio::time::Instant::now() + timeout;
        let mut redirected_once = false;
        let mut url_at_wait_start = page.url().await.ok().flatten();
        loop {
            for (idx, selector) in selectors.iter().enumerate() {
                if page.find_element(selector).await.is_ok() {
                    return Ok(idx);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let current_url = page.url().await.ok().flatten();
                if !redirected_once && current_url != url_at_wait_start {
                    redirected_once = true;
                    url_at_wait_start = current_url;
                    deadline = tokio::time::Instant::now() + timeout;
                    continue;
                }
                return Err(DriverError::PageWaitTimeout);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn wait_for_title(&self, substring: &str, timeout: Duration) -> DriverResult<()> {
        let page = self.page()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(Some(title)) = page.get_title().await {
                if title.contains(substring) {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::PageWaitTimeout);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn evaluate(&self, expression: &str) -> DriverResult<Value> {
        let result = self
            .page()?
            .evaluate(expression)
            .await
            .map_err(|e| DriverError::Evaluate(e.to_string()))?;
        result
            .into_value()
            .map_err(|e| DriverError::Evaluate(e.to_string()))
    }

    pub async fn click(&self, selector: &str) -> DriverResult<()> {
        let element = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|e| DriverError::Evaluate(e.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| DriverError::Evaluate(e.to_string()))?;
        Ok(())
    }

    /// Idempotent: safe to call more than once, including after a prior
    /// error path already tore the page down.
    pub async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            let _ = page.close().await;
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        let _ = self.browser.close().await;
    }
}

impl Drop for ScraperDriver {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}
