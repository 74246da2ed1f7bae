use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapter::RenderedPage;
use crate::error::ScrapeError;
use crate::session::{BrowserEngine, BrowserSession};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Flags that strip the obvious automation markers from the chromium
/// process. Content-level detection is still scanned for after every
/// navigation in `SessionManager`.
const STEALTH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-infobars",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-dev-shm-usage",
];

/// Headless-chromium implementation of `BrowserEngine`. One launched
/// browser process per session; never shared across jobs.
pub struct ChromiumEngine {
    headless: bool,
}

impl ChromiumEngine {
    pub fn new() -> Self {
        Self { headless: true }
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, ScrapeError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1366, 768)
            .args(STEALTH_ARGS.iter().copied())
            .arg(format!("--user-agent={}", USER_AGENT));
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(ScrapeError::SessionLaunch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::SessionLaunch(e.to_string()))?;

        // The CDP event stream must be drained for the browser to make
        // progress; it ends when the browser process goes away.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScrapeError::SessionLaunch(e.to_string()))?;

        debug!("Launched chromium session");
        Ok(Box::new(ChromiumSession {
            browser,
            page: Some(page),
            handler_task,
        }))
    }
}

struct ChromiumSession {
    browser: Browser,
    page: Option<Page>,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn goto(&mut self, url: &str) -> Result<RenderedPage, ScrapeError> {
        let page = self
            .page
            .as_ref()
            .ok_or_else(|| ScrapeError::SessionLaunch("page already closed".into()))?;

        page.goto(url)
            .await
            .map_err(|e| ScrapeError::navigation(url, e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| ScrapeError::navigation(url, e.to_string()))?;

        let html = page
            .content()
            .await
            .map_err(|e| ScrapeError::navigation(url, e.to_string()))?;

        // Report the post-redirect URL; block pages often live elsewhere.
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        Ok(RenderedPage {
            url: final_url,
            html,
        })
    }

    async fn close(&mut self) -> Result<(), ScrapeError> {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("Failed to close page: {}", e);
            }
        }
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        debug!("Chromium session torn down");
        Ok(())
    }
}
