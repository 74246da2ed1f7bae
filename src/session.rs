use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::adapter::RenderedPage;
use crate::config::PipelineConfig;
use crate::error::ScrapeError;

/// Block pages and challenge walls the pipeline treats as detection.
/// Matched case-insensitively against the rendered page.
static DETECTION_SIGNATURES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("captcha", r"(?i)\bh?captcha\b|g-recaptcha"),
        ("challenge_page", r"(?i)checking your browser|cf-challenge|just a moment"),
        ("access_denied", r"(?i)<title>\s*access denied|request blocked"),
        ("rate_page", r"(?i)unusual traffic from your"),
        ("human_check", r"(?i)verify (that )?you are (a )?human"),
    ]
    .into_iter()
    .map(|(name, re)| (name, Regex::new(re).unwrap()))
    .collect()
});

/// Launches automation sessions. The chromium-backed engine lives in
/// `browser`; tests inject stubs.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, ScrapeError>;
}

/// One live automation session: navigation and teardown.
#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<RenderedPage, ScrapeError>;
    async fn close(&mut self) -> Result<(), ScrapeError>;
}

/// Retry/deadline knobs for one session, taken from the pipeline config.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub navigation_timeout: Duration,
    pub max_nav_retries: u32,
    pub base_backoff: Duration,
}

impl SessionPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            navigation_timeout: Duration::from_secs(config.navigation_timeout_secs),
            max_nav_retries: config.max_nav_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        }
    }
}

/// Exclusive owner of one automation session for the duration of a job.
/// `close` is idempotent; the job runner calls it on every exit path.
pub struct SessionManager {
    session: Option<Box<dyn BrowserSession>>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub async fn open(
        engine: &dyn BrowserEngine,
        policy: SessionPolicy,
    ) -> Result<Self, ScrapeError> {
        let session = engine.launch().await?;
        Ok(Self {
            session: Some(session),
            policy,
        })
    }

    /// Navigate with the per-page deadline, retrying transient failures with
    /// jittered exponential backoff. Detection is classified from the
    /// rendered page and never retried; the session is burned.
    pub async fn navigate(&mut self, url: &str) -> Result<RenderedPage, ScrapeError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ScrapeError::SessionLaunch("session already closed".into()))?;

        let mut attempt = 0;
        loop {
            let result = match timeout(self.policy.navigation_timeout, session.goto(url)).await {
                Ok(r) => r,
                Err(_) => Err(ScrapeError::navigation(
                    url,
                    format!(
                        "deadline of {:.0}s elapsed",
                        self.policy.navigation_timeout.as_secs_f64()
                    ),
                )),
            };

            match result {
                Ok(page) => {
                    if let Some(marker) = scan_for_detection(&page.html) {
                        return Err(ScrapeError::detection(url, marker));
                    }
                    return Ok(page);
                }
                Err(e) if e.is_fatal_to_job() => return Err(e),
                Err(e @ ScrapeError::Navigation { .. }) if attempt < self.policy.max_nav_retries => {
                    let backoff = jittered_backoff(self.policy.base_backoff, attempt);
                    warn!(
                        "Navigation attempt {}/{} failed for {} ({}), backing off {:.1}s",
                        attempt + 1,
                        self.policy.max_nav_retries,
                        url,
                        e,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Tear down the session. Safe to call more than once; teardown errors
    /// are logged, not propagated; the job outcome is already decided.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!("Failed to close browser session: {}", e);
            } else {
                debug!("Browser session closed");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("SessionManager dropped without close(); automation process may leak");
        }
    }
}

/// First matching anti-bot signature in the page, if any.
pub fn scan_for_detection(html: &str) -> Option<&'static str> {
    DETECTION_SIGNATURES
        .iter()
        .find(|(_, re)| re.is_match(html))
        .map(|(name, _)| *name)
}

/// base * 2^attempt, with ±20% jitter so concurrent targets don't retry in
/// lockstep.
fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis() as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    Duration::from_millis((exp * (1.0 + jitter)).max(0.0) as u64)
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scripted outcome for one `goto` call.
    #[derive(Clone)]
    pub enum StubNav {
        Page(String),
        NavError(&'static str),
        Hang,
    }

    /// Engine whose sessions replay a script of navigation outcomes and
    /// count how often they are launched and closed.
    pub struct StubEngine {
        pub script: Arc<Mutex<Vec<StubNav>>>,
        pub launches: Arc<AtomicUsize>,
        pub closes: Arc<AtomicUsize>,
        pub fail_launch: bool,
    }

    impl StubEngine {
        pub fn new(script: Vec<StubNav>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script)),
                launches: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
                fail_launch: false,
            }
        }
    }

    pub struct StubSession {
        script: Arc<Mutex<Vec<StubNav>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserEngine for StubEngine {
        async fn launch(&self) -> Result<Box<dyn BrowserSession>, ScrapeError> {
            if self.fail_launch {
                return Err(ScrapeError::SessionLaunch("chromium unavailable".into()));
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubSession {
                script: Arc::clone(&self.script),
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    #[async_trait]
    impl BrowserSession for StubSession {
        async fn goto(&mut self, url: &str) -> Result<RenderedPage, ScrapeError> {
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    StubNav::NavError("script exhausted")
                } else {
                    script.remove(0)
                }
            };
            match next {
                StubNav::Page(html) => Ok(RenderedPage {
                    url: url.to_string(),
                    html,
                }),
                StubNav::NavError(reason) => Err(ScrapeError::navigation(url, reason)),
                StubNav::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("hung navigation should be cut off by the deadline")
                }
            }
        }

        async fn close(&mut self) -> Result<(), ScrapeError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
