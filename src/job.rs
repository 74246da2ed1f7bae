use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapter::ExtractionAdapter;
use crate::config::TargetConfig;
use crate::error::ScrapeError;
use crate::record::{normalize, NormalizedRecord, RawRecord};
use crate::session::{BrowserEngine, SessionManager, SessionPolicy};

/// Job progression: PENDING → NAVIGATING → EXTRACTING per page, ending in
/// COMPLETED (at least one page succeeded) or FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Navigating,
    Extracting,
}

/// A page that failed without aborting the job.
#[derive(Debug)]
pub struct PageFailure {
    pub url: String,
    pub error: String,
}

/// Normalized output of one COMPLETED job.
#[derive(Debug)]
pub struct JobOutcome {
    pub records: Vec<NormalizedRecord>,
    pub pages_ok: usize,
    pub page_failures: Vec<PageFailure>,
}

/// Drive one target through its page set with a fresh session. The whole
/// job is bounded by `deadline`, and the session is closed on every exit
/// path: success, page failure, detection and deadline abort all route
/// through the single `close` below.
pub async fn run(
    engine: &dyn BrowserEngine,
    adapter: &dyn ExtractionAdapter,
    target: &TargetConfig,
    policy: SessionPolicy,
    deadline: Duration,
) -> Result<JobOutcome, ScrapeError> {
    let mut manager = SessionManager::open(engine, policy).await?;
    let result = match timeout(deadline, drive(&mut manager, adapter, target)).await {
        Ok(result) => result,
        Err(_) => Err(ScrapeError::navigation(
            target.entry_urls.first().cloned().unwrap_or_default(),
            format!("job deadline of {}s elapsed", deadline.as_secs()),
        )),
    };
    manager.close().await;
    result
}

async fn drive(
    manager: &mut SessionManager,
    adapter: &dyn ExtractionAdapter,
    target: &TargetConfig,
) -> Result<JobOutcome, ScrapeError> {
    let pages = target.page_set();
    let mut phase = Phase::Pending;
    let mut raw_records: Vec<RawRecord> = Vec::new();
    let mut pages_ok = 0usize;
    let mut page_failures = Vec::new();
    debug!("[{}] {:?} with {} pages", target.id, phase, pages.len());

    for url in &pages {
        phase = Phase::Navigating;
        debug!("[{}] {:?} {}", target.id, phase, url);
        let page = match manager.navigate(url).await {
            Ok(page) => page,
            // Detection burns the session; nothing from this job survives.
            Err(e) if e.is_fatal_to_job() => {
                warn!("[{}] aborting job: {}", target.id, e);
                return Err(e);
            }
            Err(e) => {
                warn!("[{}] page failed, continuing: {}", target.id, e);
                page_failures.push(PageFailure {
                    url: url.clone(),
                    error: e.to_string(),
                });
                continue;
            }
        };

        phase = Phase::Extracting;
        let extracted = adapter.extract(&page);
        debug!(
            "[{}] {:?} {} records from {}",
            target.id,
            phase,
            extracted.len(),
            page.url
        );
        raw_records.extend(extracted);
        pages_ok += 1;
    }

    if pages_ok == 0 {
        return Err(ScrapeError::navigation(
            pages.first().cloned().unwrap_or_default(),
            format!("all {} pages failed", pages.len()),
        ));
    }

    let total_raw = raw_records.len();
    let records: Vec<NormalizedRecord> = raw_records
        .iter()
        .filter_map(|r| normalize(&target.id, r, &target.identity_fields))
        .collect();
    if records.len() < total_raw {
        debug!(
            "[{}] dropped {} records with no usable identity",
            target.id,
            total_raw - records.len()
        );
    }

    info!(
        "[{}] job completed: {} records from {}/{} pages ({} failed)",
        target.id,
        records.len(),
        pages_ok,
        pages.len(),
        page_failures.len()
    );

    Ok(JobOutcome {
        records,
        pages_ok,
        page_failures,
    })
}
