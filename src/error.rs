use thiserror::Error;

/// Failure taxonomy for a single scrape run. Variants map to distinct
/// retry policies: `Navigation` is retried in-job, `Detection` burns the
/// session and fails the job, everything else fails the job and is retried
/// on the next scheduled trigger.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("failed to launch browser session: {0}")]
    SessionLaunch(String),

    #[error("navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },

    #[error("anti-bot detection at {url} (marker: {marker})")]
    Detection { url: String, marker: String },

    #[error("sink write failed: {0}")]
    SinkWrite(String),

    #[error("target {0} disabled after exceeding consecutive failure threshold")]
    ConsecutiveFailuresExceeded(String),
}

impl ScrapeError {
    pub fn navigation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn detection(url: impl Into<String>, marker: impl Into<String>) -> Self {
        Self::Detection {
            url: url.into(),
            marker: marker.into(),
        }
    }

    /// Detection means the session is burned; no in-job retry is allowed.
    pub fn is_fatal_to_job(&self) -> bool {
        matches!(self, Self::Detection { .. })
    }
}

impl From<rusqlite::Error> for ScrapeError {
    fn from(e: rusqlite::Error) -> Self {
        Self::SinkWrite(e.to_string())
    }
}

/// Why a trigger did not start a run. Skips are logged, never queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A run for this target is already in flight.
    InFlight,
    /// Target is disabled (auto threshold or operator override).
    Disabled,
    /// Target is consuming backoff triggers after recent failures.
    Backoff { remaining: u32 },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InFlight => write!(f, "run already in flight"),
            Self::Disabled => write!(f, "target disabled"),
            Self::Backoff { remaining } => {
                write!(f, "in backoff ({} triggers remaining)", remaining)
            }
        }
    }
}
