use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::adapter;
use crate::config::{PipelineConfig, TargetConfig};
use crate::db;
use crate::dedup;
use crate::error::{ScrapeError, SkipReason};
use crate::job;
use crate::session::{BrowserEngine, SessionPolicy};

/// Longest streak of due triggers a failing target may skip before its
/// next probe run.
const BACKOFF_TRIGGER_CAP: u32 = 8;

/// Per-target execution history. Transitions are pure (every attempt
/// produces a new RunState which is then persisted), so the threshold
/// logic is testable without storage.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub target_id: String,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Due triggers still to be consumed without running.
    pub backoff_remaining: u32,
    pub disabled: bool,
}

impl RunState {
    pub fn initial(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            last_success: None,
            last_attempt: None,
            last_error: None,
            consecutive_failures: 0,
            backoff_remaining: 0,
            disabled: false,
        }
    }

    pub fn after_success(&self, now: DateTime<Utc>) -> Self {
        Self {
            last_success: Some(now),
            last_attempt: Some(now),
            last_error: None,
            consecutive_failures: 0,
            backoff_remaining: 0,
            disabled: self.disabled,
            ..self.clone()
        }
    }

    /// Failure bumps the streak, schedules 2^(streak-1) trigger skips
    /// (capped), and trips the disable threshold when the streak reaches
    /// `max_failures`.
    pub fn after_failure(&self, now: DateTime<Utc>, error: &str, max_failures: u32) -> Self {
        let failures = self.consecutive_failures + 1;
        let disabled = self.disabled || failures >= max_failures;
        let backoff_remaining = if disabled {
            0
        } else {
            2u32.saturating_pow(failures - 1).min(BACKOFF_TRIGGER_CAP)
        };
        Self {
            last_attempt: Some(now),
            last_error: Some(error.to_string()),
            consecutive_failures: failures,
            backoff_remaining,
            disabled,
            ..self.clone()
        }
    }

    pub fn consume_backoff(&self) -> Self {
        Self {
            backoff_remaining: self.backoff_remaining.saturating_sub(1),
            ..self.clone()
        }
    }

    /// Operator override. Enabling also clears the failure streak so the
    /// target starts fresh.
    pub fn with_enabled(&self, enabled: bool) -> Self {
        if enabled {
            Self {
                disabled: false,
                consecutive_failures: 0,
                backoff_remaining: 0,
                last_error: None,
                ..self.clone()
            }
        } else {
            Self {
                disabled: true,
                ..self.clone()
            }
        }
    }

    pub fn due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        if self.disabled {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(t) => now - t >= chrono::Duration::from_std(interval).unwrap_or_default(),
        }
    }
}

/// Outcome of one trigger.
#[derive(Debug)]
pub enum RunResult {
    Completed {
        new_records: usize,
        pages_ok: usize,
        pages_failed: usize,
    },
    Skipped(SkipReason),
    Failed {
        error: String,
        disabled: bool,
    },
}

/// Fires jobs for configured targets: at most one run in flight per target
/// id, backoff and disable bookkeeping around every attempt. The timer
/// itself lives outside (the `watch` command or external cron); this is
/// the `run`/`RunState` contract surface.
pub struct Scheduler {
    config: Arc<PipelineConfig>,
    engine: Arc<dyn BrowserEngine>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(config: Arc<PipelineConfig>, engine: Arc<dyn BrowserEngine>) -> Self {
        Self {
            config,
            engine,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Ensure every configured target has a persisted RunState row, so
    /// backoff and disable decisions survive restarts. In-flight locks are
    /// process-local on purpose: a crashed run must not wedge its target.
    pub fn initialize(&self) -> Result<()> {
        let conn = db::connect(&self.config.db_path)?;
        db::init_schema(&conn)?;
        for target in &self.config.targets {
            if db::load_run_state(&conn, &target.id)?.is_none() {
                db::save_run_state(&conn, &RunState::initial(&target.id))?;
            }
        }
        Ok(())
    }

    /// Execute one trigger for one target. Never queues: a trigger that
    /// cannot run right now is skipped with a reason.
    pub async fn run(&self, target: &TargetConfig) -> Result<RunResult> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &target.id) else {
            warn!("[{}] trigger skipped: run already in flight", target.id);
            return Ok(RunResult::Skipped(SkipReason::InFlight));
        };

        // The connection is scoped to the pre-flight checks: it must not be
        // held across the job await (and a second one is opened afterwards
        // for the commit phase).
        let state = {
            let conn = db::connect(&self.config.db_path)?;
            let state = db::load_run_state(&conn, &target.id)?
                .unwrap_or_else(|| RunState::initial(&target.id));

            if state.disabled {
                info!("[{}] trigger skipped: target disabled", target.id);
                return Ok(RunResult::Skipped(SkipReason::Disabled));
            }
            if state.backoff_remaining > 0 {
                let next = state.consume_backoff();
                db::save_run_state(&conn, &next)?;
                info!(
                    "[{}] trigger skipped: backoff ({} remaining)",
                    target.id, next.backoff_remaining
                );
                return Ok(RunResult::Skipped(SkipReason::Backoff {
                    remaining: next.backoff_remaining,
                }));
            }
            state
        };

        let policy = SessionPolicy::from_config(&self.config);
        let deadline = Duration::from_secs(self.config.job_deadline_secs);
        let extraction = adapter::for_kind(target.adapter);

        let outcome = job::run(self.engine.as_ref(), extraction, target, policy, deadline).await;
        let now = Utc::now();

        let conn = db::connect(&self.config.db_path)?;
        match outcome {
            Ok(outcome) => {
                let seen = db::load_fingerprints(&conn, &target.id)?;
                let delta = dedup::filter_new(outcome.records, &seen);
                match db::commit_delta(&conn, &target.id, &delta) {
                    Ok(commit) => {
                        db::save_run_state(&conn, &state.after_success(now))?;
                        info!(
                            "[{}] run completed: {} new records committed",
                            target.id, commit.appended
                        );
                        Ok(RunResult::Completed {
                            new_records: commit.appended,
                            pages_ok: outcome.pages_ok,
                            pages_failed: outcome.page_failures.len(),
                        })
                    }
                    // No fingerprints were registered; the whole delta is
                    // retried on the next scheduled trigger.
                    Err(e) => self.record_failure(&conn, &state, now, e),
                }
            }
            Err(e) => self.record_failure(&conn, &state, now, e),
        }
    }

    fn record_failure(
        &self,
        conn: &rusqlite::Connection,
        state: &RunState,
        now: DateTime<Utc>,
        cause: ScrapeError,
    ) -> Result<RunResult> {
        let next = state.after_failure(now, &cause.to_string(), self.config.max_consecutive_failures);
        db::save_run_state(conn, &next)?;
        if next.disabled && !state.disabled {
            let fatal = ScrapeError::ConsecutiveFailuresExceeded(state.target_id.clone());
            error!("[{}] {}; operator re-enable required", state.target_id, fatal);
        } else {
            warn!(
                "[{}] run failed ({} consecutive): {}",
                state.target_id, next.consecutive_failures, cause
            );
        }
        Ok(RunResult::Failed {
            error: cause.to_string(),
            disabled: next.disabled,
        })
    }

    /// Targets whose interval has elapsed. Simple interval math over the
    /// persisted last-attempt timestamps; backoff is consumed inside `run`.
    pub fn due_targets(&self, now: DateTime<Utc>) -> Result<Vec<TargetConfig>> {
        let conn = db::connect(&self.config.db_path)?;
        let mut due = Vec::new();
        for target in &self.config.targets {
            let state = db::load_run_state(&conn, &target.id)?
                .unwrap_or_else(|| RunState::initial(&target.id));
            if state.due(now, Duration::from_secs(target.interval_secs)) {
                due.push(target.clone());
            }
        }
        Ok(due)
    }

    /// Operator override; enabling clears the failure streak.
    pub fn set_enabled(&self, target_id: &str, enabled: bool) -> Result<()> {
        let conn = db::connect(&self.config.db_path)?;
        db::init_schema(&conn)?;
        let state = db::load_run_state(&conn, target_id)?
            .unwrap_or_else(|| RunState::initial(target_id));
        db::save_run_state(&conn, &state.with_enabled(enabled))?;
        info!(
            "[{}] {} by operator",
            target_id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

/// Marks a target as having a run in flight; released on drop so every
/// exit path (including errors) frees the slot.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
        let mut live = set.lock().unwrap();
        if live.insert(id.to_string()) {
            Some(Self {
                set: Arc::clone(set),
                id: id.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}
