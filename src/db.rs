use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::info;

use crate::dedup::FingerprintSet;
use crate::error::ScrapeError;
use crate::record::NormalizedRecord;
use crate::scheduler::RunState;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Tabular store: one row per persisted position record
        CREATE TABLE IF NOT EXISTS positions (
            id          INTEGER PRIMARY KEY,
            fingerprint TEXT NOT NULL UNIQUE,
            target_id   TEXT NOT NULL,
            fields      TEXT NOT NULL,
            scraped_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_positions_target ON positions(target_id);

        -- Append-only identity set; grows monotonically
        CREATE TABLE IF NOT EXISTS fingerprints (
            fingerprint TEXT PRIMARY KEY,
            target_id   TEXT NOT NULL,
            added_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_fingerprints_target ON fingerprints(target_id);

        -- Per-target execution history; read at startup, written after
        -- every attempt
        CREATE TABLE IF NOT EXISTS run_state (
            target_id            TEXT PRIMARY KEY,
            last_success         TEXT,
            last_attempt         TEXT,
            last_error           TEXT,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            backoff_remaining    INTEGER NOT NULL DEFAULT 0,
            disabled             BOOLEAN NOT NULL DEFAULT 0
        );
        ",
    )?;
    Ok(())
}

// ── Fingerprint set ──

pub fn load_fingerprints(conn: &Connection, target_id: &str) -> Result<FingerprintSet> {
    let mut stmt = conn.prepare("SELECT fingerprint FROM fingerprints WHERE target_id = ?1")?;
    let fingerprints = stmt
        .query_map(params![target_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FingerprintSet::new(fingerprints))
}

// ── Sink ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub appended: usize,
}

/// Append the delta and register its fingerprints in one transaction.
/// Either all rows land and all fingerprints are marked seen, or neither;
/// a failed commit leaves the same records eligible for the next run.
pub fn commit_delta(
    conn: &Connection,
    target_id: &str,
    records: &[NormalizedRecord],
) -> Result<CommitResult, ScrapeError> {
    let tx = conn.unchecked_transaction()?;
    let mut appended = 0;
    {
        let mut row_stmt = tx.prepare(
            "INSERT OR IGNORE INTO positions (fingerprint, target_id, fields)
             VALUES (?1, ?2, ?3)",
        )?;
        let mut fp_stmt = tx.prepare(
            "INSERT OR IGNORE INTO fingerprints (fingerprint, target_id) VALUES (?1, ?2)",
        )?;
        for record in records {
            let fields = serde_json::to_string(&record.fields)
                .map_err(|e| ScrapeError::SinkWrite(e.to_string()))?;
            appended += row_stmt.execute(params![record.fingerprint, target_id, fields])?;
            fp_stmt.execute(params![record.fingerprint, target_id])?;
        }
    }
    tx.commit()?;
    Ok(CommitResult { appended })
}

// ── Run state ──

pub fn load_run_state(conn: &Connection, target_id: &str) -> Result<Option<RunState>> {
    let mut stmt = conn.prepare(
        "SELECT target_id, last_success, last_attempt, last_error,
                consecutive_failures, backoff_remaining, disabled
         FROM run_state WHERE target_id = ?1",
    )?;
    let mut rows = stmt
        .query_map(params![target_id], row_to_run_state)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.pop())
}

pub fn load_all_run_states(conn: &Connection) -> Result<Vec<RunState>> {
    let mut stmt = conn.prepare(
        "SELECT target_id, last_success, last_attempt, last_error,
                consecutive_failures, backoff_remaining, disabled
         FROM run_state ORDER BY target_id",
    )?;
    let rows = stmt
        .query_map([], row_to_run_state)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn save_run_state(conn: &Connection, state: &RunState) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO run_state
         (target_id, last_success, last_attempt, last_error,
          consecutive_failures, backoff_remaining, disabled)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            state.target_id,
            state.last_success.map(|t| t.to_rfc3339()),
            state.last_attempt.map(|t| t.to_rfc3339()),
            state.last_error,
            state.consecutive_failures,
            state.backoff_remaining,
            state.disabled,
        ],
    )?;
    Ok(())
}

fn row_to_run_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunState> {
    Ok(RunState {
        target_id: row.get(0)?,
        last_success: parse_time(row.get::<_, Option<String>>(1)?),
        last_attempt: parse_time(row.get::<_, Option<String>>(2)?),
        last_error: row.get(3)?,
        consecutive_failures: row.get(4)?,
        backoff_remaining: row.get(5)?,
        disabled: row.get(6)?,
    })
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

// ── Operator surface ──

pub struct StatusRow {
    pub state: RunState,
    pub positions: usize,
}

pub fn fetch_status(conn: &Connection) -> Result<Vec<StatusRow>> {
    let states = load_all_run_states(conn)?;
    let mut stmt = conn.prepare("SELECT COUNT(*) FROM positions WHERE target_id = ?1")?;
    let mut rows = Vec::with_capacity(states.len());
    for state in states {
        let positions: usize = stmt.query_row(params![state.target_id], |r| r.get(0))?;
        rows.push(StatusRow { state, positions });
    }
    Ok(rows)
}

pub struct Stats {
    pub positions: usize,
    pub fingerprints: usize,
    pub targets_tracked: usize,
    pub targets_disabled: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let positions: usize = conn.query_row("SELECT COUNT(*) FROM positions", [], |r| r.get(0))?;
    let fingerprints: usize =
        conn.query_row("SELECT COUNT(*) FROM fingerprints", [], |r| r.get(0))?;
    let targets_tracked: usize =
        conn.query_row("SELECT COUNT(*) FROM run_state", [], |r| r.get(0))?;
    let targets_disabled: usize = conn.query_row(
        "SELECT COUNT(*) FROM run_state WHERE disabled = 1",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        positions,
        fingerprints,
        targets_tracked,
        targets_disabled,
    })
}

// ── Export ──

/// Flatten the position store to CSV. Columns are the union of field names
/// across the exported rows, sorted, after the bookkeeping columns.
pub fn export_csv(conn: &Connection, target: Option<&str>, out: &Path) -> Result<usize> {
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    let sql = match target {
        Some(id) => {
            params.push(Box::new(id.to_string()));
            "SELECT target_id, scraped_at, fields FROM positions WHERE target_id = ?1 ORDER BY id"
        }
        None => "SELECT target_id, scraped_at, fields FROM positions ORDER BY id",
    };

    let mut stmt = conn.prepare(sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut columns: BTreeSet<String> = BTreeSet::new();
    let mut parsed: Vec<(String, String, BTreeMap<String, String>)> =
        Vec::with_capacity(rows.len());
    for (target_id, scraped_at, fields_json) in rows {
        let fields: BTreeMap<String, String> =
            serde_json::from_str(&fields_json).context("Corrupt fields JSON in positions row")?;
        columns.extend(fields.keys().cloned());
        parsed.push((target_id, scraped_at, fields));
    }

    let mut writer = csv::Writer::from_path(out)
        .with_context(|| format!("Failed to open {}", out.display()))?;
    let mut header = vec!["target_id".to_string(), "scraped_at".to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for (target_id, scraped_at, fields) in &parsed {
        let mut row = vec![target_id.clone(), scraped_at.clone()];
        row.extend(
            columns
                .iter()
                .map(|c| fields.get(c).cloned().unwrap_or_default()),
        );
        writer.write_record(&row)?;
    }
    writer.flush()?;

    info!("Exported {} rows to {}", parsed.len(), out.display());
    Ok(parsed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{normalize, RawRecord};
    use serde_json::json;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn record(mmsi: &str, ts: &str) -> NormalizedRecord {
        let raw: RawRecord = [
            ("mmsi".to_string(), json!(mmsi)),
            ("timestamp".to_string(), json!(ts)),
            ("speed".to_string(), json!(11.2)),
        ]
        .into_iter()
        .collect();
        normalize("north_sea", &raw, &["mmsi".into(), "timestamp".into()]).unwrap()
    }

    fn batch(n: usize, ts: &str) -> Vec<NormalizedRecord> {
        (0..n).map(|i| record(&format!("22794{}", i), ts)).collect()
    }

    #[test]
    fn commit_appends_rows_and_fingerprints() {
        let conn = test_conn();
        let records = [batch(5, "10:00"), batch(3, "10:05")].concat();
        let result = commit_delta(&conn, "north_sea", &records).unwrap();
        assert_eq!(result.appended, 8);
        assert_eq!(load_fingerprints(&conn, "north_sea").unwrap().len(), 8);
    }

    #[test]
    fn recommit_is_idempotent() {
        let conn = test_conn();
        let records = batch(8, "10:00");
        assert_eq!(commit_delta(&conn, "north_sea", &records).unwrap().appended, 8);
        assert_eq!(commit_delta(&conn, "north_sea", &records).unwrap().appended, 0);
        let count: usize = conn
            .query_row("SELECT COUNT(*) FROM positions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 8);
        assert_eq!(load_fingerprints(&conn, "north_sea").unwrap().len(), 8);
    }

    #[test]
    fn failed_commit_registers_no_fingerprints() {
        let conn = test_conn();
        conn.execute_batch("DROP TABLE positions").unwrap();
        let err = commit_delta(&conn, "north_sea", &batch(3, "10:00")).unwrap_err();
        assert!(matches!(err, ScrapeError::SinkWrite(_)));
        // Recreate the table and confirm the same records are still unseen.
        init_schema(&conn).unwrap();
        assert!(load_fingerprints(&conn, "north_sea").unwrap().is_empty());
    }

    #[test]
    fn fingerprints_are_scoped_per_target() {
        let conn = test_conn();
        commit_delta(&conn, "north_sea", &batch(2, "10:00")).unwrap();
        assert!(load_fingerprints(&conn, "baltic").unwrap().is_empty());
    }

    #[test]
    fn run_state_round_trips() {
        let conn = test_conn();
        let state = RunState {
            target_id: "north_sea".into(),
            last_success: Some(Utc::now()),
            last_attempt: Some(Utc::now()),
            last_error: Some("navigation failed".into()),
            consecutive_failures: 2,
            backoff_remaining: 1,
            disabled: false,
        };
        save_run_state(&conn, &state).unwrap();
        let loaded = load_run_state(&conn, "north_sea").unwrap().unwrap();
        assert_eq!(loaded.consecutive_failures, 2);
        assert_eq!(loaded.backoff_remaining, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("navigation failed"));
        assert!(!loaded.disabled);
        assert!(loaded.last_success.is_some());
    }

    #[test]
    fn missing_run_state_is_none() {
        let conn = test_conn();
        assert!(load_run_state(&conn, "unknown").unwrap().is_none());
    }

    #[test]
    fn stats_count_disabled_targets() {
        let conn = test_conn();
        save_run_state(&conn, &RunState::initial("a")).unwrap();
        let disabled = RunState {
            disabled: true,
            ..RunState::initial("b")
        };
        save_run_state(&conn, &disabled).unwrap();
        let stats = get_stats(&conn).unwrap();
        assert_eq!(stats.targets_tracked, 2);
        assert_eq!(stats.targets_disabled, 1);
    }

    #[test]
    fn export_flattens_field_union() {
        let conn = test_conn();
        commit_delta(&conn, "north_sea", &batch(2, "10:00")).unwrap();
        let out = std::env::temp_dir().join(format!("vessel_export_{}.csv", std::process::id()));
        let exported = export_csv(&conn, Some("north_sea"), &out).unwrap();
        assert_eq!(exported, 2);
        let content = std::fs::read_to_string(&out).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "target_id,scraped_at,mmsi,speed,timestamp"
        );
        assert_eq!(content.lines().count(), 3);
        std::fs::remove_file(&out).ok();
    }
}
