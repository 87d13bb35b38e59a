//! SQLite state database (`scheduler_state.db`) — runtime job state and run
//! history. Program-owned; humans edit the YAML file instead.
//!
//! The connection is held behind a mutex, which keeps the store `Send + Sync`
//! while respecting SQLite's single-writer requirement. WAL journaling with
//! `synchronous=NORMAL` handles the frequent per-run state writes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::model::{JobRun, JobState, JobStats, JobStatus, RunFilter, RunStatus, TimestampMs};

pub const STATE_DB_NAME: &str = "scheduler_state.db";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS job_state (
    job_id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    next_run_at_ms INTEGER,
    last_run_at_ms INTEGER,
    last_status TEXT,
    run_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS job_runs (
    id TEXT PRIMARY KEY NOT NULL,
    job_id TEXT NOT NULL,
    started_at_ms INTEGER NOT NULL,
    finished_at_ms INTEGER NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error TEXT,
    duration_ms INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_job_runs_job_id ON job_runs (job_id);
CREATE INDEX IF NOT EXISTS idx_job_runs_started_at ON job_runs (started_at_ms);
CREATE INDEX IF NOT EXISTS idx_job_runs_status ON job_runs (status);
"#;

/// One `job_state` row as loaded at reconciliation time.
#[derive(Clone, Debug, PartialEq)]
pub struct StateRow {
    pub state: JobState,
    pub status: JobStatus,
    pub created_at_ms: TimestampMs,
    pub updated_at_ms: TimestampMs,
}

pub struct StateDb {
    conn: Mutex<Connection>,
}

impl StateDb {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        // journal_mode returns a result row, so query_row rather than execute.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── job_state ───────────────────────────────────────────────────

    pub fn upsert_state(&self, job_id: &str, row: &StateRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO job_state
             (job_id, status, next_run_at_ms, last_run_at_ms, last_status,
              run_count, failure_count, consecutive_failures, last_error,
              created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job_id,
                row.status.as_str(),
                row.state.next_run_at_ms,
                row.state.last_run_at_ms,
                row.state.last_status.map(|s| s.as_str()),
                row.state.run_count as i64,
                row.state.failure_count as i64,
                i64::from(row.state.consecutive_failures),
                row.state.last_error,
                row.created_at_ms,
                row.updated_at_ms,
            ],
        )?;
        Ok(())
    }

    pub fn load_states(&self) -> Result<HashMap<String, StateRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT job_id, status, next_run_at_ms, last_run_at_ms, last_status,
                    run_count, failure_count, consecutive_failures, last_error,
                    created_at_ms, updated_at_ms
             FROM job_state",
        )?;
        let rows = stmt.query_map([], |r| {
            let job_id: String = r.get(0)?;
            let status: String = r.get(1)?;
            let last_status: Option<String> = r.get(4)?;
            Ok((
                job_id,
                StateRow {
                    status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
                    state: JobState {
                        next_run_at_ms: r.get(2)?,
                        last_run_at_ms: r.get(3)?,
                        last_status: last_status.as_deref().and_then(RunStatus::parse),
                        run_count: r.get::<_, i64>(5)? as u64,
                        failure_count: r.get::<_, i64>(6)? as u64,
                        consecutive_failures: r.get::<_, i64>(7)? as u32,
                        last_error: r.get(8)?,
                    },
                    created_at_ms: r.get(9)?,
                    updated_at_ms: r.get(10)?,
                },
            ))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (job_id, state_row) = row?;
            map.insert(job_id, state_row);
        }
        Ok(map)
    }

    /// Delete a job's state row and its run history.
    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM job_state WHERE job_id = ?1", params![job_id])?;
        conn.execute("DELETE FROM job_runs WHERE job_id = ?1", params![job_id])?;
        Ok(())
    }

    /// Remove state rows (and their runs) whose id is not in `keep`.
    /// Returns how many orphans were removed.
    pub fn remove_orphans(&self, keep: &HashSet<String>) -> Result<usize> {
        let orphans: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT job_id FROM job_state")?;
            let ids = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut orphans = Vec::new();
            for id in ids {
                let id = id?;
                if !keep.contains(&id) {
                    orphans.push(id);
                }
            }
            orphans
        };
        for id in &orphans {
            self.delete_job(id)?;
        }
        Ok(orphans.len())
    }

    // ── job_runs ────────────────────────────────────────────────────

    pub fn insert_run(&self, run: &JobRun) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO job_runs
             (id, job_id, started_at_ms, finished_at_ms, status, result, error, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id,
                run.job_id,
                run.started_at_ms,
                run.finished_at_ms,
                run.status.as_str(),
                run.result,
                run.error,
                run.duration_ms,
            ],
        )?;
        Ok(())
    }

    /// List runs matching `filter`, most recent first, plus the total count.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<(Vec<JobRun>, u64)> {
        let mut where_clauses = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(job_id) = &filter.job_id {
            where_clauses.push(format!("job_id = ?{}", args.len() + 1));
            args.push(Box::new(job_id.clone()));
        }
        if let Some(status) = filter.status {
            where_clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clauses.join(" AND "))
        };

        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM job_runs{where_sql}"),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |r| r.get(0),
        )?;

        let sql = format!(
            "SELECT id, job_id, started_at_ms, finished_at_ms, status, result, error, duration_ms
             FROM job_runs{where_sql}
             ORDER BY started_at_ms DESC
             LIMIT {} OFFSET {}",
            filter.limit, filter.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |r| {
                let status: String = r.get(4)?;
                Ok(JobRun {
                    id: r.get(0)?,
                    job_id: r.get(1)?,
                    started_at_ms: r.get(2)?,
                    finished_at_ms: r.get(3)?,
                    status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                    result: r.get(5)?,
                    error: r.get(6)?,
                    duration_ms: r.get(7)?,
                })
            },
        )?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok((runs, total as u64))
    }

    pub fn job_stats(&self, job_id: &str) -> Result<JobStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), AVG(duration_ms), MAX(started_at_ms)
             FROM job_runs WHERE job_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![job_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, Option<i64>>(3)?,
            ))
        })?;

        let mut stats = JobStats {
            job_id: job_id.to_string(),
            ..Default::default()
        };
        let mut duration_sum = 0f64;
        for row in rows {
            let (status, count, avg_duration, last_started) = row?;
            let count = count as u64;
            stats.total_runs += count;
            match RunStatus::parse(&status) {
                Some(RunStatus::Ok) => stats.ok_count += count,
                Some(RunStatus::Failed) => stats.failed_count += count,
                Some(RunStatus::Skipped) => stats.skipped_count += count,
                Some(RunStatus::Timeout) => stats.timeout_count += count,
                None => {}
            }
            if let Some(avg) = avg_duration {
                duration_sum += avg * count as f64;
            }
            if let Some(started) = last_started {
                stats.last_run_at_ms = Some(stats.last_run_at_ms.map_or(started, |v| v.max(started)));
            }
        }
        if stats.total_runs > 0 {
            stats.avg_duration_ms = Some((duration_sum / stats.total_runs as f64) as i64);
        }
        Ok(stats)
    }

    /// Run counts by status for runs started at or after `since_ms`.
    pub fn run_counts_since(&self, since_ms: TimestampMs) -> Result<BTreeMap<String, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM job_runs WHERE started_at_ms >= ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![since_ms], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        let mut total = 0u64;
        for row in rows {
            let (status, count) = row?;
            total += count as u64;
            counts.insert(status, count as u64);
        }
        counts.insert("total".to_string(), total);
        Ok(counts)
    }

    /// Delete run records started before `before_ms`. Returns the number of
    /// deleted rows.
    pub fn delete_old_runs(&self, before_ms: TimestampMs) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM job_runs WHERE started_at_ms < ?1",
            params![before_ms],
        )?;
        Ok(n)
    }
}
