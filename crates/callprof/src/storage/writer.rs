use super::schema::{self, SCHEMA_VERSION};
use crate::error::{Error, Result};
use callprof_trace::{DiagnosticsSnapshot, FunctionStatistics, ProcessInfo, StatisticsSnapshot};
use rusqlite::{Connection, Row};
use std::path::Path;
use std::time::Instant;

/// SQLite profile of one recording
pub struct Storage {
    conn: Connection,
    start_time: Instant,
    checkpoint_id: i64,
}

impl Storage {
    /// Create a new profile file, replacing any previous contents
    pub fn new(path: &Path, process: &ProcessInfo) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads during writes
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        // Checkpoint and truncate any existing WAL to clear stale state
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;

        // Create tables (drops existing tables first)
        schema::create_tables(&conn)?;

        schema::set_meta(&conn, "version", &SCHEMA_VERSION.to_string())?;
        schema::set_meta(&conn, "pid", &process.pid.to_string())?;
        schema::set_meta(&conn, "process_name", process.name())?;
        schema::set_meta(&conn, "exe_path", &process.executable)?;
        schema::set_meta(
            &conn,
            "ticks_per_second",
            &process.ticks_per_second.to_string(),
        )?;
        schema::set_meta(&conn, "start_time", &chrono::Utc::now().to_rfc3339())?;

        Ok(Storage {
            conn,
            start_time: Instant::now(),
            checkpoint_id: 0,
        })
    }

    /// Open an existing profile for reading
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::InvalidArgument(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        let version = schema::get_meta(&conn, "version")
            .map_err(|_| Error::NotAProfile(path.display().to_string()))?;
        if version.is_none() {
            return Err(Error::NotAProfile(path.display().to_string()));
        }

        let checkpoint_id = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM checkpoints", [], |row| {
            row.get(0)
        })?;
        Ok(Storage {
            conn,
            start_time: Instant::now(),
            checkpoint_id,
        })
    }

    /// Store one received snapshot as a checkpoint.
    ///
    /// Empty incremental snapshots carry nothing and are skipped. Returns
    /// the new checkpoint id.
    pub fn record_snapshot(
        &mut self,
        sequence: u64,
        incremental: bool,
        statistics: &StatisticsSnapshot,
    ) -> Result<Option<i64>> {
        if incremental && statistics.is_empty() {
            return Ok(None);
        }
        self.insert_checkpoint(Some(sequence), incremental, statistics)
            .map(Some)
    }

    /// Record that the statistics were cleared
    pub fn record_clear(&mut self) -> Result<i64> {
        self.insert_checkpoint(None, false, &StatisticsSnapshot::new())
    }

    fn insert_checkpoint(
        &mut self,
        sequence: Option<u64>,
        incremental: bool,
        statistics: &StatisticsSnapshot,
    ) -> Result<i64> {
        let tx = self.conn.transaction()?;

        let timestamp_ms = self.start_time.elapsed().as_millis() as i64;
        tx.execute(
            "INSERT INTO checkpoints (sequence, incremental, timestamp_ms) VALUES (?, ?, ?)",
            rusqlite::params![sequence.map(to_sql), incremental, timestamp_ms],
        )?;
        self.checkpoint_id = tx.last_insert_rowid();

        {
            let mut function_stmt = tx.prepare_cached(
                "INSERT INTO function_stats (checkpoint_id, address, times_called, exclusive_time, inclusive_time, max_reentrance, max_call_time) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            let mut callee_stmt = tx.prepare_cached(
                "INSERT INTO callee_stats (checkpoint_id, caller, callee, times_called, exclusive_time, inclusive_time, max_reentrance, max_call_time) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            let mut caller_stmt = tx.prepare_cached(
                "INSERT INTO caller_counts (checkpoint_id, callee, caller, count) VALUES (?, ?, ?, ?)",
            )?;

            for (&address, entry) in statistics {
                let s = &entry.stats;
                function_stmt.execute(rusqlite::params![
                    self.checkpoint_id,
                    to_sql(address),
                    to_sql(s.times_called),
                    to_sql(s.exclusive_time),
                    to_sql(s.inclusive_time),
                    s.max_reentrance,
                    to_sql(s.max_call_time),
                ])?;

                for (&callee, s) in &entry.callees {
                    callee_stmt.execute(rusqlite::params![
                        self.checkpoint_id,
                        to_sql(address),
                        to_sql(callee),
                        to_sql(s.times_called),
                        to_sql(s.exclusive_time),
                        to_sql(s.inclusive_time),
                        s.max_reentrance,
                        to_sql(s.max_call_time),
                    ])?;
                }

                for (&caller, &count) in &entry.callers {
                    caller_stmt.execute(rusqlite::params![
                        self.checkpoint_id,
                        to_sql(address),
                        to_sql(caller),
                        to_sql(count),
                    ])?;
                }
            }
        }

        tx.commit()?;
        Ok(self.checkpoint_id)
    }

    /// Store end-of-recording counters in the metadata
    pub fn record_summary(
        &self,
        diagnostics: &DiagnosticsSnapshot,
        missed_snapshots: u64,
        decode_errors: u64,
    ) -> Result<()> {
        let counters = [
            ("unbalanced_exits", diagnostics.unbalanced_exits),
            ("orphaned_frames", diagnostics.orphaned_frames),
            ("dropped_events", diagnostics.dropped_events),
            ("dropped_snapshots", diagnostics.dropped_snapshots),
            ("missed_snapshots", missed_snapshots),
            ("decode_errors", decode_errors),
        ];
        for (key, value) in counters {
            schema::set_meta(&self.conn, key, &value.to_string())?;
        }
        schema::set_meta(&self.conn, "end_time", &chrono::Utc::now().to_rfc3339())?;
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(schema::get_meta(&self.conn, key)?)
    }

    /// Id of the last checkpoint written (0 before the first)
    pub fn last_checkpoint(&self) -> i64 {
        self.checkpoint_id
    }

    /// Get number of checkpoints
    pub fn checkpoint_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Fold the checkpoints back into one snapshot.
    ///
    /// Starts at the newest cumulative checkpoint and merges every later
    /// incremental one with the usual rule.
    pub fn load_totals(&self) -> Result<StatisticsSnapshot> {
        let base = schema::get_base_checkpoint(&self.conn)?.unwrap_or(0);
        let mut totals = StatisticsSnapshot::new();

        let mut stmt = self.conn.prepare(
            "SELECT address, times_called, exclusive_time, inclusive_time, max_reentrance, max_call_time
             FROM function_stats WHERE checkpoint_id >= ?",
        )?;
        let rows = stmt.query_map([base], |row| Ok((row.get::<_, i64>(0)?, read_statistics(row, 1)?)))?;
        for row in rows {
            let (address, stats) = row?;
            totals.entry(from_sql(address)).or_default().stats.merge(&stats);
        }

        let mut stmt = self.conn.prepare(
            "SELECT caller, callee, times_called, exclusive_time, inclusive_time, max_reentrance, max_call_time
             FROM callee_stats WHERE checkpoint_id >= ?",
        )?;
        let rows = stmt.query_map([base], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                read_statistics(row, 2)?,
            ))
        })?;
        for row in rows {
            let (caller, callee, stats) = row?;
            totals
                .entry(from_sql(caller))
                .or_default()
                .callees
                .entry(from_sql(callee))
                .or_default()
                .merge(&stats);
        }

        let mut stmt = self.conn.prepare(
            "SELECT callee, caller, count FROM caller_counts WHERE checkpoint_id >= ?",
        )?;
        let rows = stmt.query_map([base], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (callee, caller, count) = row?;
            let slot = totals
                .entry(from_sql(callee))
                .or_default()
                .callers
                .entry(from_sql(caller))
                .or_insert(0);
            *slot = slot.saturating_add(from_sql(count));
        }

        Ok(totals)
    }
}

fn read_statistics(row: &Row<'_>, first: usize) -> rusqlite::Result<FunctionStatistics> {
    Ok(FunctionStatistics {
        times_called: from_sql(row.get(first)?),
        exclusive_time: from_sql(row.get(first + 1)?),
        inclusive_time: from_sql(row.get(first + 2)?),
        max_reentrance: row.get(first + 3)?,
        max_call_time: from_sql(row.get(first + 4)?),
    })
}

/// SQLite integers are signed; u64 values are stored bit-for-bit
fn to_sql(value: u64) -> i64 {
    value as i64
}

fn from_sql(value: i64) -> u64 {
    value as u64
}
