use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 1;

/// Create all tables (drops existing tables first to ensure clean state)
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Drop existing tables to ensure clean state for new session
        DROP TABLE IF EXISTS caller_counts;
        DROP TABLE IF EXISTS callee_stats;
        DROP TABLE IF EXISTS function_stats;
        DROP TABLE IF EXISTS checkpoints;
        DROP TABLE IF EXISTS meta;

        -- Metadata table
        CREATE TABLE meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- One row per received snapshot. A cumulative checkpoint replaces
        -- everything recorded before it; a clear is an empty cumulative one.
        CREATE TABLE checkpoints (
            id INTEGER PRIMARY KEY,
            sequence INTEGER,
            incremental INTEGER NOT NULL,
            timestamp_ms INTEGER NOT NULL
        );

        -- Addresses are u64 stored bit-for-bit in SQLite's signed INTEGER
        CREATE TABLE function_stats (
            checkpoint_id INTEGER NOT NULL,
            address INTEGER NOT NULL,
            times_called INTEGER NOT NULL,
            exclusive_time INTEGER NOT NULL,
            inclusive_time INTEGER NOT NULL,
            max_reentrance INTEGER NOT NULL,
            max_call_time INTEGER NOT NULL,
            PRIMARY KEY (checkpoint_id, address),
            FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id)
        );

        CREATE INDEX idx_function_address ON function_stats(address);

        -- Per-edge statistics, from the caller's side
        CREATE TABLE callee_stats (
            checkpoint_id INTEGER NOT NULL,
            caller INTEGER NOT NULL,
            callee INTEGER NOT NULL,
            times_called INTEGER NOT NULL,
            exclusive_time INTEGER NOT NULL,
            inclusive_time INTEGER NOT NULL,
            max_reentrance INTEGER NOT NULL,
            max_call_time INTEGER NOT NULL,
            PRIMARY KEY (checkpoint_id, caller, callee),
            FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id)
        );

        -- Call counts, from the callee's side
        CREATE TABLE caller_counts (
            checkpoint_id INTEGER NOT NULL,
            callee INTEGER NOT NULL,
            caller INTEGER NOT NULL,
            count INTEGER NOT NULL,
            PRIMARY KEY (checkpoint_id, callee, caller),
            FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id)
        );
        "#,
    )
}

/// Id of the newest cumulative checkpoint, the base for totals
pub fn get_base_checkpoint(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT MAX(id) FROM checkpoints WHERE incremental = 0",
        [],
        |row| row.get(0),
    )
}

/// Set a metadata key
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        [key, value],
    )?;
    Ok(())
}

/// Get a metadata key
pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
        row.get(0)
    })
    .optional()
}

trait OptionalExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
