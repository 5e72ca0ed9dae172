use callprof::Error;
use callprof::commands::{export, list, query};
use callprof::storage::Storage;
use callprof_trace::stats::merge_snapshot;
use callprof_trace::{
    Address, DetailedStatistics, FunctionStatistics, ProcessInfo, StatisticsSnapshot,
    decode_snapshot,
};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use tempfile::TempDir;

fn process() -> ProcessInfo {
    ProcessInfo {
        pid: 4321,
        executable: "/opt/app/bin/server".to_string(),
        ticks_per_second: 1_000_000_000,
    }
}

fn profile(dir: &TempDir) -> PathBuf {
    dir.path().join("callprof.server.test.db")
}

fn stats(calls: u64, time: u64, reentrance: u32) -> FunctionStatistics {
    FunctionStatistics {
        times_called: calls,
        exclusive_time: time / 2,
        inclusive_time: time,
        max_reentrance: reentrance,
        max_call_time: time / calls.max(1),
    }
}

/// `caller` calling `callee` `calls` times
fn edge(caller: Address, callee: Address, calls: u64, time: u64) -> StatisticsSnapshot {
    let mut snapshot = StatisticsSnapshot::new();
    snapshot.insert(
        callee,
        DetailedStatistics {
            stats: stats(calls, time, 1),
            callers: [(caller, calls)].into_iter().collect(),
            ..Default::default()
        },
    );
    snapshot.insert(
        caller,
        DetailedStatistics {
            stats: stats(1, time + 10, 2),
            callees: [(callee, stats(calls, time, 1))].into_iter().collect(),
            ..Default::default()
        },
    );
    snapshot
}

#[test]
fn totals_equal_merge_of_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let path = profile(&dir);
    let first = edge(1, 2, 3, 300);
    let second = edge(1, 2, 5, 100);
    let third = edge(7, 2, 1, 40);

    let mut expected = StatisticsSnapshot::new();
    {
        let mut storage = Storage::new(&path, &process()).unwrap();
        for (sequence, snapshot) in [&first, &second, &third].into_iter().enumerate() {
            storage
                .record_snapshot(sequence as u64 + 1, true, snapshot)
                .unwrap();
            merge_snapshot(&mut expected, snapshot);
        }
        assert_eq!(storage.checkpoint_count().unwrap(), 3);
        assert_eq!(storage.load_totals().unwrap(), expected);
    }

    let reopened = Storage::open(&path).unwrap();
    assert_eq!(reopened.load_totals().unwrap(), expected);
    assert_eq!(reopened.meta("pid").unwrap().as_deref(), Some("4321"));
    assert_eq!(reopened.meta("process_name").unwrap().as_deref(), Some("server"));
    assert_eq!(reopened.last_checkpoint(), 3);

    let callee = &expected[&2];
    assert_eq!(callee.stats.times_called, 9);
    assert_eq!(callee.callers[&1], 8);
    assert_eq!(callee.callers[&7], 1);
}

#[test]
fn cumulative_checkpoint_replaces_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = Storage::new(&profile(&dir), &process()).unwrap();

    storage.record_snapshot(1, true, &edge(1, 2, 3, 30)).unwrap();
    let cumulative = edge(1, 2, 10, 100);
    storage.record_snapshot(2, false, &cumulative).unwrap();
    let later = edge(1, 3, 1, 5);
    storage.record_snapshot(3, true, &later).unwrap();

    let mut expected = cumulative.clone();
    merge_snapshot(&mut expected, &later);
    assert_eq!(storage.load_totals().unwrap(), expected);
}

#[test]
fn clear_starts_totals_over() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = Storage::new(&profile(&dir), &process()).unwrap();

    storage.record_snapshot(1, true, &edge(1, 2, 3, 30)).unwrap();
    storage.record_clear().unwrap();
    let after = edge(4, 5, 2, 8);
    storage.record_snapshot(2, true, &after).unwrap();

    assert_eq!(storage.load_totals().unwrap(), after);
    assert_eq!(storage.checkpoint_count().unwrap(), 3);
}

#[test]
fn empty_incremental_snapshot_is_not_stored() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = Storage::new(&profile(&dir), &process()).unwrap();
    assert_eq!(
        storage
            .record_snapshot(1, true, &StatisticsSnapshot::new())
            .unwrap(),
        None
    );
    assert_eq!(storage.checkpoint_count().unwrap(), 0);
    assert!(storage.load_totals().unwrap().is_empty());
}

#[test]
fn full_width_addresses_and_counters_survive() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = Storage::new(&profile(&dir), &process()).unwrap();
    let snapshot = edge(u64::MAX, u64::MAX - 1, 2, u64::MAX - 20);
    storage.record_snapshot(1, true, &snapshot).unwrap();
    assert_eq!(storage.load_totals().unwrap(), snapshot);
}

#[test]
fn open_rejects_missing_and_foreign_files() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("nope.db");
    assert!(matches!(
        Storage::open(&missing),
        Err(Error::InvalidArgument(_))
    ));
    assert!(!missing.exists());

    let foreign = dir.path().join("other.db");
    rusqlite::Connection::open(&foreign)
        .unwrap()
        .execute_batch("CREATE TABLE t (x INTEGER);")
        .unwrap();
    assert!(matches!(Storage::open(&foreign), Err(Error::NotAProfile(_))));
}

#[test]
fn query_list_and_export_read_the_profile() {
    let dir = tempfile::tempdir().unwrap();
    let path = profile(&dir);
    let snapshot = edge(1, 2, 3, 30);
    {
        let mut storage = Storage::new(&path, &process()).unwrap();
        storage.record_snapshot(1, true, &snapshot).unwrap();
    }

    let output = query::execute(&path, "SELECT COUNT(*) AS n FROM function_stats").unwrap();
    assert_eq!(output.columns, vec!["n".to_string()]);
    assert_eq!(output.rows, vec![vec!["2".to_string()]]);

    let profiles = list::find_profiles(dir.path()).unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].process_name, "server");
    assert_eq!(profiles[0].pid, 4321);
    assert_eq!(profiles[0].checkpoints, 1);
    assert_eq!(profiles[0].functions, 2);
    assert_eq!(list::most_recent_profile(dir.path()).unwrap(), Some(path.clone()));

    let exported = dir.path().join("totals.snapshot");
    assert_eq!(export::run(&path, &exported).unwrap(), 2);
    let bytes = std::fs::read(&exported).unwrap();
    assert_eq!(decode_snapshot(&bytes).unwrap(), snapshot);
}

#[test]
fn query_on_missing_file_does_not_create_it() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.db");
    assert!(query::execute(&missing, "SELECT 1").is_err());
    assert!(!missing.exists());
}
