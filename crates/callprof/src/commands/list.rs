use crate::error::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// File name prefix of recordings
pub const PROFILE_PREFIX: &str = "callprof.";

/// Profile info extracted from a database file
pub struct ProfileInfo {
    pub path: PathBuf,
    pub process_name: String,
    pub pid: u32,
    pub duration_secs: f64,
    pub checkpoints: u64,
    pub functions: u64,
    pub created: String,
}

/// Default recording file name for a process
pub fn profile_file_name(process_name: &str) -> PathBuf {
    let timestamp = chrono::Local::now().format("%y%m%d%H%M%S");
    PathBuf::from(format!("{}{}.{}.db", PROFILE_PREFIX, process_name, timestamp))
}

/// Find all callprof profile databases in a directory
pub fn find_profiles(dir: &Path) -> Result<Vec<ProfileInfo>> {
    let mut profiles = Vec::new();

    let entries = std::fs::read_dir(dir)?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "db").unwrap_or(false)
            && let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.starts_with(PROFILE_PREFIX)
            && let Ok(info) = get_profile_info(&path)
        {
            profiles.push(info);
        }
    }

    // RFC 3339 start times sort chronologically; most recent first
    profiles.sort_by(|a, b| b.created.cmp(&a.created));

    Ok(profiles)
}

/// Get the most recent profile in a directory
pub fn most_recent_profile(dir: &Path) -> Result<Option<PathBuf>> {
    let profiles = find_profiles(dir)?;
    Ok(profiles.into_iter().next().map(|p| p.path))
}

/// Extract metadata from a profile database
fn get_profile_info(path: &Path) -> Result<ProfileInfo> {
    let conn = Connection::open(path)?;

    let meta = |key: &str| -> Option<String> {
        conn.query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
            row.get::<_, String>(0)
        })
        .ok()
    };

    let process_name = meta("process_name").unwrap_or_else(|| "unknown".to_string());
    let pid = meta("pid").and_then(|s| s.parse().ok()).unwrap_or(0);
    let created = meta("start_time").unwrap_or_else(|| "unknown".to_string());

    let duration_ms: i64 = conn.query_row(
        "SELECT COALESCE(MAX(timestamp_ms), 0) FROM checkpoints",
        [],
        |row| row.get(0),
    )?;

    let checkpoints: i64 = conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |row| {
        row.get(0)
    })?;

    let functions: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT address) FROM function_stats",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(ProfileInfo {
        path: path.to_path_buf(),
        process_name,
        pid,
        duration_secs: duration_ms as f64 / 1000.0,
        checkpoints: checkpoints as u64,
        functions: functions as u64,
        created,
    })
}

/// Run the list command
pub fn run(dir: Option<&Path>) -> Result<()> {
    let search_dir = dir.unwrap_or_else(|| Path::new("."));
    let profiles = find_profiles(search_dir)?;

    if profiles.is_empty() {
        println!("No callprof profiles found in {}", search_dir.display());
        return Ok(());
    }

    println!(
        "{:<44} {:>14} {:>8} {:>10} {:>12} {:>10}",
        "FILE", "PROCESS", "PID", "DURATION", "CHECKPOINTS", "FUNCTIONS"
    );
    println!("{}", "-".repeat(103));

    for profile in profiles {
        let filename = profile
            .path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();

        let duration = if profile.duration_secs >= 60.0 {
            format!(
                "{:.0}m{:.0}s",
                (profile.duration_secs / 60.0).floor(),
                profile.duration_secs % 60.0
            )
        } else {
            format!("{:.1}s", profile.duration_secs)
        };

        println!(
            "{:<44} {:>14} {:>8} {:>10} {:>12} {:>10}",
            filename,
            profile.process_name,
            profile.pid,
            duration,
            profile.checkpoints,
            profile.functions
        );
    }

    Ok(())
}
