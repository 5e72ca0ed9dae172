use crate::error::{Error, Result};
use rusqlite::Connection;
use rusqlite::types::Value;
use std::path::Path;

/// Column names and rendered rows of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Run `sql` against a profile and collect the rendered result
pub fn execute(file: &Path, sql: &str) -> Result<QueryOutput> {
    // Connection::open would silently create a new database
    if !file.is_file() {
        return Err(Error::InvalidArgument(format!(
            "{} does not exist",
            file.display()
        )));
    }
    let conn = Connection::open(file)?;
    let mut stmt = conn.prepare(sql)?;

    let column_count = stmt.column_count();
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows = stmt.query([])?;
    let mut rendered = Vec::new();
    while let Some(row) = rows.next()? {
        let values: Vec<String> = (0..column_count)
            .map(|i| {
                row.get::<_, Value>(i)
                    .map(|v| format_value(&v))
                    .unwrap_or_else(|_| "NULL".to_string())
            })
            .collect();
        rendered.push(values);
    }

    Ok(QueryOutput {
        columns,
        rows: rendered,
    })
}

/// Print a query result as tab-separated lines, header first
pub fn run(file: &Path, sql: &str) -> Result<()> {
    let output = execute(file, sql)?;
    println!("{}", output.columns.join("\t"));
    for row in output.rows {
        println!("{}", row.join("\t"));
    }
    Ok(())
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => format!("{:.6}", f),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("<blob {} bytes>", b.len()),
    }
}
