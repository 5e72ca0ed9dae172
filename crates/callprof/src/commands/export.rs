use crate::error::Result;
use crate::storage::Storage;
use callprof_trace::encode_snapshot;
use log::info;
use std::path::Path;

/// Fold a recording into one snapshot and write it in the wire payload
/// format, so it can be merged with `decode_into` elsewhere.
///
/// Returns the number of functions written.
pub fn run(file: &Path, output: &Path) -> Result<usize> {
    let storage = Storage::open(file)?;
    let totals = storage.load_totals()?;
    std::fs::write(output, encode_snapshot(&totals)?)?;
    info!(
        "Exported {} functions from {} checkpoints to {}",
        totals.len(),
        storage.checkpoint_count()?,
        output.display()
    );
    Ok(totals.len())
}
