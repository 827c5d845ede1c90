//! Newline-delimited file lists handed to external tools and the sync engine.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `paths`, resolved against `root` and deduplicated, one per line.
///
/// The file is removed when the returned handle drops.
pub fn write_file_list<S: AsRef<str>>(paths: &[S], root: &Path) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("updated-")
        .suffix(".txt")
        .tempfile()
        .context("Failed to create file list")?;

    let mut seen = HashSet::new();
    for path in paths {
        let absolute = root.join(path.as_ref());
        if !seen.insert(absolute.clone()) {
            continue;
        }
        writeln!(file, "{}", absolute.display())
            .with_context(|| format!("Failed to write {}", file.path().display()))?;
    }

    file.flush()?;
    Ok(file)
}
